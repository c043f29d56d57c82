//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Abort signalling between the API surface and running builds.
//!
//! The engine subscribes per build; whoever handles an abort request fires
//! the channel. Subscribers never see the bus directly after subscription,
//! they only hold the receiving end.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Default)]
pub struct AbortBus {
    channels: Mutex<HashMap<i32, watch::Sender<bool>>>,
}

impl AbortBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to abort notifications for a build.
    ///
    /// If the abort fired before the subscription, the receiver observes the
    /// aborted state immediately.
    pub fn subscribe(&self, build_id: i32) -> watch::Receiver<bool> {
        let mut channels = self.channels.lock();
        channels
            .entry(build_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Request that a build be aborted.
    pub fn abort(&self, build_id: i32) {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(build_id)
            .or_insert_with(|| watch::channel(false).0);
        let _ = sender.send(true);
    }

    /// Drop the channel of a finished build.
    pub fn forget(&self, build_id: i32) {
        self.channels.lock().remove(&build_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_abort() {
        let bus = AbortBus::new();
        let mut rx = bus.subscribe(1);
        assert!(!*rx.borrow());

        bus.abort(1);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn abort_before_subscribe_is_not_lost() {
        let bus = AbortBus::new();
        bus.abort(7);
        let rx = bus.subscribe(7);
        assert!(*rx.borrow());
    }
}

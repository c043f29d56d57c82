//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! A small in-process read-through cache with per-entry expiry.
//!
//! Cached values (build output sets, version digests) are immutable once
//! written, so nothing ever invalidates entries; they simply age out.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((expiry, value)) if *expiry > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: String, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        // Piggyback expired-entry collection on writes so the map cannot
        // grow without bound between reads.
        if entries.len() > 1024 {
            entries.retain(|_, (expiry, _)| *expiry > now);
        }

        entries.insert(key, (now + self.ttl, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_value_before_expiry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.set("k".to_string(), 1_i32);
        assert_eq!(cache.get("k"), Some(1));
    }

    #[test]
    fn expires_entries() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.set("k".to_string(), 1_i32);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn misses_unknown_keys() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("nope"), None);
    }
}

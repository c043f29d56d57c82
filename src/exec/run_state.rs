//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::resource::Space;
use crate::resource::Version;
use crate::worker::Volume;

/// The version a get or put step resolved, stored under the step's plan id.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionInfo {
    pub space: Space,
    pub version: Version,
}

/// State shared by all steps of one build: the artifact repository and the
/// per-plan result store.
///
/// The engine keeps the state in its tracked-builds map, so a supervisor
/// that re-enters a build after a crash recovers the artifacts registered
/// so far.
#[derive(Default)]
pub struct RunState {
    artifacts: Mutex<HashMap<String, Arc<dyn Volume>>>,
    results: Mutex<HashMap<Uuid, VersionInfo>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_artifact(&self, name: &str, volume: Arc<dyn Volume>) {
        self.artifacts.lock().insert(name.to_string(), volume);
    }

    pub fn artifact(&self, name: &str) -> Option<Arc<dyn Volume>> {
        self.artifacts.lock().get(name).cloned()
    }

    /// All registered artifacts, sorted by name so that container mount
    /// layouts are deterministic.
    pub fn artifacts(&self) -> Vec<(String, Arc<dyn Volume>)> {
        let mut artifacts: Vec<_> = self
            .artifacts
            .lock()
            .iter()
            .map(|(name, volume)| (name.clone(), volume.clone()))
            .collect();
        artifacts.sort_by(|a, b| a.0.cmp(&b.0));
        artifacts
    }

    pub fn store_result(&self, plan_id: Uuid, info: VersionInfo) {
        self.results.lock().insert(plan_id, info);
    }

    pub fn result(&self, plan_id: &Uuid) -> Option<VersionInfo> {
        self.results.lock().get(plan_id).cloned()
    }
}

//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The build plan: the serialisable description a step tree is built from.
//!
//! Plans are produced elsewhere (the scheduler) and stored on the build
//! row; this module only defines their shape.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::resource::Params;
use crate::resource::Source;
use crate::resource::Space;
use crate::resource::Version;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    #[serde(flatten)]
    pub step: PlanStep,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    Get {
        name: String,
        #[serde(rename = "type")]
        type_: String,
        /// The pipeline resource this get reads; anonymous gets have none.
        resource: Option<String>,
        source: Source,
        #[serde(default)]
        params: Params,
        space: Option<Space>,
        version: Option<Version>,
    },
    Put {
        name: String,
        #[serde(rename = "type")]
        type_: String,
        /// The pipeline resource outputs are recorded against; without one
        /// nothing is persisted.
        resource: Option<String>,
        source: Source,
        #[serde(default)]
        params: Params,
    },
    Task {
        name: String,
        image: String,
        path: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Aggregate {
        steps: Vec<Plan>,
    },
    Do {
        steps: Vec<Plan>,
    },
    Try {
        inner: Box<Plan>,
    },
    Timeout {
        seconds: u64,
        inner: Box<Plan>,
    },
    OnSuccess {
        inner: Box<Plan>,
        hook: Box<Plan>,
    },
    OnFailure {
        inner: Box<Plan>,
        hook: Box<Plan>,
    },
    OnAbort {
        inner: Box<Plan>,
        hook: Box<Plan>,
    },
    Ensure {
        inner: Box<Plan>,
        hook: Box<Plan>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_roundtrip_through_json() {
        let plan = Plan {
            id: Uuid::new_v4(),
            step: PlanStep::OnSuccess {
                inner: Box::new(Plan {
                    id: Uuid::new_v4(),
                    step: PlanStep::Get {
                        name: "sources".to_string(),
                        type_: "git".to_string(),
                        resource: Some("repo".to_string()),
                        source: Source::new(),
                        params: Params::new(),
                        space: None,
                        version: None,
                    },
                }),
                hook: Box::new(Plan {
                    id: Uuid::new_v4(),
                    step: PlanStep::Task {
                        name: "unit".to_string(),
                        image: "builder".to_string(),
                        path: "/usr/bin/make".to_string(),
                        args: vec!["test".to_string()],
                    },
                }),
            },
        };

        let json = serde_json::to_value(&plan).unwrap();
        let parsed: Plan = serde_json::from_value(json).unwrap();

        match parsed.step {
            PlanStep::OnSuccess { inner, hook } => {
                assert!(matches!(inner.step, PlanStep::Get { .. }));
                assert!(matches!(hook.step, PlanStep::Task { .. }));
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }
}

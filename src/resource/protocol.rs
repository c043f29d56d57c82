//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Wire types of the v2 resource protocol.
//!
//! A process receives one JSON request on stdin and leaves a response file
//! behind which is streamed out as a tar archive. The response file holds
//! newline-delimited JSON events discriminated by an `action` field.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::resource::Metadata;
use crate::resource::ResourceError;
use crate::resource::Source;
use crate::resource::Space;
use crate::resource::Version;

#[derive(Serialize, Debug)]
pub struct CheckRequest<'a> {
    pub config: &'a Source,
    pub from: &'a BTreeMap<Space, Version>,
    pub response_path: &'a str,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetRequest {
    pub config: Source,
    pub space: Space,
    pub version: Version,
    pub response_path: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PutRequest {
    pub config: Source,
    pub response_path: String,
}

/// One line of a response file.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Event {
    DefaultSpace {
        space: Space,
    },
    Discovered {
        space: Space,
        version: Version,
        #[serde(default)]
        metadata: Metadata,
    },
    LatestVersions {},
    Created {
        space: Space,
        version: Version,
        #[serde(default)]
        metadata: Metadata,
    },
    Fetched {
        space: Space,
        version: Version,
        #[serde(default)]
        metadata: Metadata,
    },
}

const KNOWN_ACTIONS: &[&str] = &[
    "default_space",
    "discovered",
    "latest_versions",
    "created",
    "fetched",
];

/// Parse a single response line.
///
/// An unrecognised `action` is a protocol-level condition of its own and is
/// reported as [ResourceError::ActionNotFound]; anything else that does not
/// parse is a [ResourceError::DecodeError].
pub fn parse_event(line: &str) -> Result<Event, ResourceError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ResourceError::DecodeError(e.to_string()))?;

    let action = value
        .get("action")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ResourceError::DecodeError("event without action".to_string()))?;

    if !KNOWN_ACTIONS.contains(&action) {
        return Err(ResourceError::ActionNotFound {
            action: action.to_string(),
        });
    }

    serde_json::from_value(value).map_err(|e| ResourceError::DecodeError(e.to_string()))
}

/// Parse a whole response file into events, skipping blank lines.
pub fn parse_events(content: &str) -> Result<Vec<Event>, ResourceError> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_event)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_discovered_event() {
        let ev = parse_event(
            r#"{"action": "discovered", "space": "main", "version": {"ref": "abc"}, "metadata": [{"name": "author", "value": "me"}]}"#,
        )
        .unwrap();

        assert_eq!(
            ev,
            Event::Discovered {
                space: Space::from("main"),
                version: Version::from([("ref", "abc")]),
                metadata: vec![crate::resource::MetadataField {
                    name: "author".to_string(),
                    value: "me".to_string(),
                }],
            }
        );
    }

    #[test]
    fn parses_events_without_metadata() {
        let ev = parse_event(r#"{"action": "created", "space": "s", "version": {"v": "1"}}"#)
            .unwrap();
        assert_eq!(
            ev,
            Event::Created {
                space: Space::from("s"),
                version: Version::from([("v", "1")]),
                metadata: vec![],
            }
        );
    }

    #[test]
    fn unknown_action_is_its_own_error() {
        let err = parse_event(r#"{"action": "explode"}"#).unwrap_err();
        match err {
            ResourceError::ActionNotFound { action } => assert_eq!(action, "explode"),
            other => panic!("expected ActionNotFound, got {other:?}"),
        }
    }

    #[test]
    fn malformed_line_is_a_decode_error() {
        assert!(matches!(
            parse_event("{not json"),
            Err(ResourceError::DecodeError(_))
        ));
        assert!(matches!(
            parse_event(r#"{"space": "s"}"#),
            Err(ResourceError::DecodeError(_))
        ));
    }

    #[test]
    fn parses_multiline_response() {
        let events = parse_events(
            "\n{\"action\": \"default_space\", \"space\": \"main\"}\n\n{\"action\": \"latest_versions\"}\n",
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            Event::DefaultSpace {
                space: Space::from("main")
            }
        );
        assert_eq!(events[1], Event::LatestVersions {});
    }
}

//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

/// Process id used for resource check invocations.
///
/// The ids are stable so that a supervisor which lost its connection can
/// re-attach to a process that is still running inside the container instead
/// of starting the work over.
pub const CHECK_PROCESS_ID: &str = "check";

/// Process id used for resource get invocations.
pub const GET_PROCESS_ID: &str = "get";

/// Process id used for resource put invocations.
pub const PUT_PROCESS_ID: &str = "put";

/// Process id used for the resource info probe.
pub const INFO_PROCESS_ID: &str = "info";

/// The path inside the container where the request payload for a resource
/// process is placed before the process is started.
pub const REQUEST_PATH: &str = "/tmp/resource/request";

/// The path inside the container where a resource process must write its
/// newline-delimited event stream before exiting.
pub const RESPONSE_PATH: &str = "/tmp/resource/response";

/// The directory inside a put container where the artifacts of the current
/// build are mounted as inputs.
pub const PUT_INPUTS_DIR_PATH: &str = "/tmp/build/put";

/// The directory inside a get container where the fetched artifact must be
/// placed.
pub const GET_ARTIFACT_DIR_PATH: &str = "/tmp/build/get";

/// The directory inside a task container where input artifacts are mounted.
pub const TASK_INPUTS_DIR_PATH: &str = "/tmp/build/task";

/// The file inside a fetched image volume that carries the image metadata.
pub const IMAGE_METADATA_FILE: &str = "metadata.json";

/// The space name that versions of a v1 resource are recorded under.
pub const V1_SPACE_NAME: &str = "v1space";

/// The artifact API version spoken by the v2 protocol driver.
pub const V2_API_VERSION: &str = "2.0";

//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The execution and version tracking core of a container-native CI
//! control plane.
//!
//! The building blocks, leaves first:
//!
//! * [resource] speaks the resource wire protocol to containers and
//!   discovers/creates versions,
//! * [radar] accumulates the events of a resource check into the store,
//! * [db] is the postgres model: resources, scopes, spaces, versions,
//!   builds and their edges, plus the paginated build walker and the
//!   [db::VersionsDb] query surface the scheduler resolves inputs with,
//! * [exec] runs a build's step tree against worker containers,
//! * [engine] supervises builds, honouring aborts and draining cleanly,
//! * [worker] is the container runtime boundary with a bundled docker
//!   implementation.

#[macro_use]
extern crate diesel;

pub mod config;
pub mod consts;
pub mod db;
pub mod engine;
pub mod exec;
pub mod radar;
pub mod resource;
pub mod schema;
pub mod util;
pub mod worker;

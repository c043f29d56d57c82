//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

mod build;
pub use build::*;

mod job;
pub use job::*;

mod pipeline;
pub use pipeline::*;

mod resource;
pub use resource::*;

mod resource_config;
pub use resource_config::*;

mod resource_type;
pub use resource_type::*;

mod scope;
pub use scope::*;

mod space;
pub use space::*;

mod version;
pub use version::*;

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

use getset::Getters;
use serde::Deserialize;

use crate::config::Endpoint;
use crate::util::docker::ImageName;

#[derive(Debug, Getters, Deserialize)]
pub struct DockerConfig {
    /// The container image each base resource type's scripts run in.
    ///
    /// User-declared resource types resolve (through their own type chain)
    /// down to one of these.
    #[getset(get = "pub")]
    images: HashMap<String, ImageName>,

    #[getset(get = "pub")]
    endpoints: Vec<Endpoint>,
}

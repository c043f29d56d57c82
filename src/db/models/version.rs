//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::Context;
use anyhow::Result;
use diesel::prelude::*;

use crate::db::models::Space;
use crate::resource::Metadata;
use crate::resource::Version;
use crate::resource::VersionDigest;
use crate::schema::resource_versions;

/// A version row.
///
/// `version` and `metadata` are stored as jsonb; `version_md5` is the digest
/// of the canonically serialised version map and is the handle every other
/// table refers to versions by.
#[derive(Debug, Clone, PartialEq, Identifiable, Queryable, Associations)]
#[diesel(belongs_to(Space))]
#[diesel(table_name = resource_versions)]
pub struct ResourceVersion {
    pub id: i32,
    pub space_id: i32,
    pub version: serde_json::Value,
    pub version_md5: String,
    pub metadata: serde_json::Value,
    pub check_order: i32,
    pub partial: bool,
}

impl ResourceVersion {
    pub fn version(&self) -> Result<Version> {
        serde_json::from_value(self.version.clone()).context("Deserialising version map")
    }

    pub fn metadata(&self) -> Result<Metadata> {
        serde_json::from_value(self.metadata.clone()).context("Deserialising version metadata")
    }

    pub fn digest(&self) -> VersionDigest {
        VersionDigest::from(self.version_md5.clone())
    }
}

#[derive(Debug, Eq, PartialEq, Queryable)]
pub struct DisabledVersion {
    pub resource_id: i32,
    pub version_md5: String,
}

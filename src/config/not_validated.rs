//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use getset::CopyGetters;
use getset::Getters;
use serde::Deserialize;

use crate::config::util::*;
use crate::config::Configuration;
use crate::config::DockerConfig;

// The configuration version must be increased each time breaking
// configuration changes are made (that require users to update their
// configurations).
const CONFIGURATION_VERSION: u16 = 1;

/// The configuration that is loaded from the filesystem
#[derive(Debug, Getters, CopyGetters, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotValidatedConfiguration {
    /// Compatibility setting to check whether the configuration from the
    /// user is compatible with this binary.
    #[getset(get_copy = "pub")]
    compatibility: u16,

    /// The URL this control plane is reachable under, handed to resource
    /// scripts that want to link back.
    #[getset(get = "pub")]
    external_url: Option<String>,

    /// Page size of the build walker and bound of a single lazy migration
    /// batch.
    #[serde(default = "default_limit_rows")]
    #[getset(get_copy = "pub")]
    limit_rows: usize,

    /// TTL in seconds of the build tracking lock. A crashed tracker loses
    /// the lock within this bound; the engine never renews it.
    #[serde(default = "default_lock_ttl")]
    #[getset(get_copy = "pub")]
    lock_ttl: u64,

    /// TTL in seconds of the in-process read cache for build outputs and
    /// version lookups.
    #[serde(default = "default_cache_ttl")]
    #[getset(get_copy = "pub")]
    cache_ttl: u64,

    /// Delay in seconds between retries of the volume-creating lock.
    #[serde(default = "default_volume_retry_delay")]
    #[getset(get_copy = "pub")]
    volume_retry_delay: u64,

    /// How often resources are checked for new versions, in seconds.
    #[serde(default = "default_resource_checking_interval")]
    #[getset(get_copy = "pub")]
    resource_checking_interval: u64,

    /// How often resource types are checked for new versions, in seconds.
    #[serde(default = "default_resource_type_checking_interval")]
    #[getset(get_copy = "pub")]
    resource_type_checking_interval: u64,

    /// How often the engine looks for builds to supervise, in seconds.
    #[serde(default = "default_build_tracking_interval")]
    #[getset(get_copy = "pub")]
    build_tracking_interval: u64,

    /// Where artifact volumes are kept on the worker host.
    #[serde(rename = "volumes_root")]
    #[getset(get = "pub")]
    volumes_root: PathBuf,

    /// The hostname/FQDN/IP used to connect to the database
    #[getset(get = "pub")]
    database_host: String,

    /// The port used to connect to the database
    #[getset(get = "pub")]
    database_port: u16,

    /// The user used to connect to the database
    #[getset(get = "pub")]
    database_user: String,

    /// The password used to connect to the database
    #[getset(get = "pub")]
    database_password: String,

    /// The name of the database
    #[getset(get = "pub")]
    database_name: String,

    /// The database connection timeout in seconds
    #[getset(get_copy = "pub")]
    #[serde(default)]
    database_connection_timeout: Option<u16>,

    /// The configuration for the docker endpoints and resource images
    #[getset(get = "pub")]
    docker: DockerConfig,
}

// Helper function to check if the configuration should be compatible
// before loading (type checking) it:
pub fn check_compatibility(config: &config::Config) -> Result<()> {
    let compatibility = config.get_string("compatibility").context(
        "Make sure that the conveyor configuration is present and that \"compatibility\" is set",
    )?;

    let compatibility = compatibility.parse::<u16>().with_context(|| {
        anyhow!(
            "Failed to parse the value of the compatibility setting ({}) into a number",
            compatibility
        )
    })?;

    if compatibility == CONFIGURATION_VERSION {
        Ok(())
    } else {
        Err(anyhow!(
            "The provided configuration is not compatible with this conveyor binary"
        ))
        .with_context(|| {
            anyhow!(
                "The expected configuration version is {} while the provided configuration has a compatibility setting of {}",
                CONFIGURATION_VERSION,
                compatibility,
            )
        })
    }
}

impl NotValidatedConfiguration {
    /// Validate the NotValidatedConfiguration object and make it into a
    /// Configuration object, if validation succeeds
    pub fn validate(self) -> Result<Configuration> {
        self.validate_config(false)
    }

    fn validate_config(self, skip_filesystem_checks: bool) -> Result<Configuration> {
        if self.compatibility != CONFIGURATION_VERSION {
            anyhow::bail!("The provided configuration is not compatible with this conveyor binary");
        }

        if !skip_filesystem_checks && !self.volumes_root.is_dir() {
            anyhow::bail!("Not a directory: volumes_root = {}", self.volumes_root.display());
        }

        if self.docker.endpoints().is_empty() {
            anyhow::bail!("You need at least one docker endpoint in 'docker.endpoints'");
        }

        if self.docker.images().is_empty() {
            anyhow::bail!("No resource type images configured in 'docker.images'");
        }

        if self.limit_rows == 0 {
            anyhow::bail!("limit_rows must be at least 1");
        }

        Ok(Configuration { inner: self })
    }
}

#[cfg(test)]
mod tests {
    use super::check_compatibility;
    use super::NotValidatedConfiguration;

    use anyhow::Result;

    // A helper function to load and validate conveyor configuration files:
    fn test_loading_configuration_file(file_path: &str) -> Result<()> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(file_path))
            .build()?;
        assert!(check_compatibility(&config).is_ok());
        let config = config.try_deserialize::<NotValidatedConfiguration>();
        assert!(config.is_ok(), "Config loading failed: {config:?}");
        let config = config.unwrap().validate_config(true);
        assert!(config.is_ok(), "Config validation failed: {config:?}");

        Ok(())
    }

    #[test]
    // A test to ensure the example configuration file is up-to-date and valid
    fn test_loading_example_configuration_file() -> Result<()> {
        test_loading_configuration_file("config.toml")?;
        Ok(())
    }
}

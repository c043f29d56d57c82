//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::anyhow;
use anyhow::Result;
use tracing::debug;

use conveyor::config::check_compatibility;
use conveyor::config::Configuration;
use conveyor::config::NotValidatedConfiguration;
use conveyor::db::DbConnectionConfig;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    debug!("Debugging enabled");

    let cli = cli::cli();
    let cli = cli.get_matches();

    let config = ::config::Config::builder()
        .add_source(::config::File::with_name("config"))
        .add_source(::config::Environment::with_prefix("CONVEYOR"))
        .build()?;
    check_compatibility(&config)?;

    let config: Configuration = config
        .try_deserialize::<NotValidatedConfiguration>()?
        .validate()?;

    match cli.subcommand() {
        Some(("run", matches)) => {
            let pool = DbConnectionConfig::parse(&config, &cli)?.establish_pool()?;
            commands::run(matches, &config, pool).await
        }
        Some((other, _)) => Err(anyhow!("Unknown subcommand: {other}")),
        None => Err(anyhow!("No subcommand given")),
    }
}

//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Implementation of the 'run' subcommand: the engine daemon loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::ArgMatches;
use tracing::debug;
use tracing::error;
use tracing::info;

use conveyor::config::Configuration;
use conveyor::db::models::Build;
use conveyor::db::AbortBus;
use conveyor::db::DbPool;
use conveyor::db::LockService;
use conveyor::db::PgLockService;
use conveyor::engine::DbTrackedBuild;
use conveyor::engine::EngineSetup;
use conveyor::exec::StepFactory;
use conveyor::worker::docker::DockerWorker;
use conveyor::worker::VolumeClient;
use conveyor::worker::Worker;

pub async fn run(_matches: &ArgMatches, config: &Configuration, pool: DbPool) -> Result<()> {
    let endpoint = config
        .docker()
        .endpoints()
        .first()
        .ok_or_else(|| anyhow!("No docker endpoint configured"))?;

    info!(endpoint = %endpoint.name(), "connecting to worker");
    let worker: Arc<dyn Worker> = Arc::new(DockerWorker::connect(endpoint)?);

    let locks: Arc<dyn LockService> = Arc::new(PgLockService::new(pool.clone()));
    let lock_ttl = Duration::from_secs(config.lock_ttl());

    let volumes = Arc::new(VolumeClient::new(
        config.volumes_root().clone(),
        locks.clone(),
        Duration::from_secs(config.volume_retry_delay()),
        lock_ttl,
    ));

    let factory = Arc::new(StepFactory::new(
        pool.clone(),
        worker,
        volumes,
        config.docker().images().clone(),
    ));

    let aborts = Arc::new(AbortBus::new());
    let engine = EngineSetup::<DbTrackedBuild, _>::builder()
        .builder(factory)
        .locks(locks)
        .aborts(aborts)
        .lock_ttl(lock_ttl)
        .build()
        .setup();

    let mut interval =
        tokio::time::interval(Duration::from_secs(config.build_tracking_interval()));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let builds = {
                    let mut conn = pool.get().context("Getting connection for tracking")?;
                    Build::all_running(&mut conn)
                };

                match builds {
                    Ok(builds) => {
                        debug!(count = builds.len(), "tracking builds");
                        for build in builds {
                            engine.spawn(DbTrackedBuild::new(pool.clone(), build));
                        }
                    }
                    Err(e) => error!(error = %e, "failed to list running builds"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested, draining builds");
                engine.release_all().await;
                break;
            }
        }
    }

    Ok(())
}

//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The shared lock service.
//!
//! Locks coordinate work between control plane replicas: at most one engine
//! instance may track a given build, and at most one task may create a given
//! volume. Acquisition is non-blocking; contention is a normal outcome, not
//! an error.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use diesel::prelude::*;
use diesel::r2d2::ConnectionManager;
use diesel::r2d2::PooledConnection;
use diesel::sql_query;
use diesel::sql_types::BigInt;
use tracing::trace;
use tracing::warn;

use crate::db::DbPool;

/// Identities of the locks this core takes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockId {
    BuildTracking(i32),
    VolumeCreating(String),
}

impl LockId {
    /// Map the lock identity onto the lock service's 64 bit key space.
    ///
    /// The upper byte partitions by lock class so that a build id can never
    /// collide with a volume key.
    pub fn key(&self) -> i64 {
        match self {
            LockId::BuildTracking(build_id) => (1_i64 << 56) | (*build_id as i64),
            LockId::VolumeCreating(handle) => {
                let digest = md5::compute(handle.as_bytes());
                let mut low = [0_u8; 8];
                low.copy_from_slice(&digest.0[..8]);
                // Keep the partition byte, fold the digest into the rest.
                (2_i64 << 56) | (i64::from_be_bytes(low) & 0x00ff_ffff_ffff_ffff)
            }
        }
    }
}

/// A held lock. Dropping the guard releases it.
pub trait LockGuard: Send {}

pub type Lock = Box<dyn LockGuard>;

pub trait LockService: Send + Sync {
    /// Try to take the lock. Returns `None` when somebody else holds it.
    ///
    /// `ttl` bounds how long a crashed holder can keep the lock; how the
    /// bound is enforced is the service's business.
    fn acquire(&self, id: &LockId, ttl: Duration) -> Result<Option<Lock>>;
}

#[derive(QueryableByName)]
struct Acquired {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    acquired: bool,
}

/// Lock service backed by postgres session advisory locks.
///
/// A lock is held for as long as the guard (and with it the underlying
/// session) lives; the server releases it when the session ends, which is
/// what bounds the hold time of a crashed process.
pub struct PgLockService {
    pool: DbPool,
}

impl PgLockService {
    pub fn new(pool: DbPool) -> Self {
        PgLockService { pool }
    }
}

struct PgLock {
    conn: Option<PooledConnection<ConnectionManager<PgConnection>>>,
    key: i64,
}

impl LockGuard for PgLock {}

impl Drop for PgLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let unlocked = sql_query("SELECT pg_advisory_unlock($1) AS acquired")
                .bind::<BigInt, _>(self.key)
                .get_result::<Acquired>(&mut conn);

            if let Err(e) = unlocked {
                // The session will release the lock when the connection dies.
                warn!(key = self.key, error = %e, "failed to release advisory lock");
            }
        }
    }
}

impl LockService for PgLockService {
    fn acquire(&self, id: &LockId, ttl: Duration) -> Result<Option<Lock>> {
        let key = id.key();
        let mut conn = self.pool.get().context("Getting connection for lock")?;

        let result: Acquired = sql_query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind::<BigInt, _>(key)
            .get_result(&mut conn)
            .context("Acquiring advisory lock")?;

        trace!(?id, key, acquired = result.acquired, ttl_secs = ttl.as_secs(), "lock attempt");

        if result.acquired {
            Ok(Some(Box::new(PgLock {
                conn: Some(conn),
                key,
            })))
        } else {
            Ok(None)
        }
    }
}

/// In-process lock service for tests.
#[derive(Default)]
pub struct InMemoryLockService {
    held: std::sync::Arc<parking_lot::Mutex<std::collections::HashSet<i64>>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

struct InMemoryLock {
    held: std::sync::Arc<parking_lot::Mutex<std::collections::HashSet<i64>>>,
    key: i64,
}

impl LockGuard for InMemoryLock {}

impl Drop for InMemoryLock {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

impl LockService for InMemoryLockService {
    fn acquire(&self, id: &LockId, _ttl: Duration) -> Result<Option<Lock>> {
        let key = id.key();
        if self.held.lock().insert(key) {
            Ok(Some(Box::new(InMemoryLock {
                held: self.held.clone(),
                key,
            })))
        } else {
            Ok(None)
        }
    }
}

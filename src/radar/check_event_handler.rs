//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Accumulates the events of one resource check into the version store.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;
use tracing::trace;

use crate::db::models::ResourceConfigScope;
use crate::db::DbPool;
use crate::resource;
use crate::resource::Metadata;
use crate::resource::Space;
use crate::resource::Version;

/// The store operations a check writes through.
///
/// Every operation is an individual short statement; container I/O never
/// holds a database transaction. Atomicity of a whole check comes from the
/// partial flag: nothing a check writes is visible until
/// [VersionSink::finish_saving_versions] promotes it.
pub trait VersionSink: Send {
    fn save_default_space(&mut self, space: &Space) -> Result<()>;
    fn save_space(&mut self, space: &Space) -> Result<()>;
    fn save_partial_version(
        &mut self,
        space: &Space,
        version: &Version,
        metadata: &Metadata,
    ) -> Result<()>;
    fn finish_saving_versions(&mut self) -> Result<()>;
    fn save_space_latest_version(&mut self, space: &Space, version: &Version) -> Result<()>;
    fn update_last_check_finished(&mut self) -> Result<bool>;
}

/// [VersionSink] writing through a resource config scope.
pub struct ScopeVersionSink {
    pool: DbPool,
    scope: ResourceConfigScope,
}

impl ScopeVersionSink {
    pub fn new(pool: DbPool, scope: ResourceConfigScope) -> Self {
        ScopeVersionSink { pool, scope }
    }
}

impl VersionSink for ScopeVersionSink {
    fn save_default_space(&mut self, space: &Space) -> Result<()> {
        let mut conn = self.pool.get()?;
        self.scope.save_default_space(&mut conn, space)
    }

    fn save_space(&mut self, space: &Space) -> Result<()> {
        let mut conn = self.pool.get()?;
        self.scope.save_space(&mut conn, space)
    }

    fn save_partial_version(
        &mut self,
        space: &Space,
        version: &Version,
        metadata: &Metadata,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        self.scope
            .save_partial_version(&mut conn, space, version, metadata)
    }

    fn finish_saving_versions(&mut self) -> Result<()> {
        let mut conn = self.pool.get()?;
        self.scope.finish_saving_versions(&mut conn).map(|_| ())
    }

    fn save_space_latest_version(&mut self, space: &Space, version: &Version) -> Result<()> {
        let mut conn = self.pool.get()?;
        self.scope
            .save_space_latest_version(&mut conn, space, version)
    }

    fn update_last_check_finished(&mut self) -> Result<bool> {
        let mut conn = self.pool.get()?;
        self.scope.update_last_check_finished(&mut conn)
    }
}

/// The event handler a check run drives.
///
/// Tracks which spaces the run touched and their most recent version, so
/// that finishing the check can stamp each space's latest pointer.
pub struct CheckEventHandler<S> {
    sink: S,
    spaces: BTreeMap<Space, Version>,
}

impl<S: VersionSink> CheckEventHandler<S> {
    pub fn new(sink: S) -> Self {
        CheckEventHandler {
            sink,
            spaces: BTreeMap::new(),
        }
    }

    /// The spaces this check discovered versions in, with each space's most
    /// recent version.
    pub fn into_spaces(self) -> BTreeMap<Space, Version> {
        self.spaces
    }
}

#[async_trait]
impl<S: VersionSink> resource::CheckEventHandler for CheckEventHandler<S> {
    async fn default_space(&mut self, space: Space) -> Result<()> {
        if space.is_empty() {
            return Ok(());
        }

        self.sink.save_default_space(&space)?;
        debug!(%space, "default space saved");
        Ok(())
    }

    async fn discovered(&mut self, space: Space, version: Version, metadata: Metadata) -> Result<()> {
        if !self.spaces.contains_key(&space) {
            self.sink.save_space(&space)?;
            debug!(%space, "space saved");
        }

        self.sink.save_partial_version(&space, &version, &metadata)?;
        trace!(%space, version = %version.digest(), "partial version saved");

        self.spaces.insert(space, version);
        Ok(())
    }

    async fn latest_versions(&mut self) -> Result<()> {
        if self.spaces.is_empty() {
            // A check that found nothing does not advance
            // last_check_finished: a failing check must not masquerade as a
            // fresh successful one.
            debug!("no new versions");
            return Ok(());
        }

        self.sink.finish_saving_versions()?;

        let updated = self.sink.update_last_check_finished()?;
        if !updated {
            debug!("did not update last check finished");
        }

        for (space, version) in &self.spaces {
            self.sink.save_space_latest_version(space, version)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::CheckEventHandler as _;

    #[derive(Debug, PartialEq, Eq)]
    enum Op {
        SaveDefaultSpace(String),
        SaveSpace(String),
        SavePartial(String, String),
        Finish,
        SaveLatest(String, String),
        UpdateLastCheckFinished,
    }

    #[derive(Default)]
    struct RecordingSink {
        ops: Vec<Op>,
    }

    impl VersionSink for RecordingSink {
        fn save_default_space(&mut self, space: &Space) -> Result<()> {
            self.ops.push(Op::SaveDefaultSpace(space.to_string()));
            Ok(())
        }

        fn save_space(&mut self, space: &Space) -> Result<()> {
            self.ops.push(Op::SaveSpace(space.to_string()));
            Ok(())
        }

        fn save_partial_version(
            &mut self,
            space: &Space,
            version: &Version,
            _metadata: &Metadata,
        ) -> Result<()> {
            self.ops
                .push(Op::SavePartial(space.to_string(), version.canonical_json()));
            Ok(())
        }

        fn finish_saving_versions(&mut self) -> Result<()> {
            self.ops.push(Op::Finish);
            Ok(())
        }

        fn save_space_latest_version(&mut self, space: &Space, version: &Version) -> Result<()> {
            self.ops
                .push(Op::SaveLatest(space.to_string(), version.canonical_json()));
            Ok(())
        }

        fn update_last_check_finished(&mut self) -> Result<bool> {
            self.ops.push(Op::UpdateLastCheckFinished);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn empty_default_space_is_ignored() {
        let mut handler = CheckEventHandler::new(RecordingSink::default());
        handler.default_space(Space::from("")).await.unwrap();
        assert!(handler.sink.ops.is_empty());
    }

    #[tokio::test]
    async fn spaces_are_saved_once_and_versions_always() {
        let mut handler = CheckEventHandler::new(RecordingSink::default());

        handler
            .discovered(Space::from("main"), Version::from([("ref", "a")]), vec![])
            .await
            .unwrap();
        handler
            .discovered(Space::from("main"), Version::from([("ref", "b")]), vec![])
            .await
            .unwrap();

        assert_eq!(
            handler.sink.ops,
            vec![
                Op::SaveSpace("main".into()),
                Op::SavePartial("main".into(), r#"{"ref":"a"}"#.into()),
                Op::SavePartial("main".into(), r#"{"ref":"b"}"#.into()),
            ]
        );
    }

    #[tokio::test]
    async fn finishing_promotes_then_stamps_then_points_latest() {
        let mut handler = CheckEventHandler::new(RecordingSink::default());

        handler
            .discovered(Space::from("main"), Version::from([("ref", "a")]), vec![])
            .await
            .unwrap();
        handler
            .discovered(Space::from("main"), Version::from([("ref", "b")]), vec![])
            .await
            .unwrap();
        handler.latest_versions().await.unwrap();

        assert_eq!(
            &handler.sink.ops[2..],
            &[
                Op::SavePartial("main".into(), r#"{"ref":"b"}"#.into()),
                Op::Finish,
                Op::UpdateLastCheckFinished,
                // The most recent version discovered in the space wins.
                Op::SaveLatest("main".into(), r#"{"ref":"b"}"#.into()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_check_does_not_advance_the_check_timestamp() {
        let mut handler = CheckEventHandler::new(RecordingSink::default());
        handler.latest_versions().await.unwrap();
        assert!(handler.sink.ops.is_empty());
    }
}

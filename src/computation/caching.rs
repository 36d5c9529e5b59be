use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::artifact::{Artifact, Record, TaskKind, Upstream};
use crate::cache::{CacheDir, Chunks};
use crate::computation::Computation;
use crate::error::{ComputationError, Error};
use crate::status::{Properties, Status};

/// Status property holding the cache file of a READY artifact.
pub const PATH_PROPERTY: &str = "path";


/// Materializes an artifact's upstream rows into the cache directory.
///
/// Rows are staged per attempt and renamed onto `cache_path` only while the
/// attempt owns the status record, so a reclaimed worker finishing late never
/// touches a published file. Readers go through `task_result`.
pub struct CachingComputation {
    upstream: Arc<dyn Upstream>,
    cache: CacheDir,
}

impl CachingComputation {
    pub fn new(upstream: Arc<dyn Upstream>, cache: CacheDir) -> Self {
        Self { upstream, cache }
    }

    pub fn cache_path(&self, artifact: &Artifact) -> PathBuf {
        self.cache.cache_path(artifact)
    }
}

impl Computation for CachingComputation {
    type Output = Chunks;
    /// Records per chunk.
    type Args = usize;

    fn kind(&self) -> TaskKind {
        TaskKind::TO_CACHE
    }

    fn execute<'a>(
        &'a self,
        artifact: &'a Artifact,
        attempt: Uuid,
    ) -> BoxFuture<'a, Result<Properties, ComputationError>> {
        async move {
            let records: Vec<Record> = self.upstream.produce(artifact).try_concat().await?;
            self.cache.stage(artifact, attempt, &records).await?;

            let mut properties = Properties::new();
            let path = self.cache.cache_path(artifact);
            properties.insert(PATH_PROPERTY.to_string(), path.display().to_string());
            Ok(properties)
        }
        .boxed()
    }

    fn publish(&self, artifact: &Artifact, attempt: Uuid) -> io::Result<()> {
        let path = self.cache.publish(artifact, attempt)?;
        info!(artifact = %artifact, %attempt, path = %path.display(), "artifact cached");
        Ok(())
    }

    fn discard<'a>(&'a self, artifact: &'a Artifact, attempt: Uuid) -> BoxFuture<'a, ()> {
        self.cache.discard(artifact, attempt).boxed()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        status: &Status,
        batch_size: usize,
    ) -> Result<Chunks, Error> {
        let path = status.property(PATH_PROPERTY).ok_or_else(|| Error::MissingProperty {
            task: format!("{}/{}", TaskKind::TO_CACHE, artifact),
            property: PATH_PROPERTY,
        })?;
        Chunks::open(path, batch_size)
    }
}

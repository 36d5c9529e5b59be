use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use std::sync::Arc;
use uuid::Uuid;

use crate::artifact::{Artifact, TaskKind, Upstream};
use crate::computation::Computation;
use crate::error::{ComputationError, Error};
use crate::status::{Properties, Status};

pub const ROWS_PROPERTY: &str = "rows";


/// Row count of an artifact, carried inline in the status properties.
pub struct SizeComputation {
    upstream: Arc<dyn Upstream>,
}

impl SizeComputation {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }
}

impl Computation for SizeComputation {
    type Output = u64;
    type Args = ();

    fn kind(&self) -> TaskKind {
        TaskKind::SIZE
    }

    fn execute<'a>(
        &'a self,
        artifact: &'a Artifact,
        _attempt: Uuid,
    ) -> BoxFuture<'a, Result<Properties, ComputationError>> {
        async move {
            let rows = self
                .upstream
                .produce(artifact)
                .try_fold(0u64, |rows, batch| async move { Ok(rows + batch.len() as u64) })
                .await?;

            let mut properties = Properties::new();
            properties.insert(ROWS_PROPERTY.to_string(), rows.to_string());
            Ok(properties)
        }
        .boxed()
    }

    fn extract(&self, artifact: &Artifact, status: &Status, _args: ()) -> Result<u64, Error> {
        let task = || format!("{}/{}", TaskKind::SIZE, artifact);
        let rows = status.property(ROWS_PROPERTY).ok_or_else(|| Error::MissingProperty {
            task: task(),
            property: ROWS_PROPERTY,
        })?;

        rows.parse().map_err(|_| Error::InvalidProperty {
            task: task(),
            property: ROWS_PROPERTY,
            value: rows.to_string(),
        })
    }
}

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, TaskKind};
use crate::config::PollConfig;
use crate::error::{ComputationError, Error, StoreError};
use crate::status::{self, Properties, Stage, Status, StatusKey, StatusStore, Transition};
use crate::tasks::{TaskHandle, TaskName, TaskRegistry};

mod caching;
mod schema;
mod size;

pub use caching::{CachingComputation, PATH_PROPERTY};
pub use schema::{FieldType, Schema, SchemaComputation, REFERRABLE_PROPERTY};
pub use size::{SizeComputation, ROWS_PROPERTY};


/// The work behind one task kind.
///
/// `execute` produces the properties stored with the READY status; `extract`
/// turns those properties back into the typed value handed to callers.
/// Output that lives outside the status (files, say) is written privately
/// per attempt and only made visible by `publish`.
pub trait Computation: Send + Sync + 'static {
    type Output;
    type Args: Clone;

    fn kind(&self) -> TaskKind;

    fn execute<'a>(
        &'a self,
        artifact: &'a Artifact,
        attempt: Uuid,
    ) -> BoxFuture<'a, Result<Properties, ComputationError>>;

    /// Makes the output of `attempt` visible to readers.
    ///
    /// Runs on the blocking pool, only while `attempt` still owns the status
    /// record and immediately before it turns READY.
    fn publish(&self, _artifact: &Artifact, _attempt: Uuid) -> io::Result<()> {
        Ok(())
    }

    /// Drops whatever an attempt that will never be READY left behind.
    fn discard<'a>(&'a self, _artifact: &'a Artifact, _attempt: Uuid) -> BoxFuture<'a, ()> {
        async {}.boxed()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        status: &Status,
        args: Self::Args,
    ) -> Result<Self::Output, Error>;
}


/// Type-erased view of a `WorkerComputation`, for callers that dispatch on
/// the task kind at runtime.
pub trait Worker: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn last_status<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxFuture<'a, Result<Option<Status>, Error>>;

    fn clear<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), Error>>;

    fn launch<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<bool, Error>>;

    fn complete<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<Status, Error>>;
}


enum Observed {
    Local(TaskHandle),
    Remote(Status),
    Ready(Status),
    Failed(Status),
    Retry,
}


/// Runs a `Computation` at most once per (artifact, kind) across every
/// worker sharing the status store.
///
/// Store calls run on the blocking pool. Launch decisions for one task name
/// are serialized through the registry, so a local caller never sees a fresh
/// PROCESSING record before its task is registered.
pub struct WorkerComputation<C> {
    computation: Arc<C>,
    store: Arc<dyn StatusStore>,
    registry: TaskRegistry,
    manager: String,
    poll: PollConfig,
    reclaims: AtomicU64,
}

impl<C: Computation> WorkerComputation<C> {
    pub fn new(
        computation: C,
        store: Arc<dyn StatusStore>,
        registry: TaskRegistry,
        manager: impl Into<String>,
        poll: PollConfig,
    ) -> Self {
        Self {
            computation: Arc::new(computation),
            store,
            registry,
            manager: manager.into(),
            poll,
            reclaims: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.computation.kind()
    }

    pub fn computation(&self) -> &C {
        &self.computation
    }

    pub fn key(&self, artifact: &Artifact) -> StatusKey {
        StatusKey::new(self.manager.clone(), self.kind(), artifact.clone())
    }

    pub fn task_name(&self, artifact: &Artifact) -> TaskName {
        TaskName::new(self.kind(), artifact)
    }

    /// Number of PROCESSING records this worker reclaimed from dead workers.
    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    pub async fn last_status(&self, artifact: &Artifact) -> Result<Option<Status>, Error> {
        self.read(&self.key(artifact)).await
    }

    pub async fn clear(&self, artifact: &Artifact) -> Result<(), Error> {
        let key = self.key(artifact);
        let target = key.clone();
        status::blocking(&self.store, move |store| store.clear(&target)).await?;
        info!(task = %key, "status cleared");
        Ok(())
    }

    /// Starts the computation unless any status already exists.
    ///
    /// Returns whether this call launched it.
    pub async fn launch_task(&self, artifact: &Artifact) -> Result<bool, Error> {
        let name = self.task_name(artifact);
        let _launching = self.registry.lock(&name).await;
        let key = self.key(artifact);

        if self.read(&key).await?.is_some() {
            return Ok(false);
        }

        if self.registry.find(&name).await.is_some() {
            return Ok(false);
        }

        match self.start(&key).await {
            Ok(_) => Ok(true),
            Err(err) if lost_race(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drives the task to a terminal stage and returns the READY status.
    ///
    /// An ERROR status is returned as `Error::ComputationFailed` to every
    /// caller until the status is cleared.
    pub async fn complete_task(&self, artifact: &Artifact) -> Result<Status, Error> {
        loop {
            match self.observe(artifact).await? {
                Observed::Local(handle) => {
                    debug!(task = %handle.name(), "awaiting local task");
                    handle.wait().await;
                }
                Observed::Remote(status) => {
                    self.await_remote(artifact, status).await?;
                }
                Observed::Ready(status) => {
                    return Ok(status);
                }
                Observed::Failed(status) => {
                    return Err(Error::ComputationFailed {
                        kind: self.kind().to_string(),
                        message: status
                            .error_message()
                            .unwrap_or("unknown error")
                            .to_string(),
                    });
                }
                Observed::Retry => {
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Completes the task and extracts its typed result.
    ///
    /// A READY record whose result was kept by a process that is gone is
    /// cleared and computed once more.
    pub async fn task_result(&self, artifact: &Artifact, args: C::Args) -> Result<C::Output, Error> {
        let status = self.complete_task(artifact).await?;
        match self.computation.extract(artifact, &status, args.clone()) {
            Err(Error::ReferrableNotFound(id)) => {
                warn!(
                    task = %self.key(artifact),
                    referrable = %id,
                    "result no longer held in memory, recomputing"
                );
                self.forget(artifact, status.attempt).await?;
                let status = self.complete_task(artifact).await?;
                self.computation.extract(artifact, &status, args)
            }
            result => result,
        }
    }

    /// Clears the record of `artifact` if it still belongs to `attempt`.
    async fn forget(&self, artifact: &Artifact, attempt: Uuid) -> Result<(), Error> {
        let _launching = self.registry.lock(&self.task_name(artifact)).await;
        match self.last_status(artifact).await? {
            Some(status) if status.attempt == attempt => self.clear(artifact).await,
            _ => Ok(()),
        }
    }

    async fn observe(&self, artifact: &Artifact) -> Result<Observed, Error> {
        let name = self.task_name(artifact);
        let _launching = self.registry.lock(&name).await;
        let key = self.key(artifact);

        let status = match self.read(&key).await? {
            Some(status) => status,
            None => {
                // A local task may still be draining after its status was
                // cleared underneath it; let it finish before relaunching.
                if let Some(handle) = self.registry.find(&name).await {
                    return Ok(Observed::Local(handle));
                }

                return match self.start(&key).await {
                    Ok(handle) => Ok(Observed::Local(handle)),
                    Err(err) if lost_race(&err) => {
                        debug!(task = %key, "lost launch race");
                        Ok(Observed::Retry)
                    }
                    Err(err) => Err(err),
                };
            }
        };

        match status.stage {
            Stage::Processing => {
                if let Some(handle) = self.registry.find(&name).await {
                    return Ok(Observed::Local(handle));
                }

                // The local task may have finished between the two reads.
                match self.read(&key).await? {
                    Some(current) if current == status => Ok(Observed::Remote(status)),
                    _ => Ok(Observed::Retry),
                }
            }
            Stage::Ready => Ok(Observed::Ready(status)),
            Stage::Error => Ok(Observed::Failed(status)),
            Stage::Pending => Ok(Observed::Retry),
        }
    }

    async fn start(&self, key: &StatusKey) -> Result<TaskHandle, Error> {
        let target = key.clone();
        let attempt =
            status::blocking(&self.store, move |store| store.mark_processing(&target)).await?;
        info!(task = %key, %attempt, "launching computation");

        let work = run_attempt(
            Arc::clone(&self.computation),
            Arc::clone(&self.store),
            key.clone(),
            attempt,
        );

        match self.registry.register(self.task_name(&key.artifact), work).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                // Release the claim so the record does not wait out a reclaim.
                self.reclaim(key, attempt).await?;
                Err(err)
            }
        }
    }

    /// Polls a task owned by another worker until its record changes, or
    /// reclaims it once the poll bound is exhausted.
    async fn await_remote(&self, artifact: &Artifact, observed: Status) -> Result<(), Error> {
        let key = self.key(artifact);
        let name = self.task_name(artifact);
        debug!(task = %key, attempt = %observed.attempt, "waiting for remote worker");

        for _ in 0..self.poll.max_polls {
            tokio::time::sleep(self.poll.interval()).await;

            if self.registry.find(&name).await.is_some() {
                return Ok(());
            }

            match self.read(&key).await? {
                Some(status)
                    if status.stage == Stage::Processing
                        && status.attempt == observed.attempt => {}
                _ => return Ok(()),
            }
        }

        if self.reclaim(&key, observed.attempt).await? {
            self.reclaims.fetch_add(1, Ordering::Relaxed);
            warn!(
                task = %key,
                attempt = %observed.attempt,
                polls = self.poll.max_polls,
                "worker presumed dead, task reclaimed"
            );
        }

        Ok(())
    }

    async fn read(&self, key: &StatusKey) -> Result<Option<Status>, Error> {
        let key = key.clone();
        Ok(status::blocking(&self.store, move |store| store.last_status(&key)).await?)
    }

    async fn reclaim(&self, key: &StatusKey, attempt: Uuid) -> Result<bool, Error> {
        let key = key.clone();
        Ok(status::blocking(&self.store, move |store| store.reclaim(&key, attempt)).await?)
    }
}

impl<C: Computation> Worker for WorkerComputation<C> {
    fn kind(&self) -> TaskKind {
        WorkerComputation::kind(self)
    }

    fn last_status<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxFuture<'a, Result<Option<Status>, Error>> {
        WorkerComputation::last_status(self, artifact).boxed()
    }

    fn clear<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), Error>> {
        WorkerComputation::clear(self, artifact).boxed()
    }

    fn launch<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<bool, Error>> {
        self.launch_task(artifact).boxed()
    }

    fn complete<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<Status, Error>> {
        self.complete_task(artifact).boxed()
    }
}


fn lost_race(err: &Error) -> bool {
    matches!(
        err,
        Error::Store(StoreError::AlreadyProcessing(_))
            | Error::Store(StoreError::InvalidTransition { .. })
    )
}


/// Body of a registered task: runs one attempt and records its outcome.
///
/// Only an attempt that still owns the record publishes its output; any
/// other outcome discards it.
async fn run_attempt<C: Computation>(
    computation: Arc<C>,
    store: Arc<dyn StatusStore>,
    key: StatusKey,
    attempt: Uuid,
) {
    let outcome = AssertUnwindSafe(computation.execute(&key.artifact, attempt))
        .catch_unwind()
        .await;

    let written = match outcome {
        Ok(Ok(properties)) => match publish_ready(&computation, &store, &key, attempt, properties)
            .await
        {
            Err(StoreError::Publish { message, .. }) => {
                error!(task = %key, %attempt, error = %message, "publishing failed");
                record_error(&store, &key, attempt, message).await.map(|_| false)
            }
            Ok(Transition::Applied) => {
                info!(task = %key, %attempt, "computation ready");
                Ok(true)
            }
            Ok(Transition::Stale) => {
                warn!(task = %key, %attempt, "outcome discarded, task was reclaimed");
                Ok(false)
            }
            Err(err) => Err(err),
        },
        Ok(Err(err)) => {
            error!(task = %key, %attempt, error = %err, "computation failed");
            record_error(&store, &key, attempt, err.diagnostic()).await.map(|_| false)
        }
        Err(panic) => {
            let message = format!("computation panicked: {}", panic_message(panic.as_ref()));
            error!(task = %key, %attempt, "{}", message);
            record_error(&store, &key, attempt, message).await.map(|_| false)
        }
    };

    let published = match written {
        Ok(published) => published,
        Err(err) => {
            error!(task = %key, %attempt, error = %err, "failed to record outcome");
            false
        }
    };

    if !published {
        computation.discard(&key.artifact, attempt).await;
    }
}


async fn publish_ready<C: Computation>(
    computation: &Arc<C>,
    store: &Arc<dyn StatusStore>,
    key: &StatusKey,
    attempt: Uuid,
    properties: Properties,
) -> Result<Transition, StoreError> {
    let computation = Arc::clone(computation);
    let key = key.clone();
    status::blocking(store, move |store| {
        store.publish_ready(&key, attempt, properties, &mut || {
            computation.publish(&key.artifact, attempt)
        })
    })
    .await
}


async fn record_error(
    store: &Arc<dyn StatusStore>,
    key: &StatusKey,
    attempt: Uuid,
    message: String,
) -> Result<Transition, StoreError> {
    let key = key.clone();
    status::blocking(store, move |store| store.mark_error(&key, attempt, &message)).await
}


fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

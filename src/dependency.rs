use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::artifact::{Artifact, TaskKind};
use crate::computation::Worker;
use crate::error::Error;
use crate::status::Status;


/// One (artifact, task kind) computation.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub artifact: Artifact,
    pub kind: TaskKind,
}

impl TaskRef {
    pub fn new(artifact: Artifact, kind: TaskKind) -> Self {
        Self { artifact, kind }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.artifact)
    }
}


/// `consumer` may only run once `producer` is READY.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub producer: TaskRef,
    pub consumer: TaskRef,
}


/// Chains producer completion to consumer computation.
pub struct DependencyOrchestrator {
    workers: HashMap<TaskKind, Arc<dyn Worker>>,
    dependencies: Vec<Dependency>,
}

impl DependencyOrchestrator {
    pub fn new(workers: impl IntoIterator<Item = Arc<dyn Worker>>) -> Self {
        Self {
            workers: workers.into_iter().map(|worker| (worker.kind(), worker)).collect(),
            dependencies: Vec::new(),
        }
    }

    pub fn add(&mut self, dependency: Dependency) {
        self.dependencies.push(dependency);
    }

    pub fn worker(&self, kind: TaskKind) -> Result<&Arc<dyn Worker>, Error> {
        self.workers
            .get(&kind)
            .ok_or_else(|| Error::UnknownTaskKind(kind.to_string()))
    }

    pub fn consumers_of<'a>(&'a self, producer: &'a TaskRef) -> impl Iterator<Item = &'a TaskRef> {
        self.dependencies
            .iter()
            .filter(move |dependency| &dependency.producer == producer)
            .map(|dependency| &dependency.consumer)
    }

    pub fn producers_of<'a>(&'a self, consumer: &'a TaskRef) -> impl Iterator<Item = &'a TaskRef> {
        self.dependencies
            .iter()
            .filter(move |dependency| &dependency.consumer == consumer)
            .map(|dependency| &dependency.producer)
    }

    /// Completes `producer`, then launches every consumer waiting on it.
    ///
    /// Returns the consumers this call launched; consumers that already had
    /// a status are left alone. A failed producer launches nothing.
    pub async fn trigger(&self, producer: &TaskRef) -> Result<(Status, Vec<TaskRef>), Error> {
        let status = self.worker(producer.kind)?.complete(&producer.artifact).await?;

        let mut launched = Vec::new();
        for consumer in self.consumers_of(producer) {
            if self.worker(consumer.kind)?.launch(&consumer.artifact).await? {
                info!(producer = %producer, consumer = %consumer, "consumer launched");
                launched.push(consumer.clone());
            }
        }

        Ok((status, launched))
    }

    /// Completes every producer upstream of `task`, then `task` itself.
    pub async fn complete(&self, task: &TaskRef) -> Result<Status, Error> {
        self.complete_from(task, Vec::new()).await
    }

    fn complete_from<'a>(
        &'a self,
        task: &'a TaskRef,
        mut path: Vec<TaskRef>,
    ) -> BoxFuture<'a, Result<Status, Error>> {
        async move {
            if path.contains(task) {
                return Err(Error::DependencyCycle(task.to_string()));
            }
            path.push(task.clone());

            let producers: Vec<_> = self
                .producers_of(task)
                .map(|producer| self.complete_from(producer, path.clone()))
                .collect();
            if !producers.is_empty() {
                debug!(task = %task, producers = producers.len(), "completing producers");
                try_join_all(producers).await?;
            }

            self.worker(task.kind)?.complete(&task.artifact).await
        }
        .boxed()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputationError;
    use crate::status::{Properties, Stage};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Worker that records the order in which tasks are completed.
    struct Recorder {
        kind: TaskKind,
        log: Arc<Mutex<Vec<String>>>,
        failing: Option<&'static str>,
    }

    impl Worker for Recorder {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        fn last_status<'a>(
            &'a self,
            _artifact: &'a Artifact,
        ) -> BoxFuture<'a, Result<Option<Status>, Error>> {
            async { Ok(None) }.boxed()
        }

        fn clear<'a>(&'a self, _artifact: &'a Artifact) -> BoxFuture<'a, Result<(), Error>> {
            async { Ok(()) }.boxed()
        }

        fn launch<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<bool, Error>> {
            let entry = format!("launch {}/{}", self.kind, artifact);
            self.log.lock().unwrap().push(entry);
            async { Ok(true) }.boxed()
        }

        fn complete<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<Status, Error>> {
            async move {
                if self.failing == Some(artifact.uuid()) {
                    let err = ComputationError::new("producer broke");
                    return Err(Error::ComputationFailed {
                        kind: self.kind.to_string(),
                        message: err.to_string(),
                    });
                }

                self.log
                    .lock()
                    .unwrap()
                    .push(format!("complete {}/{}", self.kind, artifact));
                Ok(Status {
                    stage: Stage::Ready,
                    attempt: Uuid::new_v4(),
                    properties: Properties::new(),
                })
            }
            .boxed()
        }
    }

    fn task(uuid: &str, kind: TaskKind) -> TaskRef {
        TaskRef::new(Artifact::new(uuid).unwrap(), kind)
    }

    fn orchestrator(failing: Option<&'static str>) -> (DependencyOrchestrator, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<Arc<dyn Worker>> = TaskKind::ALL
            .into_iter()
            .map(|kind| {
                Arc::new(Recorder { kind, log: Arc::clone(&log), failing }) as Arc<dyn Worker>
            })
            .collect();
        (DependencyOrchestrator::new(workers), log)
    }

    #[tokio::test]
    async fn trigger_launches_consumers_after_producer() {
        let (mut orchestrator, log) = orchestrator(None);
        orchestrator.add(Dependency {
            producer: task("raw", TaskKind::TO_CACHE),
            consumer: task("derived", TaskKind::SCHEMA),
        });

        let (status, launched) = orchestrator.trigger(&task("raw", TaskKind::TO_CACHE)).await.unwrap();
        assert_eq!(status.stage, Stage::Ready);
        assert_eq!(launched, vec![task("derived", TaskKind::SCHEMA)]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["complete to_cache/raw", "launch schema/derived"]
        );
    }

    #[tokio::test]
    async fn failed_producer_launches_nothing() {
        let (mut orchestrator, log) = orchestrator(Some("raw"));
        orchestrator.add(Dependency {
            producer: task("raw", TaskKind::TO_CACHE),
            consumer: task("derived", TaskKind::SCHEMA),
        });

        let result = orchestrator.trigger(&task("raw", TaskKind::TO_CACHE)).await;
        assert!(matches!(result, Err(Error::ComputationFailed { .. })));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_runs_producers_first() {
        let (mut orchestrator, log) = orchestrator(None);
        orchestrator.add(Dependency {
            producer: task("raw", TaskKind::TO_CACHE),
            consumer: task("derived", TaskKind::SIZE),
        });

        orchestrator.complete(&task("derived", TaskKind::SIZE)).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["complete to_cache/raw", "complete size/derived"]
        );
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let (mut orchestrator, _) = orchestrator(None);
        orchestrator.add(Dependency {
            producer: task("a", TaskKind::SIZE),
            consumer: task("b", TaskKind::SIZE),
        });
        orchestrator.add(Dependency {
            producer: task("b", TaskKind::SIZE),
            consumer: task("a", TaskKind::SIZE),
        });

        let result = orchestrator.complete(&task("a", TaskKind::SIZE)).await;
        assert!(matches!(result, Err(Error::DependencyCycle(_))));
    }
}

use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::artifact::{Artifact, TaskKind};
use crate::error::Error;


/// Registry name of an in-flight computation, derived from
/// `(task_kind, artifact_uuid)` so independent call sites converge.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(kind: TaskKind, artifact: &Artifact) -> Self {
        Self(format!("{}:{}", kind, artifact))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


/// Awaitable handle to a task running in this process.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    name: TaskName,
    finished: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn name(&self) -> &TaskName {
        &self.name
    }

    /// Waits until the task has run to completion (or panicked).
    pub async fn wait(mut self) {
        // A closed channel means the sender went away with the task.
        let _ = self.finished.wait_for(|finished| *finished).await;
    }
}


/// Table of computations currently running in this process.
///
/// Entries are removed as soon as their future completes, so a present
/// entry always names a live task.
#[derive(Clone, Debug, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<TaskName, watch::Receiver<bool>>>>,
    launching: LaunchLocks,
}

type LaunchLocks = Arc<StdMutex<HashMap<TaskName, Arc<Mutex<()>>>>>;


/// Held while deciding whether to launch one task name.
///
/// Guards for different names never wait on each other. The entry is
/// dropped from the registry once nobody holds or waits for it.
#[derive(Debug)]
pub struct LaunchGuard {
    launching: LaunchLocks,
    name: TaskName,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut launching = lock_map(&self.launching);
        if launching
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            launching.remove(&self.name);
        }
    }
}


fn lock_map(launching: &LaunchLocks) -> MutexGuard<'_, HashMap<TaskName, Arc<Mutex<()>>>> {
    launching.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive launch rights on `name`.
    pub async fn lock(&self, name: &TaskName) -> LaunchGuard {
        let lock = {
            let mut launching = lock_map(&self.launching);
            Arc::clone(launching.entry(name.clone()).or_default())
        };

        LaunchGuard {
            launching: Arc::clone(&self.launching),
            name: name.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    pub async fn find(&self, name: &TaskName) -> Option<TaskHandle> {
        self.tasks.lock().await.get(name).map(|finished| TaskHandle {
            name: name.clone(),
            finished: finished.clone(),
        })
    }

    /// Spawns `work` under `name`.
    ///
    /// Registering a name that is still live is a call-site bug and fails
    /// with `Error::DuplicateTask`; check `find` first.
    pub async fn register<F>(&self, name: TaskName, work: F) -> Result<TaskHandle, Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&name) {
            return Err(Error::DuplicateTask(name.to_string()));
        }

        let (finished_tx, finished) = watch::channel(false);
        tasks.insert(name.clone(), finished.clone());
        drop(tasks);

        let registry = self.clone();
        let task_name = name.clone();
        tokio::spawn(async move {
            if AssertUnwindSafe(work).catch_unwind().await.is_err() {
                tracing::error!(task = %task_name, "task panicked");
            }

            // Deregister before waking waiters so they never find a dead handle.
            registry.tasks.lock().await.remove(&task_name);
            let _ = finished_tx.send(true);
        });

        Ok(TaskHandle { name, finished })
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn name(uuid: &str) -> TaskName {
        TaskName::new(TaskKind::TO_CACHE, &Artifact::new(uuid).unwrap())
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(name("abc123"), name("abc123"));
        assert_eq!(name("abc123").as_str(), "to_cache:abc123");
        assert_ne!(
            name("abc123"),
            TaskName::new(TaskKind::SCHEMA, &Artifact::new("abc123").unwrap())
        );
    }

    #[tokio::test]
    async fn register_find_and_wait() {
        let registry = TaskRegistry::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        registry
            .register(name("abc123"), async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();

        let handle = registry.find(&name("abc123")).await.unwrap();
        assert_eq!(handle.name(), &name("abc123"));
        assert!(registry.find(&name("other")).await.is_none());

        release_tx.send(()).unwrap();
        handle.wait().await;
        assert!(registry.find(&name("abc123")).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_live_name_is_rejected() {
        let registry = TaskRegistry::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let handle = registry
            .register(name("abc123"), async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();

        let again = registry.register(name("abc123"), async {}).await;
        assert!(matches!(again, Err(Error::DuplicateTask(_))));

        release_tx.send(()).unwrap();
        handle.wait().await;

        // Once finished, the name is free again.
        let handle = registry.register(name("abc123"), async {}).await.unwrap();
        handle.wait().await;
    }

    #[tokio::test]
    async fn launch_locks_are_per_name() {
        let registry = TaskRegistry::new();
        let held = registry.lock(&name("abc123")).await;

        let other = timeout(Duration::from_millis(100), registry.lock(&name("other"))).await;
        assert!(other.is_ok());
        drop(other);

        let same = timeout(Duration::from_millis(50), registry.lock(&name("abc123"))).await;
        assert!(same.is_err());

        drop(held);
        drop(registry.lock(&name("abc123")).await);
        assert!(lock_map(&registry.launching).is_empty());
    }

    #[tokio::test]
    async fn panicking_task_still_finishes() {
        let registry = TaskRegistry::new();
        let handle = registry
            .register(name("boom"), async {
                panic!("boom");
            })
            .await
            .unwrap();

        handle.wait().await;
        assert_eq!(registry.len().await, 0);
    }
}

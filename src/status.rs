use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use uuid::Uuid;

use crate::artifact::{Artifact, TaskKind};
use crate::error::StoreError;

mod durable;
mod memory;

pub use durable::RedbStatusStore;
pub use memory::MemoryStatusStore;


/// Property holding the diagnostic of a failed attempt.
pub const ERROR_PROPERTY: &str = "error";

pub type Properties = BTreeMap<String, String>;


/// Lifecycle stage of one (artifact, task kind) computation.
///
/// `Pending` is never stored; it is what an absent record means.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Stage {
    Pending,
    Processing,
    Ready,
    Error,
}


#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub stage: Stage,
    /// Issued by `mark_processing`; identifies the attempt that owns the record.
    pub attempt: Uuid,
    pub properties: Properties,
}

impl Status {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.property(ERROR_PROPERTY)
    }
}


/// Address of a status record: `(manager_id, task_kind, artifact_uuid)`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StatusKey {
    pub manager: String,
    pub kind: TaskKind,
    pub artifact: Artifact,
}

impl StatusKey {
    pub fn new(manager: impl Into<String>, kind: TaskKind, artifact: Artifact) -> Self {
        Self { manager: manager.into(), kind, artifact }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.manager, self.kind, self.artifact)
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.artifact)
    }
}


/// Outcome of a terminal write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    Applied,
    /// The record was cleared or reclaimed by someone else; nothing was written.
    Stale,
}


/// Persistent record of the last known stage per (artifact, task kind).
///
/// Implementations must make `mark_processing` and `reclaim` atomic
/// check-and-set operations.
pub trait StatusStore: Send + Sync {
    fn last_status(&self, key: &StatusKey) -> Result<Option<Status>, StoreError>;

    /// PENDING -> PROCESSING. Returns the id of the new attempt.
    fn mark_processing(&self, key: &StatusKey) -> Result<Uuid, StoreError>;

    /// PROCESSING -> READY for the given attempt, running `publish` first.
    ///
    /// `publish` runs only while `attempt` still owns the record, inside the
    /// same check-and-set as the READY write. If it fails nothing is written
    /// and `StoreError::Publish` is returned; a stale attempt never runs it.
    fn publish_ready(
        &self,
        key: &StatusKey,
        attempt: Uuid,
        properties: Properties,
        publish: &mut dyn FnMut() -> io::Result<()>,
    ) -> Result<Transition, StoreError>;

    /// PROCESSING -> READY for the given attempt.
    fn mark_ready(
        &self,
        key: &StatusKey,
        attempt: Uuid,
        properties: Properties,
    ) -> Result<Transition, StoreError> {
        self.publish_ready(key, attempt, properties, &mut || Ok(()))
    }

    /// PROCESSING -> ERROR for the given attempt.
    fn mark_error(
        &self,
        key: &StatusKey,
        attempt: Uuid,
        message: &str,
    ) -> Result<Transition, StoreError>;

    /// Drop the record whatever its stage.
    fn clear(&self, key: &StatusKey) -> Result<(), StoreError>;

    /// PROCESSING -> PENDING, only if `attempt` still owns the record.
    fn reclaim(&self, key: &StatusKey, attempt: Uuid) -> Result<bool, StoreError>;
}


/// Runs a store call on the blocking pool, off the async workers.
pub(crate) async fn blocking<T, F>(store: &Arc<dyn StatusStore>, call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn StatusStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(|err| StoreError::Backend(format!("store call did not finish: {}", err)))?
}


pub(crate) fn published(
    key: &StatusKey,
    publish: &mut dyn FnMut() -> io::Result<()>,
) -> Result<(), StoreError> {
    publish().map_err(|err| StoreError::Publish {
        key: key.to_string(),
        message: err.to_string(),
    })
}


pub(crate) fn begin(key: &StatusKey, current: Option<&Status>) -> Result<Status, StoreError> {
    match current {
        None => Ok(Status {
            stage: Stage::Processing,
            attempt: Uuid::new_v4(),
            properties: Properties::new(),
        }),
        Some(status) if status.stage == Stage::Processing => {
            Err(StoreError::AlreadyProcessing(key.to_string()))
        }
        Some(status) => Err(StoreError::InvalidTransition {
            key: key.to_string(),
            from: status.stage,
            to: Stage::Processing,
        }),
    }
}


/// Computes the terminal record for `attempt`, or `None` for a stale write.
pub(crate) fn finish(
    key: &StatusKey,
    current: Option<&Status>,
    attempt: Uuid,
    stage: Stage,
    properties: Properties,
) -> Result<Option<Status>, StoreError> {
    match current {
        Some(status) if status.attempt == attempt => {
            if status.stage != Stage::Processing {
                return Err(StoreError::InvalidTransition {
                    key: key.to_string(),
                    from: status.stage,
                    to: stage,
                });
            }

            Ok(Some(Status { stage, attempt, properties }))
        }
        _ => {
            tracing::warn!(task = %key, %attempt, "ignoring stale {:?} write", stage);
            Ok(None)
        }
    }
}


pub(crate) fn error_properties(message: &str) -> Properties {
    let mut properties = Properties::new();
    properties.insert(ERROR_PROPERTY.to_string(), message.to_string());
    properties
}


pub(crate) fn owned_by(current: Option<&Status>, attempt: Uuid) -> bool {
    matches!(current, Some(status) if status.stage == Stage::Processing && status.attempt == attempt)
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn key(uuid: &str) -> StatusKey {
        StatusKey::new("test", TaskKind::TO_CACHE, Artifact::new(uuid).unwrap())
    }

    /// Lifecycle checks shared by every store implementation.
    pub fn exercise_lifecycle(store: &dyn StatusStore) {
        let key = key("abc123");
        assert_eq!(store.last_status(&key).unwrap(), None);

        let attempt = store.mark_processing(&key).unwrap();
        let status = store.last_status(&key).unwrap().unwrap();
        assert_eq!(status.stage, Stage::Processing);
        assert_eq!(status.attempt, attempt);

        assert!(matches!(
            store.mark_processing(&key),
            Err(StoreError::AlreadyProcessing(_))
        ));

        let mut properties = Properties::new();
        properties.insert("path".to_string(), "/cache/abc123.jsonl".to_string());
        assert_eq!(
            store.mark_ready(&key, attempt, properties).unwrap(),
            Transition::Applied
        );

        let status = store.last_status(&key).unwrap().unwrap();
        assert_eq!(status.stage, Stage::Ready);
        assert_eq!(status.property("path"), Some("/cache/abc123.jsonl"));

        // Terminal records are never restarted without an explicit clear.
        assert!(matches!(
            store.mark_processing(&key),
            Err(StoreError::InvalidTransition { from: Stage::Ready, .. })
        ));
        assert!(store.mark_error(&key, attempt, "late").is_err());

        store.clear(&key).unwrap();
        assert_eq!(store.last_status(&key).unwrap(), None);
    }

    /// `publish_ready` runs its hook only for the attempt owning the record.
    pub fn exercise_publish(store: &dyn StatusStore) {
        let key = key("published");
        let stale = store.mark_processing(&key).unwrap();
        assert!(store.reclaim(&key, stale).unwrap());
        let owner = store.mark_processing(&key).unwrap();

        let mut runs = 0;
        let transition = store
            .publish_ready(&key, stale, Properties::new(), &mut || {
                runs += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(transition, Transition::Stale);
        assert_eq!(runs, 0);

        let failed = store.publish_ready(&key, owner, Properties::new(), &mut || {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        });
        assert!(matches!(failed, Err(StoreError::Publish { .. })));
        assert_eq!(store.last_status(&key).unwrap().unwrap().stage, Stage::Processing);

        let transition = store
            .publish_ready(&key, owner, Properties::new(), &mut || {
                runs += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(transition, Transition::Applied);
        assert_eq!(runs, 1);
        assert_eq!(store.last_status(&key).unwrap().unwrap().stage, Stage::Ready);
    }

    pub fn exercise_reclaim(store: &dyn StatusStore) {
        let key = key("stuck");
        let stuck = store.mark_processing(&key).unwrap();

        assert!(!store.reclaim(&key, Uuid::new_v4()).unwrap());
        assert!(store.reclaim(&key, stuck).unwrap());
        assert_eq!(store.last_status(&key).unwrap(), None);

        let fresh = store.mark_processing(&key).unwrap();
        assert_eq!(
            store.mark_error(&key, stuck, "from a dead worker").unwrap(),
            Transition::Stale
        );
        assert_eq!(
            store.mark_error(&key, fresh, "boom").unwrap(),
            Transition::Applied
        );

        let status = store.last_status(&key).unwrap().unwrap();
        assert_eq!(status.stage, Stage::Error);
        assert_eq!(status.error_message(), Some("boom"));
        assert!(!store.reclaim(&key, fresh).unwrap());
    }
}

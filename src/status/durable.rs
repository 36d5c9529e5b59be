use redb::{Database, ReadableTable, TableDefinition};
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::status::{self, Properties, Stage, Status, StatusKey, StatusStore, Transition};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("status");


/// Status store backed by a redb file.
///
/// Check-and-set transitions read and write inside a single write
/// transaction; redb serializes write transactions, so they are atomic.
#[derive(Clone)]
pub struct RedbStatusStore {
    db: Arc<Database>,
}

impl RedbStatusStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend)?;

        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _table = write_txn.open_table(TABLE).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Runs `update` on the current record inside one write transaction.
    ///
    /// `update` returns the record to store (`Some`), or `None` to delete it,
    /// together with the value handed back to the caller.
    fn update<T>(
        &self,
        key: &StatusKey,
        update: impl FnOnce(Option<&Status>) -> Result<(Change, T), StoreError>,
    ) -> Result<T, StoreError> {
        let encoded = key.encode();
        let write_txn = self.db.begin_write().map_err(backend)?;
        let result = {
            let mut table = write_txn.open_table(TABLE).map_err(backend)?;
            let current = match table.get(encoded.as_str()).map_err(backend)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };

            let (change, result) = update(current.as_ref())?;
            match change {
                Change::Keep => {}
                Change::Put(next) => {
                    let bytes = encode(&next)?;
                    table
                        .insert(encoded.as_str(), bytes.as_slice())
                        .map_err(backend)?;
                }
                Change::Delete => {
                    table.remove(encoded.as_str()).map_err(backend)?;
                }
            }
            result
        };
        write_txn.commit().map_err(backend)?;
        Ok(result)
    }

    fn finish(
        &self,
        key: &StatusKey,
        attempt: Uuid,
        stage: Stage,
        properties: Properties,
        publish: &mut dyn FnMut() -> io::Result<()>,
    ) -> Result<Transition, StoreError> {
        self.update(key, |current| {
            Ok(match status::finish(key, current, attempt, stage, properties)? {
                Some(next) => {
                    status::published(key, publish)?;
                    (Change::Put(next), Transition::Applied)
                }
                None => (Change::Keep, Transition::Stale),
            })
        })
    }
}

impl StatusStore for RedbStatusStore {
    fn last_status(&self, key: &StatusKey) -> Result<Option<Status>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(TABLE).map_err(backend)?;
        let value = table.get(key.encode().as_str()).map_err(backend)?;
        match value {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn mark_processing(&self, key: &StatusKey) -> Result<Uuid, StoreError> {
        self.update(key, |current| {
            let next = status::begin(key, current)?;
            let attempt = next.attempt;
            Ok((Change::Put(next), attempt))
        })
    }

    fn publish_ready(
        &self,
        key: &StatusKey,
        attempt: Uuid,
        properties: Properties,
        publish: &mut dyn FnMut() -> io::Result<()>,
    ) -> Result<Transition, StoreError> {
        self.finish(key, attempt, Stage::Ready, properties, publish)
    }

    fn mark_error(
        &self,
        key: &StatusKey,
        attempt: Uuid,
        message: &str,
    ) -> Result<Transition, StoreError> {
        self.finish(key, attempt, Stage::Error, status::error_properties(message), &mut || Ok(()))
    }

    fn clear(&self, key: &StatusKey) -> Result<(), StoreError> {
        self.update(key, |_| Ok((Change::Delete, ())))
    }

    fn reclaim(&self, key: &StatusKey, attempt: Uuid) -> Result<bool, StoreError> {
        self.update(key, |current| {
            if status::owned_by(current, attempt) {
                Ok((Change::Delete, true))
            } else {
                Ok((Change::Keep, false))
            }
        })
    }
}


enum Change {
    Keep,
    Put(Status),
    Delete,
}


fn backend(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}


fn encode(status: &Status) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(status).map_err(|err| StoreError::Serialization(err.to_string()))
}


fn decode(bytes: &[u8]) -> Result<Status, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Serialization(err.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::tests::{exercise_lifecycle, exercise_publish, exercise_reclaim, key};

    fn open(dir: &tempfile::TempDir) -> RedbStatusStore {
        RedbStatusStore::open(&dir.path().join("status.redb")).unwrap()
    }

    #[test]
    fn lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        exercise_lifecycle(&open(&dir));
    }

    #[test]
    fn reclaim() {
        let dir = tempfile::tempdir().unwrap();
        exercise_reclaim(&open(&dir));
    }

    #[test]
    fn publish_is_gated_on_ownership() {
        let dir = tempfile::tempdir().unwrap();
        exercise_publish(&open(&dir));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = key("abc123");

        let attempt = {
            let store = open(&dir);
            let attempt = store.mark_processing(&key).unwrap();
            store.mark_ready(&key, attempt, Properties::new()).unwrap();
            attempt
        };

        let status = open(&dir).last_status(&key).unwrap().unwrap();
        assert_eq!(status.stage, Stage::Ready);
        assert_eq!(status.attempt, attempt);
    }
}

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::StoreError;
use crate::status::{self, Properties, Stage, Status, StatusKey, StatusStore, Transition};


/// Process-local status store.
///
/// Every operation runs under one lock, which makes the check-and-set
/// transitions trivially atomic. Sharing one instance between several
/// `WorkerComputation`s with separate registries behaves like several
/// processes sharing a durable store.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, Status>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Status>> {
        self.records.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn finish(
        &self,
        key: &StatusKey,
        attempt: Uuid,
        stage: Stage,
        properties: Properties,
        publish: &mut dyn FnMut() -> io::Result<()>,
    ) -> Result<Transition, StoreError> {
        let mut records = self.records();
        let encoded = key.encode();
        match status::finish(key, records.get(&encoded), attempt, stage, properties)? {
            Some(next) => {
                status::published(key, publish)?;
                records.insert(encoded, next);
                Ok(Transition::Applied)
            }
            None => Ok(Transition::Stale),
        }
    }
}

impl StatusStore for MemoryStatusStore {
    fn last_status(&self, key: &StatusKey) -> Result<Option<Status>, StoreError> {
        Ok(self.records().get(&key.encode()).cloned())
    }

    fn mark_processing(&self, key: &StatusKey) -> Result<Uuid, StoreError> {
        let mut records = self.records();
        let encoded = key.encode();
        let next = status::begin(key, records.get(&encoded))?;
        let attempt = next.attempt;
        records.insert(encoded, next);
        Ok(attempt)
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
        self.records().remove(&key.encode());
        Ok(())
    }

    fn reclaim(&self, key: &StatusKey, attempt: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records();
        let encoded = key.encode();
        if !status::owned_by(records.get(&encoded), attempt) {
            return Ok(false);
        }

        records.remove(&encoded);
        Ok(true)
    }
}

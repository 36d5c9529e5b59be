use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::{ComputationError, Error};


/// One row of upstream output.
pub type Record = serde_json::Value;

/// A batch of rows as produced by an upstream computation.
pub type Batch = Vec<Record>;


/// Identity of a lazily computed node in the dataspec graph.
///
/// The uuid doubles as a file name inside the cache directory, so only
/// characters that are safe in a single path component are accepted.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Artifact {
    uuid: String,
}

impl Artifact {
    pub fn new(uuid: impl Into<String>) -> Result<Self, Error> {
        let uuid = uuid.into();
        let valid = !uuid.is_empty()
            && uuid != "."
            && uuid != ".."
            && uuid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

        if !valid {
            return Err(Error::InvalidArtifact(uuid));
        }

        Ok(Self { uuid })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.uuid)
    }
}

impl TryFrom<String> for Artifact {
    type Error = Error;

    fn try_from(uuid: String) -> Result<Self, Error> {
        Artifact::new(uuid)
    }
}

impl From<Artifact> for String {
    fn from(artifact: Artifact) -> String {
        artifact.uuid
    }
}


/// Class of computation performed on an artifact.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct TaskKind(&'static str);

impl TaskKind {
    pub const SCHEMA: TaskKind = TaskKind("schema");
    pub const SIZE: TaskKind = TaskKind("size");
    pub const TO_CACHE: TaskKind = TaskKind("to_cache");

    pub const ALL: [TaskKind; 3] = [Self::SCHEMA, Self::SIZE, Self::TO_CACHE];

    pub const fn name(&self) -> &'static str {
        self.0
    }

    pub fn parse(name: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.0 == name)
            .ok_or_else(|| Error::UnknownTaskKind(name.to_string()))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Serialize for TaskKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

impl<'de> Deserialize<'de> for TaskKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        TaskKind::parse(&name).map_err(serde::de::Error::custom)
    }
}


/// Source of the raw rows behind an artifact.
pub trait Upstream: Send + Sync {
    fn produce<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxStream<'a, Result<Batch, ComputationError>>;
}


/// Lookup of in-memory objects by the ids recorded in status properties.
pub trait Referrables<T>: Send + Sync {
    fn get(&self, id: &Uuid) -> Option<Arc<T>>;

    fn insert(&self, object: T) -> Uuid;
}


#[derive(Debug)]
pub struct MemoryReferrables<T> {
    objects: RwLock<HashMap<Uuid, Arc<T>>>,
}

impl<T> MemoryReferrables<T> {
    pub fn new() -> Self {
        Self { objects: RwLock::new(HashMap::new()) }
    }
}

impl<T> Default for MemoryReferrables<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> Referrables<T> for MemoryReferrables<T> {
    fn get(&self, id: &Uuid) -> Option<Arc<T>> {
        let objects = self.objects.read().unwrap_or_else(|err| err.into_inner());
        objects.get(id).cloned()
    }

    fn insert(&self, object: T) -> Uuid {
        let id = Uuid::new_v4();
        let mut objects = self.objects.write().unwrap_or_else(|err| err.into_inner());
        objects.insert(id, Arc::new(object));
        id
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_rejects_path_components() {
        assert!(Artifact::new("abc123").is_ok());
        assert!(Artifact::new("a-b_c.1").is_ok());
        assert!(Artifact::new("").is_err());
        assert!(Artifact::new("..").is_err());
        assert!(Artifact::new("../etc").is_err());
        assert!(Artifact::new("a/b").is_err());
    }

    #[test]
    fn task_kind_parses_known_names() {
        assert_eq!(TaskKind::parse("to_cache").unwrap(), TaskKind::TO_CACHE);
        assert_eq!(TaskKind::parse("schema").unwrap(), TaskKind::SCHEMA);
        assert!(matches!(TaskKind::parse("to_arrow"), Err(Error::UnknownTaskKind(_))));
    }

    #[test]
    fn referrables_resolve_inserted_objects() {
        let storage = MemoryReferrables::new();
        let id = storage.insert("schema".to_string());
        assert_eq!(storage.get(&id).as_deref(), Some(&"schema".to_string()));
        assert!(storage.get(&Uuid::new_v4()).is_none());
    }
}

use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::artifact::{Artifact, Record, Referrables, TaskKind, Upstream};
use crate::computation::Computation;
use crate::error::{ComputationError, Error};
use crate::status::{Properties, Status};

/// Status property holding the referrable id of the computed schema.
pub const REFERRABLE_PROPERTY: &str = "referrable";

/// Field name used for rows that are not JSON objects.
const VALUE_FIELD: &str = "value";


#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Array,
    Object,
    Mixed,
}

impl FieldType {
    pub fn of(value: &Record) -> Self {
        match value {
            Record::Null => FieldType::Null,
            Record::Bool(_) => FieldType::Boolean,
            Record::Number(number) if number.is_f64() => FieldType::Float,
            Record::Number(_) => FieldType::Integer,
            Record::String(_) => FieldType::String,
            Record::Array(_) => FieldType::Array,
            Record::Object(_) => FieldType::Object,
        }
    }

    /// Widest type covering both; nulls never narrow a field.
    pub fn merge(self, other: FieldType) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (FieldType::Null, other) | (other, FieldType::Null) => other,
            (FieldType::Integer, FieldType::Float) | (FieldType::Float, FieldType::Integer) => {
                FieldType::Float
            }
            _ => FieldType::Mixed,
        }
    }
}


#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: BTreeMap<String, FieldType>,
}

impl Schema {
    pub fn observe(&mut self, record: &Record) {
        match record {
            Record::Object(object) => {
                for (name, value) in object {
                    self.observe_field(name, FieldType::of(value));
                }
            }
            other => self.observe_field(VALUE_FIELD, FieldType::of(other)),
        }
    }

    fn observe_field(&mut self, name: &str, kind: FieldType) {
        self.fields
            .entry(name.to_string())
            .and_modify(|known| *known = known.merge(kind))
            .or_insert(kind);
    }
}


/// Infers the schema of an artifact and publishes it as a referrable object.
pub struct SchemaComputation {
    upstream: Arc<dyn Upstream>,
    storage: Arc<dyn Referrables<Schema>>,
}

impl SchemaComputation {
    pub fn new(upstream: Arc<dyn Upstream>, storage: Arc<dyn Referrables<Schema>>) -> Self {
        Self { upstream, storage }
    }
}

impl Computation for SchemaComputation {
    type Output = Arc<Schema>;
    type Args = ();

    fn kind(&self) -> TaskKind {
        TaskKind::SCHEMA
    }

    fn execute<'a>(
        &'a self,
        artifact: &'a Artifact,
        _attempt: Uuid,
    ) -> BoxFuture<'a, Result<Properties, ComputationError>> {
        async move {
            let schema = self
                .upstream
                .produce(artifact)
                .try_fold(Schema::default(), |mut schema, batch| async move {
                    batch.iter().for_each(|record| schema.observe(record));
                    Ok(schema)
                })
                .await?;

            let id = self.storage.insert(schema);
            let mut properties = Properties::new();
            properties.insert(REFERRABLE_PROPERTY.to_string(), id.to_string());
            Ok(properties)
        }
        .boxed()
    }

    fn extract(&self, artifact: &Artifact, status: &Status, _args: ()) -> Result<Arc<Schema>, Error> {
        let task = || format!("{}/{}", TaskKind::SCHEMA, artifact);
        let id = status.property(REFERRABLE_PROPERTY).ok_or_else(|| Error::MissingProperty {
            task: task(),
            property: REFERRABLE_PROPERTY,
        })?;

        let id: Uuid = id.parse().map_err(|_| Error::InvalidProperty {
            task: task(),
            property: REFERRABLE_PROPERTY,
            value: id.to_string(),
        })?;

        // Referrables live in the memory of the process that computed them.
        self.storage
            .get(&id)
            .ok_or_else(|| Error::ReferrableNotFound(id.to_string()))
    }
}

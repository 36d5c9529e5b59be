use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::artifact::{Artifact, MemoryReferrables, Referrables, TaskKind, Upstream};
use crate::cache::CacheDir;
use crate::computation::{
    CachingComputation, Schema, SchemaComputation, SizeComputation, Worker, WorkerComputation,
};
use crate::config::Config;
use crate::dependency::{DependencyOrchestrator, TaskRef};
use crate::error::Error;
use crate::source::CatalogSource;
use crate::status::{
    MemoryStatusStore, Properties, RedbStatusStore, Stage, Status, StatusStore,
};
use crate::tasks::TaskRegistry;

mod handlers;


/// Everything the HTTP API needs: one worker per task kind sharing a status
/// store and an in-process task registry.
pub struct Server {
    pub schema: Arc<WorkerComputation<SchemaComputation>>,
    pub size: Arc<WorkerComputation<SizeComputation>>,
    pub cache: Arc<WorkerComputation<CachingComputation>>,
    pub orchestrator: DependencyOrchestrator,
}

impl Server {
    pub fn new(config: &Config, store: Arc<dyn StatusStore>, upstream: Arc<dyn Upstream>) -> Self {
        let registry = TaskRegistry::new();
        let storage: Arc<dyn Referrables<Schema>> = Arc::new(MemoryReferrables::new());

        let schema = Arc::new(WorkerComputation::new(
            SchemaComputation::new(Arc::clone(&upstream), storage),
            Arc::clone(&store),
            registry.clone(),
            config.manager_id.clone(),
            config.poll,
        ));
        let size = Arc::new(WorkerComputation::new(
            SizeComputation::new(Arc::clone(&upstream)),
            Arc::clone(&store),
            registry.clone(),
            config.manager_id.clone(),
            config.poll,
        ));
        let cache = Arc::new(WorkerComputation::new(
            CachingComputation::new(upstream, CacheDir::from_config(&config.cache)),
            store,
            registry,
            config.manager_id.clone(),
            config.poll,
        ));

        let workers: Vec<Arc<dyn Worker>> = vec![
            schema.clone() as Arc<dyn Worker>,
            size.clone() as Arc<dyn Worker>,
            cache.clone() as Arc<dyn Worker>,
        ];
        let mut orchestrator = DependencyOrchestrator::new(workers);
        for dependency in &config.dependencies {
            orchestrator.add(dependency.clone());
        }

        Self { schema, size, cache, orchestrator }
    }

    /// Builds the store and catalog upstream described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let store: Arc<dyn StatusStore> = match &config.status_db {
            Some(path) => {
                info!(path = %path.display(), "opening status database");
                Arc::new(RedbStatusStore::open(path)?)
            }
            None => Arc::new(MemoryStatusStore::new()),
        };
        let upstream = Arc::new(CatalogSource::new(config.artifacts.clone(), config.batch_rows));

        Ok(Self::new(config, store, upstream))
    }

    pub fn worker(&self, kind: TaskKind) -> Result<&Arc<dyn Worker>, Error> {
        self.orchestrator.worker(kind)
    }
}


pub enum ServerError {
    BadRequest(String),
    Failed(String),
    NotFound(String),
    Internal(String),
}

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArtifact(_) | Error::UnknownTaskKind(_) | Error::InvalidBatchSize => {
                ServerError::BadRequest(err.to_string())
            }
            Error::ComputationFailed { .. } | Error::DependencyCycle(_) => {
                ServerError::Failed(err.to_string())
            }
            Error::ReferrableNotFound(_) => ServerError::NotFound(err.to_string()),
            _ => ServerError::Internal(err.to_string()),
        }
    }
}

impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::http::Response<axum::body::Body> {
        match self {
            ServerError::BadRequest(message) => {
                (axum::http::StatusCode::BAD_REQUEST, message).into_response()
            }
            ServerError::Failed(message) => {
                (axum::http::StatusCode::UNPROCESSABLE_ENTITY, message).into_response()
            }
            ServerError::NotFound(message) => {
                (axum::http::StatusCode::NOT_FOUND, message).into_response()
            }
            ServerError::Internal(message) => {
                tracing::error!("{}", message);
                (axum::http::StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}


/// Status as reported over the API; an absent record reads as `Pending`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusView {
    pub artifact: Artifact,
    pub kind: TaskKind,
    pub stage: Stage,
    pub attempt: Option<Uuid>,
    pub properties: Properties,
}

impl StatusView {
    pub fn new(task: TaskRef, status: Option<Status>) -> Self {
        match status {
            Some(status) => Self {
                artifact: task.artifact,
                kind: task.kind,
                stage: status.stage,
                attempt: Some(status.attempt),
                properties: status.properties,
            },
            None => Self {
                artifact: task.artifact,
                kind: task.kind,
                stage: Stage::Pending,
                attempt: None,
                properties: BTreeMap::new(),
            },
        }
    }
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Launched {
    pub launched: bool,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Triggered {
    pub status: StatusView,
    pub launched: Vec<TaskRef>,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Size {
    pub rows: u64,
}


pub fn router(server: Arc<Server>) -> axum::Router {
    axum::Router::new()
        .route(
            "/status/:kind/:uuid",
            get(handlers::get_status).delete(handlers::clear_status),
        )
        .route("/tasks/:kind/:uuid/launch", post(handlers::launch_task))
        .route("/tasks/:kind/:uuid/complete", post(handlers::complete_task))
        .route("/tasks/:kind/:uuid/trigger", post(handlers::trigger_task))
        .route("/artifacts/:uuid/schema", get(handlers::get_schema))
        .route("/artifacts/:uuid/size", get(handlers::get_size))
        .route("/artifacts/:uuid/rows", get(handlers::get_rows))
        .with_state(server)
}


pub async fn serve(
    server: Arc<Server>,
    listener: tokio::net::TcpListener
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(server)).await
}

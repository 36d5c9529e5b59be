use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use axum_streams::StreamBodyAs;
use futures::stream;
use serde::Deserialize;
use std::sync::Arc;

use crate::artifact::{Artifact, Batch, TaskKind};
use crate::cache::Chunks;
use crate::computation::Schema;
use crate::dependency::TaskRef;
use crate::server::{Launched, Server, ServerError, Size, StatusView, Triggered};

const DEFAULT_BATCH_SIZE: usize = 1024;


#[derive(Debug, Deserialize)]
pub struct RowsQuery {
    batch_size: Option<usize>,
}


fn task_ref(kind: &str, uuid: String) -> Result<TaskRef, ServerError> {
    Ok(TaskRef::new(Artifact::new(uuid)?, TaskKind::parse(kind)?))
}


pub async fn get_status(
    State(server): State<Arc<Server>>,
    Path((kind, uuid)): Path<(String, String)>
) -> Result<Json<StatusView>, ServerError> {
    let task = task_ref(&kind, uuid)?;
    let status = server.worker(task.kind)?.last_status(&task.artifact).await?;
    Ok(Json(StatusView::new(task, status)))
}


pub async fn clear_status(
    State(server): State<Arc<Server>>,
    Path((kind, uuid)): Path<(String, String)>
) -> Result<Json<StatusView>, ServerError> {
    let task = task_ref(&kind, uuid)?;
    server.worker(task.kind)?.clear(&task.artifact).await?;
    Ok(Json(StatusView::new(task, None)))
}


pub async fn launch_task(
    State(server): State<Arc<Server>>,
    Path((kind, uuid)): Path<(String, String)>
) -> Result<Json<Launched>, ServerError> {
    let task = task_ref(&kind, uuid)?;
    let launched = server.worker(task.kind)?.launch(&task.artifact).await?;
    Ok(Json(Launched { launched }))
}


pub async fn complete_task(
    State(server): State<Arc<Server>>,
    Path((kind, uuid)): Path<(String, String)>
) -> Result<Json<StatusView>, ServerError> {
    let task = task_ref(&kind, uuid)?;
    let status = server.orchestrator.complete(&task).await?;
    Ok(Json(StatusView::new(task, Some(status))))
}


pub async fn trigger_task(
    State(server): State<Arc<Server>>,
    Path((kind, uuid)): Path<(String, String)>
) -> Result<Json<Triggered>, ServerError> {
    let task = task_ref(&kind, uuid)?;
    let (status, launched) = server.orchestrator.trigger(&task).await?;
    Ok(Json(Triggered {
        status: StatusView::new(task, Some(status)),
        launched,
    }))
}


/// A schema whose READY record outlived the process that held it is
/// recomputed here rather than answered with 404.
pub async fn get_schema(
    State(server): State<Arc<Server>>,
    Path(uuid): Path<String>
) -> Result<Json<Schema>, ServerError> {
    let artifact = Artifact::new(uuid)?;
    let schema = server.schema.task_result(&artifact, ()).await?;
    Ok(Json(schema.as_ref().clone()))
}


pub async fn get_size(
    State(server): State<Arc<Server>>,
    Path(uuid): Path<String>
) -> Result<Json<Size>, ServerError> {
    let artifact = Artifact::new(uuid)?;
    let rows = server.size.task_result(&artifact, ()).await?;
    Ok(Json(Size { rows }))
}


pub async fn get_rows(
    State(server): State<Arc<Server>>,
    Path(uuid): Path<String>,
    Query(query): Query<RowsQuery>
) -> Result<impl IntoResponse, ServerError> {
    let artifact = Artifact::new(uuid)?;
    let batch_size = query.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
    let chunks = server.cache.task_result(&artifact, batch_size).await?;
    Ok(StreamBodyAs::json_nl(chunk_stream(chunks)))
}


/// Reads chunks on the blocking pool; a read error ends the stream.
fn chunk_stream(chunks: Chunks) -> impl futures::Stream<Item = Batch> {
    stream::unfold(chunks, |mut chunks| async move {
        let read = tokio::task::spawn_blocking(move || (chunks.next(), chunks)).await;
        match read {
            Ok((Some(Ok(batch)), chunks)) => Some((batch, chunks)),
            Ok((Some(Err(err)), _)) => {
                tracing::warn!(error = %err, "cache read failed mid-stream");
                None
            }
            Ok((None, _)) => None,
            Err(err) => {
                tracing::error!(error = %err, "cache reader panicked");
                None
            }
        }
    })
}

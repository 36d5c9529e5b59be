use futures::stream::{BoxStream, StreamExt};
use reqwest_streams::error::StreamBodyError;
use reqwest_streams::JsonStreamResponse;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::artifact::{Artifact, Batch, TaskKind};
use crate::computation::Schema;
use crate::server::{Launched, Size, StatusView, Triggered};

/// Largest newline-delimited batch accepted from the rows endpoint.
const MAX_BATCH_BYTES: usize = 64 * 1024 * 1024;


#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Api { status: reqwest::StatusCode, message: String },

    #[error("rows stream failed: {0}")]
    Stream(#[from] StreamBodyError),
}


/// HTTP client for a `roost serve` instance.
#[derive(Clone, Debug)]
pub struct Client {
    reqwest: reqwest::Client,
    server: String,
}

impl Client {
    pub fn new(server: String) -> Self {
        Self {
            reqwest: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
        }
    }

    pub async fn status(&self, kind: TaskKind, artifact: &Artifact) -> Result<StatusView, Error> {
        let url = format!("{}/status/{}/{}", self.server, kind, artifact);
        parse(self.reqwest.get(&url).send().await?).await
    }

    pub async fn clear(&self, kind: TaskKind, artifact: &Artifact) -> Result<StatusView, Error> {
        let url = format!("{}/status/{}/{}", self.server, kind, artifact);
        parse(self.reqwest.delete(&url).send().await?).await
    }

    pub async fn launch(&self, kind: TaskKind, artifact: &Artifact) -> Result<Launched, Error> {
        let url = format!("{}/tasks/{}/{}/launch", self.server, kind, artifact);
        parse(self.reqwest.post(&url).send().await?).await
    }

    pub async fn complete(&self, kind: TaskKind, artifact: &Artifact) -> Result<StatusView, Error> {
        let url = format!("{}/tasks/{}/{}/complete", self.server, kind, artifact);
        parse(self.reqwest.post(&url).send().await?).await
    }

    pub async fn trigger(&self, kind: TaskKind, artifact: &Artifact) -> Result<Triggered, Error> {
        let url = format!("{}/tasks/{}/{}/trigger", self.server, kind, artifact);
        parse(self.reqwest.post(&url).send().await?).await
    }

    pub async fn schema(&self, artifact: &Artifact) -> Result<Schema, Error> {
        let url = format!("{}/artifacts/{}/schema", self.server, artifact);
        parse(self.reqwest.get(&url).send().await?).await
    }

    pub async fn size(&self, artifact: &Artifact) -> Result<u64, Error> {
        let url = format!("{}/artifacts/{}/size", self.server, artifact);
        let size: Size = parse(self.reqwest.get(&url).send().await?).await?;
        Ok(size.rows)
    }

    /// Streams the cached rows of `artifact` in chunks of `batch_size`.
    pub async fn rows(
        &self,
        artifact: &Artifact,
        batch_size: usize,
    ) -> Result<BoxStream<'static, Result<Batch, Error>>, Error> {
        let url = format!("{}/artifacts/{}/rows", self.server, artifact);
        let response = self
            .reqwest
            .get(&url)
            .query(&[("batch_size", batch_size)])
            .send()
            .await?;
        let response = check(response).await?;

        Ok(response
            .json_nl_stream::<Batch>(MAX_BATCH_BYTES)
            .map(|batch| batch.map_err(Error::from))
            .boxed())
    }
}


async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(Error::Api { status, message })
}


async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
    Ok(check(response).await?.json().await?)
}

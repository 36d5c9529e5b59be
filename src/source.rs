use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifact::{Artifact, Batch, Record, Upstream};
use crate::error::ComputationError;


/// Where the raw rows of a catalog artifact come from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    Rows { rows: Vec<Record> },
    File { file: PathBuf },
}


/// Upstream backed by a static catalog of artifacts.
#[derive(Clone, Debug)]
pub struct CatalogSource {
    artifacts: BTreeMap<Artifact, SourceSpec>,
    batch_rows: usize,
}

impl CatalogSource {
    pub fn new(artifacts: BTreeMap<Artifact, SourceSpec>, batch_rows: usize) -> Self {
        Self { artifacts, batch_rows: batch_rows.max(1) }
    }
}

impl Upstream for CatalogSource {
    fn produce<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxStream<'a, Result<Batch, ComputationError>> {
        let batch_rows = self.batch_rows;
        match self.artifacts.get(artifact) {
            Some(SourceSpec::Rows { rows }) => {
                stream::iter(rows.chunks(batch_rows).map(|chunk| Ok(chunk.to_vec()))).boxed()
            }
            Some(SourceSpec::File { file }) => stream::once(async move {
                let rows = read_json_lines(file).await?;
                let batches: Vec<Result<Batch, ComputationError>> =
                    rows.chunks(batch_rows).map(|chunk| Ok(chunk.to_vec())).collect();
                Ok::<_, ComputationError>(stream::iter(batches))
            })
            .try_flatten()
            .boxed(),
            None => {
                let err = ComputationError::new(format!("no source for artifact {}", artifact));
                stream::iter(vec![Err(err)]).boxed()
            }
        }
    }
}


async fn read_json_lines(path: &Path) -> Result<Vec<Record>, ComputationError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        ComputationError::new(format!("failed to read {}: {}", path.display(), err))
    })?;

    let mut rows = Vec::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        rows.push(serde_json::from_str(line)?);
    }
    Ok(rows)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact(uuid: &str) -> Artifact {
        Artifact::new(uuid).unwrap()
    }

    #[tokio::test]
    async fn inline_rows_are_batched() {
        let rows = (0..5).map(|i| json!({ "id": i })).collect();
        let mut artifacts = BTreeMap::new();
        artifacts.insert(artifact("abc123"), SourceSpec::Rows { rows });
        let source = CatalogSource::new(artifacts, 2);

        let batches: Vec<Batch> = source
            .produce(&artifact("abc123"))
            .try_collect()
            .await
            .unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn file_rows_are_read_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rows.jsonl");
        std::fs::write(&file, "{\"id\":1}\n\n{\"id\":2}\n").unwrap();

        let mut artifacts = BTreeMap::new();
        artifacts.insert(artifact("abc123"), SourceSpec::File { file });
        let source = CatalogSource::new(artifacts, 10);

        let batches: Vec<Batch> = source
            .produce(&artifact("abc123"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(batches, vec![vec![json!({ "id": 1 }), json!({ "id": 2 })]]);
    }

    #[tokio::test]
    async fn unknown_artifact_fails() {
        let source = CatalogSource::new(BTreeMap::new(), 10);
        let result: Result<Vec<Batch>, _> = source.produce(&artifact("missing")).try_collect().await;
        assert!(result.unwrap_err().message().contains("missing"));
    }
}

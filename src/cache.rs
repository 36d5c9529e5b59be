use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, Batch, Record};
use crate::config::CacheConfig;
use crate::error::{ComputationError, Error};


/// Directory holding one cache file per artifact.
///
/// Files are JSON lines, one record per line, and are never modified once
/// the owning status is READY.
#[derive(Clone, Debug)]
pub struct CacheDir {
    dir: PathBuf,
    extension: String,
}

impl CacheDir {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self { dir: dir.into(), extension: extension.into() }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.dir, &config.extension)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{dir}/{uuid}.{extension}`.
    pub fn cache_path(&self, artifact: &Artifact) -> PathBuf {
        self.dir.join(format!("{}.{}", artifact.uuid(), self.extension))
    }

    /// Where `attempt` writes its rows before they are published.
    pub fn staging_path(&self, artifact: &Artifact, attempt: Uuid) -> PathBuf {
        self.dir.join(format!("{}.{}.{}.tmp", artifact.uuid(), self.extension, attempt))
    }

    /// Writes every record of `artifact` to the staging file of `attempt`.
    ///
    /// Nothing under `cache_path` changes until `publish`.
    pub async fn stage(
        &self,
        artifact: &Artifact,
        attempt: Uuid,
        records: &[Record],
    ) -> Result<PathBuf, ComputationError> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let path = self.staging_path(artifact, attempt);
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, &buffer).await?;

        debug!(artifact = %artifact, path = %path.display(), records = records.len(), "cache staged");
        Ok(path)
    }

    /// Moves the staging file of `attempt` into place. Blocking.
    pub fn publish(&self, artifact: &Artifact, attempt: Uuid) -> io::Result<PathBuf> {
        let path = self.cache_path(artifact);
        std::fs::rename(self.staging_path(artifact, attempt), &path)?;
        Ok(path)
    }

    /// Removes whatever `attempt` staged; a missing file is fine.
    pub async fn discard(&self, artifact: &Artifact, attempt: Uuid) {
        let path = self.staging_path(artifact, attempt);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "staged cache discarded"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "could not discard staged cache"),
        }
    }
}


/// Fixed-size chunks read lazily from a cache file.
///
/// Each `open` starts from the first record, so reopening the same path
/// replays the same sequence.
#[derive(Debug)]
pub struct Chunks {
    lines: Lines<BufReader<File>>,
    batch_size: usize,
    done: bool,
}

impl Chunks {
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self, Error> {
        if batch_size == 0 {
            return Err(Error::InvalidBatchSize);
        }

        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            batch_size,
            done: false,
        })
    }

    fn read_batch(&mut self) -> Result<Batch, Error> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let line = match self.lines.next() {
                Some(line) => line?,
                None => break,
            };

            if line.trim().is_empty() {
                continue;
            }

            batch.push(serde_json::from_str(&line)?);
        }
        Ok(batch)
    }
}

impl Iterator for Chunks {
    type Item = Result<Batch, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.read_batch() {
            Ok(batch) if batch.is_empty() => {
                self.done = true;
                None
            }
            Ok(batch) => Some(Ok(batch)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(count: usize) -> Vec<Record> {
        (0..count).map(|i| json!({ "id": i })).collect()
    }

    #[test]
    fn cache_path_is_deterministic() {
        let cache = CacheDir::new("/cache", "parquet");
        let artifact = Artifact::new("abc123").unwrap();
        assert_eq!(cache.cache_path(&artifact), PathBuf::from("/cache/abc123.parquet"));
    }

    async fn cached(cache: &CacheDir, artifact: &Artifact, records: &[Record]) -> PathBuf {
        let attempt = Uuid::new_v4();
        cache.stage(artifact, attempt, records).await.unwrap();
        cache.publish(artifact, attempt).unwrap()
    }

    #[tokio::test]
    async fn chunks_are_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path().join("nested"), "jsonl");
        let artifact = Artifact::new("abc123").unwrap();

        let path = cached(&cache, &artifact, &rows(12)).await;
        assert_eq!(path, cache.cache_path(&artifact));

        for _ in 0..2 {
            let sizes: Vec<usize> = Chunks::open(&path, 5)
                .unwrap()
                .map(|batch| batch.unwrap().len())
                .collect();
            assert_eq!(sizes, vec![5, 5, 2]);
        }

        let flattened: Vec<Record> = Chunks::open(&path, 5)
            .unwrap()
            .flat_map(|batch| batch.unwrap())
            .collect();
        assert_eq!(flattened, rows(12));
    }

    #[tokio::test]
    async fn empty_cache_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path(), "jsonl");
        let path = cached(&cache, &Artifact::new("empty").unwrap(), &[]).await;
        assert_eq!(Chunks::open(&path, 3).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn staging_leaves_the_cache_path_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(dir.path(), "jsonl");
        let artifact = Artifact::new("abc123").unwrap();
        let published = cached(&cache, &artifact, &rows(2)).await;

        let late = Uuid::new_v4();
        let staged = cache.stage(&artifact, late, &rows(7)).await.unwrap();
        assert_eq!(
            staged.file_name().unwrap().to_str().unwrap(),
            format!("abc123.jsonl.{}.tmp", late)
        );
        assert_eq!(Chunks::open(&published, 10).unwrap().next().unwrap().unwrap(), rows(2));

        cache.discard(&artifact, late).await;
        assert!(!staged.exists());
        cache.discard(&artifact, late).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(Chunks::open("/nonexistent", 0), Err(Error::InvalidBatchSize)));
    }

    #[test]
    fn corrupt_line_stops_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\":1}\nnot json\n{\"id\":2}\n").unwrap();

        let mut chunks = Chunks::open(&path, 1).unwrap();
        assert!(chunks.next().unwrap().is_ok());
        assert!(chunks.next().unwrap().is_err());
        assert!(chunks.next().is_none());
    }
}

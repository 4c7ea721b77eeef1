//! Persistence
//!
//! Append-only records of forecasts, outcomes and promoted model versions, plus
//! last-known-good retrieval for restarts. Stores are injected as
//! `Arc<dyn Persistence>` and opened/closed explicitly by the owner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::ModelVersion;
use crate::utils::types::{ComponentId, ForecastRecord, OutcomeRecord};

const FORECASTS_FILE: &str = "forecasts.jsonl";
const OUTCOMES_FILE: &str = "outcomes.jsonl";
const VERSIONS_FILE: &str = "versions.jsonl";

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn append_forecast(&self, forecast: &ForecastRecord) -> EngineResult<()>;

    async fn append_outcome(&self, outcome: &OutcomeRecord) -> EngineResult<()>;

    async fn append_version(&self, version: &ModelVersion) -> EngineResult<()>;

    /// Newest promoted version, if any
    async fn last_known_good(&self) -> EngineResult<Option<ModelVersion>>;

    /// Most recent `limit` outcomes, oldest first
    async fn recent_outcomes(&self, limit: usize) -> EngineResult<Vec<OutcomeRecord>>;

    async fn health_check(&self) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}

fn store_error(err: impl std::fmt::Display) -> EngineError {
    EngineError::collaborator(ComponentId::Persistence, err)
}

fn closed() -> EngineError {
    store_error("store is closed")
}

/// Open the backend named in the config
pub async fn open_store(config: &StorageConfig) -> Result<std::sync::Arc<dyn Persistence>> {
    match config.backend.as_str() {
        "memory" => Ok(std::sync::Arc::new(MemoryStore::new())),
        "jsonl" => Ok(std::sync::Arc::new(JsonlStore::open(&config.path).await?)),
        other => anyhow::bail!("unknown storage backend: {}", other),
    }
}

#[derive(Default)]
struct MemoryRecords {
    forecasts: Vec<ForecastRecord>,
    outcomes: Vec<OutcomeRecord>,
    versions: Vec<ModelVersion>,
    closed: bool,
}

/// In-process store for tests and replays
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<MemoryRecords>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forecasts(&self) -> Vec<ForecastRecord> {
        self.records.lock().forecasts.clone()
    }

    pub fn outcomes(&self) -> Vec<OutcomeRecord> {
        self.records.lock().outcomes.clone()
    }

    pub fn versions(&self) -> Vec<ModelVersion> {
        self.records.lock().versions.clone()
    }

    fn with_open<T>(&self, f: impl FnOnce(&mut MemoryRecords) -> T) -> EngineResult<T> {
        let mut records = self.records.lock();
        if records.closed {
            return Err(closed());
        }
        Ok(f(&mut records))
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn append_forecast(&self, forecast: &ForecastRecord) -> EngineResult<()> {
        self.with_open(|r| r.forecasts.push(forecast.clone()))
    }

    async fn append_outcome(&self, outcome: &OutcomeRecord) -> EngineResult<()> {
        self.with_open(|r| r.outcomes.push(outcome.clone()))
    }

    async fn append_version(&self, version: &ModelVersion) -> EngineResult<()> {
        self.with_open(|r| r.versions.push(version.clone()))
    }

    async fn last_known_good(&self) -> EngineResult<Option<ModelVersion>> {
        self.with_open(|r| r.versions.iter().max_by_key(|v| v.id).cloned())
    }

    async fn recent_outcomes(&self, limit: usize) -> EngineResult<Vec<OutcomeRecord>> {
        self.with_open(|r| {
            let skip = r.outcomes.len().saturating_sub(limit);
            r.outcomes[skip..].to_vec()
        })
    }

    async fn health_check(&self) -> EngineResult<()> {
        self.with_open(|_| ())
    }

    async fn close(&self) -> EngineResult<()> {
        self.records.lock().closed = true;
        Ok(())
    }
}

struct JsonlWriters {
    forecasts: BufWriter<File>,
    outcomes: BufWriter<File>,
    versions: BufWriter<File>,
}

/// Append-only JSON-lines files under one directory
pub struct JsonlStore {
    dir: PathBuf,
    writers: tokio::sync::Mutex<Option<JsonlWriters>>,
}

impl JsonlStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create storage directory {:?}", dir))?;

        let writers = JsonlWriters {
            forecasts: open_append(&dir.join(FORECASTS_FILE)).await?,
            outcomes: open_append(&dir.join(OUTCOMES_FILE)).await?,
            versions: open_append(&dir.join(VERSIONS_FILE)).await?,
        };
        info!("JSONL store opened at {:?}", dir);

        Ok(Self {
            dir,
            writers: tokio::sync::Mutex::new(Some(writers)),
        })
    }

    async fn append<T: Serialize + Sync>(
        &self,
        select: fn(&mut JsonlWriters) -> &mut BufWriter<File>,
        record: &T,
    ) -> EngineResult<()> {
        let mut line = serde_json::to_vec(record).map_err(store_error)?;
        line.push(b'\n');

        let mut guard = self.writers.lock().await;
        let writers = guard.as_mut().ok_or_else(closed)?;
        let writer = select(writers);
        writer.write_all(&line).await.map_err(store_error)?;
        writer.flush().await.map_err(store_error)?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self, file: &str) -> EngineResult<Vec<T>> {
        if self.writers.lock().await.is_none() {
            return Err(closed());
        }
        let path = self.dir.join(file);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error(e)),
        };

        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A crash mid-append leaves a torn final line
                Err(e) => warn!("Skipping corrupt line {} in {:?}: {}", n + 1, path, e),
            }
        }
        Ok(records)
    }
}

async fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {:?}", path))?;
    Ok(BufWriter::new(file))
}

#[async_trait]
impl Persistence for JsonlStore {
    async fn append_forecast(&self, forecast: &ForecastRecord) -> EngineResult<()> {
        self.append(|w| &mut w.forecasts, forecast).await
    }

    async fn append_outcome(&self, outcome: &OutcomeRecord) -> EngineResult<()> {
        self.append(|w| &mut w.outcomes, outcome).await
    }

    async fn append_version(&self, version: &ModelVersion) -> EngineResult<()> {
        self.append(|w| &mut w.versions, version).await?;
        debug!("Persisted model version v{}", version.id);
        Ok(())
    }

    async fn last_known_good(&self) -> EngineResult<Option<ModelVersion>> {
        let versions: Vec<ModelVersion> = self.read_all(VERSIONS_FILE).await?;
        Ok(versions.into_iter().max_by_key(|v| v.id))
    }

    async fn recent_outcomes(&self, limit: usize) -> EngineResult<Vec<OutcomeRecord>> {
        let mut outcomes: Vec<OutcomeRecord> = self.read_all(OUTCOMES_FILE).await?;
        let skip = outcomes.len().saturating_sub(limit);
        Ok(outcomes.split_off(skip))
    }

    async fn health_check(&self) -> EngineResult<()> {
        if self.writers.lock().await.is_none() {
            return Err(closed());
        }
        tokio::fs::metadata(&self.dir).await.map_err(store_error)?;
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        let Some(mut writers) = self.writers.lock().await.take() else {
            return Ok(());
        };
        for writer in [&mut writers.forecasts, &mut writers.outcomes, &mut writers.versions] {
            writer.flush().await.map_err(store_error)?;
            writer.get_mut().sync_all().await.map_err(store_error)?;
        }
        info!("JSONL store at {:?} closed", self.dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn outcome(id: u8) -> OutcomeRecord {
        OutcomeRecord {
            forecast_id: Uuid::from_bytes([id; 16]),
            symbol: "BTC".to_string(),
            model_version: 1,
            horizon_ms: 1_000,
            realized_return: 0.01,
            predicted_return: 0.0,
            signed_error: 0.01,
            abs_error: 0.01,
            normalized_error: 1.0,
            inputs: vec![1.0, 0.5, 0.5],
            timestamp: id as i64,
        }
    }

    fn version(id: u64) -> ModelVersion {
        let mut v = ModelVersion::prior(1, 0.01, 0);
        v.id = id;
        v
    }

    #[tokio::test]
    async fn test_memory_store_rejects_after_close() {
        let store = MemoryStore::new();
        store.append_version(&version(1)).await.unwrap();
        store.close().await.unwrap();
        assert!(store.append_version(&version(2)).await.is_err());
        assert!(store.health_check().await.is_err());
        assert_eq!(store.versions().len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_last_known_good_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlStore::open(dir.path()).await.unwrap();
            store.append_version(&version(1)).await.unwrap();
            store.append_version(&version(3)).await.unwrap();
            store.append_outcome(&outcome(1)).await.unwrap();
            store.close().await.unwrap();
        }

        let store = JsonlStore::open(dir.path()).await.unwrap();
        assert_eq!(store.last_known_good().await.unwrap().unwrap().id, 3);
        assert_eq!(store.recent_outcomes(10).await.unwrap(), vec![outcome(1)]);
    }

    #[tokio::test]
    async fn test_jsonl_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        store.append_version(&version(2)).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(VERSIONS_FILE))
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"{\"id\":9,\"param"))
            .unwrap();
        assert_eq!(store.last_known_good().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_recent_outcomes_keeps_newest() {
        let store = MemoryStore::new();
        for id in 0..5 {
            store.append_outcome(&outcome(id)).await.unwrap();
        }
        let recent = store.recent_outcomes(2).await.unwrap();
        assert_eq!(recent.iter().map(|o| o.timestamp).collect::<Vec<_>>(), vec![3, 4]);
    }
}

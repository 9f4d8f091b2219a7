//! Document-store access for custlink: the `RecordStore` seam plus in-memory,
//! JSON-fixture and Postgres implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use custlink_core::{LinkUpdate, SourceRecord, TargetRecord};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "custlink-storage";

pub const SOURCE_FIXTURE_FILE: &str = "source_records.json";
pub const TARGET_FIXTURE_FILE: &str = "target_records.json";

/// One raw document as the store holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub key: String,
    pub body: JsonValue,
}

impl StoredDocument {
    pub fn new(key: impl Into<String>, body: JsonValue) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The document store the reconciliation core reads from and writes links to.
///
/// Loads are complete or fail; there is no partial result.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_source_documents(&self) -> Result<Vec<StoredDocument>, StoreError>;

    async fn load_target_documents(&self) -> Result<Vec<StoredDocument>, StoreError>;

    /// Merge the link fields of every update onto its source document, all or
    /// nothing. Missing documents are created holding only the link fields.
    async fn commit_link_batch(&self, batch: &[LinkUpdate]) -> Result<(), StoreError>;
}

/// Shallow object merge: keys in `fields` overwrite, everything else stays.
pub fn merge_into(doc: &mut JsonValue, fields: &JsonValue) {
    if !doc.is_object() {
        *doc = JsonValue::Object(Map::new());
    }
    if let (JsonValue::Object(target), JsonValue::Object(patch)) = (doc, fields) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn merge_batch(docs: &mut BTreeMap<String, JsonValue>, batch: &[LinkUpdate]) {
    for update in batch {
        let doc = docs
            .entry(update.source_id.clone())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        merge_into(doc, &update.merge_fields());
    }
}

fn to_stored(docs: &BTreeMap<String, JsonValue>) -> Vec<StoredDocument> {
    docs.iter()
        .map(|(key, body)| StoredDocument::new(key.clone(), body.clone()))
        .collect()
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_reads: Option<String>,
    fail_target_reads: Option<String>,
    fail_commit_at: Option<usize>,
}

/// In-process store. Batches apply atomically under one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sources: Mutex<BTreeMap<String, JsonValue>>,
    targets: Mutex<BTreeMap<String, JsonValue>>,
    faults: Mutex<FaultPlan>,
    committed_batches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, record: &SourceRecord) -> Self {
        self.sources
            .get_mut()
            .insert(record.source_id.clone(), record.to_document());
        self
    }

    pub fn with_source_document(mut self, key: impl Into<String>, body: JsonValue) -> Self {
        self.sources.get_mut().insert(key.into(), body);
        self
    }

    pub fn with_target(mut self, store_key: impl Into<String>, record: &TargetRecord) -> Self {
        self.targets
            .get_mut()
            .insert(store_key.into(), record.to_document());
        self
    }

    pub fn with_target_document(mut self, store_key: impl Into<String>, body: JsonValue) -> Self {
        self.targets.get_mut().insert(store_key.into(), body);
        self
    }

    /// Every subsequent load fails with `reason`.
    pub async fn fail_reads(&self, reason: impl Into<String>) {
        self.faults.lock().await.fail_reads = Some(reason.into());
    }

    /// Only target loads fail; source loads keep working.
    pub async fn fail_target_reads(&self, reason: impl Into<String>) {
        self.faults.lock().await.fail_target_reads = Some(reason.into());
    }

    /// Fail the commit attempted once `committed` batches have succeeded.
    /// One-shot: later commits go through.
    pub async fn fail_commit_at(&self, committed: usize) {
        self.faults.lock().await.fail_commit_at = Some(committed);
    }

    pub fn committed_batches(&self) -> usize {
        self.committed_batches.load(Ordering::SeqCst)
    }

    pub async fn source_document(&self, key: &str) -> Option<JsonValue> {
        self.sources.lock().await.get(key).cloned()
    }

    pub async fn source_documents(&self) -> BTreeMap<String, JsonValue> {
        self.sources.lock().await.clone()
    }

    async fn check_reads(&self, targets: bool) -> Result<(), StoreError> {
        let faults = self.faults.lock().await;
        let fault = match (&faults.fail_reads, targets) {
            (Some(reason), _) => Some(reason),
            (None, true) => faults.fail_target_reads.as_ref(),
            (None, false) => None,
        };
        match fault {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_source_documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        self.check_reads(false).await?;
        Ok(to_stored(&*self.sources.lock().await))
    }

    async fn load_target_documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        self.check_reads(true).await?;
        Ok(to_stored(&*self.targets.lock().await))
    }

    async fn commit_link_batch(&self, batch: &[LinkUpdate]) -> Result<(), StoreError> {
        {
            let mut faults = self.faults.lock().await;
            let committed = self.committed_batches();
            if faults.fail_commit_at == Some(committed) {
                faults.fail_commit_at = None;
                return Err(StoreError::Unavailable(format!(
                    "injected failure committing batch {}",
                    committed + 1
                )));
            }
        }

        let mut sources = self.sources.lock().await;
        merge_batch(&mut sources, batch);
        self.committed_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fixture directory holding `source_records.json` and `target_records.json`,
/// each a JSON object of document key -> document body.
///
/// Every committed batch rewrites the source file through a temp file and an
/// atomic rename, so earlier batches survive a later failure.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.dir.join(SOURCE_FIXTURE_FILE)
    }

    pub fn targets_path(&self) -> PathBuf {
        self.dir.join(TARGET_FIXTURE_FILE)
    }

    async fn read_map(path: &Path) -> Result<BTreeMap<String, JsonValue>, StoreError> {
        let text = fs::read_to_string(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn write_map_atomic(
        path: &Path,
        docs: &BTreeMap<String, JsonValue>,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(docs).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn load_source_documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(to_stored(&Self::read_map(&self.sources_path()).await?))
    }

    async fn load_target_documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(to_stored(&Self::read_map(&self.targets_path()).await?))
    }

    async fn commit_link_batch(&self, batch: &[LinkUpdate]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.sources_path();
        let mut docs = Self::read_map(&path).await?;
        merge_batch(&mut docs, batch);
        Self::write_map_atomic(&path, &docs).await?;
        debug!(path = %path.display(), updates = batch.len(), "committed link batch to fixture file");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Postgres-backed store; documents live in JSONB columns.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    async fn load_table(&self, sql: &str, key_column: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredDocument {
                key: row.try_get(key_column)?,
                body: row.try_get("doc")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn load_source_documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        self.load_table(
            "SELECT source_id, doc FROM source_records ORDER BY source_id",
            "source_id",
        )
        .instrument(info_span!("pg_load", table = "source_records"))
        .await
    }

    async fn load_target_documents(&self) -> Result<Vec<StoredDocument>, StoreError> {
        self.load_table(
            "SELECT store_key, doc FROM target_records ORDER BY store_key",
            "store_key",
        )
        .instrument(info_span!("pg_load", table = "target_records"))
        .await
    }

    async fn commit_link_batch(&self, batch: &[LinkUpdate]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for update in batch {
            sqlx::query(
                r#"
                INSERT INTO source_records (source_id, doc)
                VALUES ($1, $2)
                ON CONFLICT (source_id)
                DO UPDATE SET doc = source_records.doc || EXCLUDED.doc
                "#,
            )
            .bind(&update.source_id)
            .bind(update.merge_fields())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

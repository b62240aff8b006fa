//! Blob sources and transactional stat stores for the Medium stats importer.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mstats_core::{ArticleSnapshot, Mutation, MutationBatch, ViewReadHistoryEntry};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "mstats-storage";

/// Full content of one uploaded object.
#[derive(Debug, Clone)]
pub struct ObjectBytes {
    pub bucket: String,
    pub name: String,
    pub content_hash: String,
    pub body: Vec<u8>,
}

impl ObjectBytes {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            content_hash: sha256_hex(&body),
            body,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.body.len()
    }

    /// Decodes the body as UTF-8 text.
    pub fn into_text(self) -> Result<String, SourceError> {
        String::from_utf8(self.body).map_err(|err| SourceError::NotUtf8 {
            bucket: self.bucket,
            name: self.name,
            valid_up_to: err.utf8_error().valid_up_to(),
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("object {bucket}/{name} not found")]
    NotFound { bucket: String, name: String },
    #[error("object {bucket}/{name} is not UTF-8 text (valid up to byte {valid_up_to})")]
    NotUtf8 {
        bucket: String,
        name: String,
        valid_up_to: usize,
    },
    #[error("object name {0:?} escapes the bucket")]
    InvalidName(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid object url: {0}")]
    InvalidUrl(String),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Opens the uploaded object named by a notification and reads it whole.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn read_object(&self, bucket: &str, name: &str) -> Result<ObjectBytes, SourceError>;
}

/// Objects laid out on disk as `<root>/<bucket>/<name>`.
#[derive(Debug, Clone)]
pub struct FsObjectSource {
    root: PathBuf,
}

impl FsObjectSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf, SourceError> {
        for part in [bucket, name] {
            let escapes = Path::new(part)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if part.is_empty() || escapes {
                return Err(SourceError::InvalidName(part.to_string()));
            }
        }
        Ok(self.root.join(bucket).join(name))
    }
}

#[async_trait]
impl ObjectSource for FsObjectSource {
    async fn read_object(&self, bucket: &str, name: &str) -> Result<ObjectBytes, SourceError> {
        let path = self.object_path(bucket, name)?;
        match fs::read(&path).await {
            Ok(body) => Ok(ObjectBytes::new(bucket, name, body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            }),
            Err(source) => Err(SourceError::Io { path, source }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Object stores ask clients to retry 408, 429 and 5xx.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Reads publicly readable objects over HTTP from `<base_url>/<bucket>/<name>`.
#[derive(Debug)]
pub struct HttpObjectSource {
    client: reqwest::Client,
    base_url: Url,
    backoff: BackoffPolicy,
}

impl HttpObjectSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing object base url {}", config.base_url))?;

        Ok(Self {
            client,
            base_url,
            backoff: config.backoff,
        })
    }

    pub fn object_url(&self, bucket: &str, name: &str) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SourceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(bucket)
            .extend(name.split('/'));
        Ok(url)
    }

    async fn fetch(&self, url: &Url, bucket: &str, name: &str) -> Result<ObjectBytes, SourceError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(ObjectBytes::new(bucket, name, body));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(SourceError::NotFound {
                            bucket: bucket.to_string(),
                            name: name.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, %status, "retrying object fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying object fetch");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(SourceError::Request(err)),
            None => Err(SourceError::InvalidUrl(url.to_string())),
        }
    }
}

#[async_trait]
impl ObjectSource for HttpObjectSource {
    async fn read_object(&self, bucket: &str, name: &str) -> Result<ObjectBytes, SourceError> {
        let url = self.object_url(bucket, name)?;
        let span = info_span!("object_fetch", bucket, name, url = %url);
        self.fetch(&url, bucket, name).instrument(span).await
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("batch rejected: {0}")]
    Rejected(String),
}

/// Applies a whole mutation batch as one transaction: all of it or none of it.
#[async_trait]
pub trait AtomicWriter: Send + Sync {
    async fn apply(&self, batch: &MutationBatch) -> Result<(), WriteError>;
}

/// Postgres store with `article_stats` keyed by `id` and `readview_history`
/// keyed by `(id, update_time)`.
#[derive(Debug, Clone)]
pub struct PgAtomicWriter {
    pool: PgPool,
}

impl PgAtomicWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to stats database")?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl AtomicWriter for PgAtomicWriter {
    async fn apply(&self, batch: &MutationBatch) -> Result<(), WriteError> {
        if batch.is_empty() {
            return Ok(());
        }

        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await?;

        for snapshot in &batch.snapshots {
            sqlx::query(
                r#"
                INSERT INTO article_stats
                    (id, title, link, publication, mins, views, reads, read_ratio, fans,
                     pub_date, live_date, last_update_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::date, $11::date, transaction_timestamp())
                ON CONFLICT (id) DO UPDATE SET
                    title = EXCLUDED.title,
                    link = EXCLUDED.link,
                    publication = EXCLUDED.publication,
                    mins = EXCLUDED.mins,
                    views = EXCLUDED.views,
                    reads = EXCLUDED.reads,
                    read_ratio = EXCLUDED.read_ratio,
                    fans = EXCLUDED.fans,
                    pub_date = EXCLUDED.pub_date,
                    live_date = EXCLUDED.live_date,
                    last_update_time = EXCLUDED.last_update_time
                "#,
            )
            .bind(&snapshot.id)
            .bind(&snapshot.title)
            .bind(&snapshot.link)
            .bind(&snapshot.publication)
            .bind(snapshot.minutes_to_read)
            .bind(snapshot.views)
            .bind(snapshot.reads)
            .bind(snapshot.read_ratio)
            .bind(snapshot.fans)
            .bind(&snapshot.publish_date)
            .bind(&snapshot.live_date)
            .execute(&mut *tx)
            .await?;
        }

        for entry in &batch.history {
            sqlx::query(
                r#"
                INSERT INTO readview_history (id, update_time, views, reads)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id, update_time) DO UPDATE SET
                    views = EXCLUDED.views,
                    reads = EXCLUDED.reads
                "#,
            )
            .bind(&entry.id)
            .bind(entry.observed_date)
            .bind(entry.views)
            .bind(entry.reads)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Snapshot row as held by [`MemoryStore`], with its commit stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub snapshot: ArticleSnapshot,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MemoryTables {
    snapshots: BTreeMap<String, StoredSnapshot>,
    history: BTreeMap<(String, NaiveDate), ViewReadHistoryEntry>,
}

/// In-process store with the same upsert and all-or-nothing semantics as the
/// Postgres writer.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    fail_next: AtomicBool,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `apply` stage the whole batch and then refuse to commit.
    pub fn fail_next_apply(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn snapshots(&self) -> Vec<ArticleSnapshot> {
        let tables = self.tables.lock().await;
        tables
            .snapshots
            .values()
            .map(|stored| stored.snapshot.clone())
            .collect()
    }

    pub async fn snapshot(&self, id: &str) -> Option<StoredSnapshot> {
        self.tables.lock().await.snapshots.get(id).cloned()
    }

    pub async fn history(&self) -> Vec<ViewReadHistoryEntry> {
        self.tables.lock().await.history.values().cloned().collect()
    }
}

#[async_trait]
impl AtomicWriter for MemoryStore {
    async fn apply(&self, batch: &MutationBatch) -> Result<(), WriteError> {
        let mut tables = self.tables.lock().await;
        let committed_at = Utc::now();

        let mut staged = tables.clone();
        for mutation in batch.mutations() {
            match mutation {
                Mutation::UpsertSnapshot(snapshot) => {
                    staged.snapshots.insert(
                        snapshot.id.clone(),
                        StoredSnapshot {
                            snapshot,
                            last_update_time: committed_at,
                        },
                    );
                }
                Mutation::UpsertHistory(entry) => {
                    staged
                        .history
                        .insert((entry.id.clone(), entry.observed_date), entry);
                }
            }
        }

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(WriteError::Rejected("injected commit failure".to_string()));
        }

        *tables = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

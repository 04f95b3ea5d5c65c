//! Declarative description of queues, sources and datasets, loaded from TOML.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::error::CrawlError;
use crate::jobs::model::{JobOptions, Retention, WorkerPoolConfig};
use crate::retry::Backoff;

pub const MAX_DATASET_NAME_LEN: usize = 46;

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("cannot read catalogue: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse catalogue: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid catalogue: {0}")]
    Validation(String),
}

impl From<CatalogueError> for CrawlError {
    fn from(e: CatalogueError) -> Self {
        CrawlError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalogue {
    #[serde(default)]
    pub queues: Vec<QueueProfile>,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueProfile {
    pub name: String,
    #[serde(flatten)]
    pub pool: WorkerPoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub base_url: String,
    /// Per-source throughput ceiling for this process.
    pub requests_per_second: Option<u32>,
    /// Body field the source uses to report errors on HTTP 200.
    #[serde(default = "default_error_code_field")]
    pub error_code_field: String,
    /// `error_code` values that mean throttling.
    #[serde(default)]
    pub rate_limit_codes: Vec<String>,
    /// `error_code` values that mean the session token lapsed.
    #[serde(default)]
    pub session_expired_codes: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requires_session: bool,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    pub session: Option<SessionSpec>,
}

/// How requests to a session source are made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Plain HTTP with harvested credential headers.
    #[default]
    Signed,
    /// `fetch()` from inside the warmed-up browser page.
    InPage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSpec {
    /// Page whose traffic carries the signed headers.
    pub warmup_url: String,
    /// Known-good page to return to after a failed in-page fetch.
    pub recovery_url: Option<String>,
    #[serde(default = "default_nonce_header")]
    pub nonce_header: String,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_timestamp_header")]
    pub timestamp_header: String,
    #[serde(default = "default_version_header")]
    pub version_header: String,
    #[serde(default = "default_harvest_timeout_ms")]
    pub harvest_timeout_ms: u64,
    #[serde(default = "default_page_fetch_retries")]
    pub page_fetch_retries: u32,
}

impl SessionSpec {
    pub fn recovery_url(&self) -> &str {
        self.recovery_url.as_deref().unwrap_or(&self.warmup_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub source: String,
    pub queue: String,
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Item field holding the conflict key (`symbol`, `pool_id`, `user_address`).
    pub natural_key: String,
    pub fan_out: FanOutSpec,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub remove_on_complete: Retention,
    #[serde(default)]
    pub remove_on_fail: Retention,
    #[serde(default)]
    pub storage: StorageSpec,
    #[serde(default)]
    pub required_fields: Vec<String>,
    pub every_secs: Option<u64>,
}

impl DatasetSpec {
    /// Options shared by every job fanned out for this dataset.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            priority: self.priority,
            delay_ms: self.delay_ms,
            attempts: self.attempts,
            backoff: self.backoff,
            job_id: None,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FanOutSpec {
    Offsets {
        page_size: u64,
        #[serde(default = "default_items_pointer")]
        items_pointer: String,
        #[serde(default = "default_total_pointer")]
        total_pointer: String,
        #[serde(default = "default_offset_param")]
        offset_param: String,
        #[serde(default = "default_limit_param")]
        limit_param: String,
    },
    Entities {
        id_param: String,
        #[serde(default)]
        ids: Vec<String>,
        /// Where the entity object sits in the response; empty for the whole body.
        #[serde(default = "default_entity_pointer")]
        entity_pointer: String,
        list: Option<EntityListSpec>,
    },
}

/// Cursor-paged listing of entity ids.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityListSpec {
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub ids_pointer: String,
    pub cursor_pointer: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSpec {
    #[serde(default = "default_true")]
    pub table: bool,
    pub documents: Option<DocumentTarget>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            table: true,
            documents: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentTarget {
    pub database: String,
    pub collection: String,
}

fn default_error_code_field() -> String {
    "error_code".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_nonce_header() -> String {
    "x-nonce".into()
}
fn default_signature_header() -> String {
    "x-signature".into()
}
fn default_timestamp_header() -> String {
    "x-timestamp".into()
}
fn default_version_header() -> String {
    "x-version".into()
}
fn default_harvest_timeout_ms() -> u64 {
    20_000
}
fn default_page_fetch_retries() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    250
}
fn default_attempts() -> u32 {
    3
}
fn default_items_pointer() -> String {
    "/data".into()
}
fn default_total_pointer() -> String {
    "/total_count".into()
}
fn default_offset_param() -> String {
    "offset".into()
}
fn default_limit_param() -> String {
    "limit".into()
}
fn default_entity_pointer() -> String {
    "/data".into()
}
fn default_cursor_param() -> String {
    "cursor".into()
}
fn default_true() -> bool {
    true
}

impl Catalogue {
    pub fn load(path: &Path) -> Result<Self, CatalogueError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CatalogueError> {
        let catalogue: Catalogue = toml::from_str(content)?;
        catalogue.validate()?;
        Ok(catalogue)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueProfile> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn source(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn require_dataset(&self, name: &str) -> Result<&DatasetSpec, CrawlError> {
        self.dataset(name)
            .ok_or_else(|| CrawlError::BadPayload(format!("unknown dataset {name:?}")))
    }

    pub fn require_source(&self, name: &str) -> Result<&SourceSpec, CrawlError> {
        self.source(name)
            .ok_or_else(|| CrawlError::Config(format!("unknown source {name:?}")))
    }

    pub fn validate(&self) -> Result<(), CatalogueError> {
        let mut queue_names = HashSet::new();
        for q in &self.queues {
            validate_identifier("queue", &q.name)?;
            if !queue_names.insert(q.name.as_str()) {
                return Err(invalid(format!("duplicate queue {:?}", q.name)));
            }
            if q.pool.concurrency == 0 {
                return Err(invalid(format!("queue {:?}: concurrency must be > 0", q.name)));
            }
            if let Some(rl) = q.pool.rate_limiter {
                if rl.max == 0 || rl.per_ms == 0 {
                    return Err(invalid(format!(
                        "queue {:?}: rate_limiter needs max > 0 and per_ms > 0",
                        q.name
                    )));
                }
            }
        }

        let mut source_names = HashSet::new();
        for s in &self.sources {
            validate_identifier("source", &s.name)?;
            if !source_names.insert(s.name.as_str()) {
                return Err(invalid(format!("duplicate source {:?}", s.name)));
            }
            if !(s.base_url.starts_with("http://") || s.base_url.starts_with("https://")) {
                return Err(invalid(format!(
                    "source {:?}: base_url must be http(s), got {:?}",
                    s.name, s.base_url
                )));
            }
            if s.requires_session && s.session.is_none() {
                return Err(invalid(format!(
                    "source {:?} requires a session but has no [sources.session]",
                    s.name
                )));
            }
            if s.fetch_mode == FetchMode::InPage && !s.requires_session {
                return Err(invalid(format!(
                    "source {:?}: fetch_mode = \"in_page\" needs requires_session = true",
                    s.name
                )));
            }
        }

        let mut dataset_names = HashSet::new();
        for d in &self.datasets {
            validate_identifier("dataset", &d.name)?;
            // partition names add up to 17 chars and must fit in 63
            if d.name.len() > MAX_DATASET_NAME_LEN {
                return Err(invalid(format!(
                    "dataset {:?}: name longer than {MAX_DATASET_NAME_LEN} chars",
                    d.name
                )));
            }
            if !dataset_names.insert(d.name.as_str()) {
                return Err(invalid(format!("duplicate dataset {:?}", d.name)));
            }
            if !source_names.contains(d.source.as_str()) {
                return Err(invalid(format!(
                    "dataset {:?} names unknown source {:?}",
                    d.name, d.source
                )));
            }
            if !queue_names.contains(d.queue.as_str()) {
                return Err(invalid(format!(
                    "dataset {:?} names unknown queue {:?}",
                    d.name, d.queue
                )));
            }
            if d.natural_key.trim().is_empty() {
                return Err(invalid(format!("dataset {:?}: natural_key is empty", d.name)));
            }
            if d.attempts == 0 {
                return Err(invalid(format!("dataset {:?}: attempts must be > 0", d.name)));
            }
            if d.every_secs == Some(0) {
                return Err(invalid(format!("dataset {:?}: every_secs must be > 0", d.name)));
            }
            if !d.storage.table && d.storage.documents.is_none() {
                return Err(invalid(format!("dataset {:?} has no storage target", d.name)));
            }
            if let Some(doc) = &d.storage.documents {
                if doc.database.trim().is_empty() || doc.collection.trim().is_empty() {
                    return Err(invalid(format!(
                        "dataset {:?}: documents need database and collection",
                        d.name
                    )));
                }
            }
            match &d.fan_out {
                FanOutSpec::Offsets { page_size, .. } if *page_size == 0 => {
                    return Err(invalid(format!("dataset {:?}: page_size must be > 0", d.name)));
                }
                FanOutSpec::Entities { ids, list, .. } if ids.is_empty() && list.is_none() => {
                    return Err(invalid(format!(
                        "dataset {:?}: entities mode needs ids or a list endpoint",
                        d.name
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn invalid(msg: String) -> CatalogueError {
    CatalogueError::Validation(msg)
}

/// Names used in SQL identifiers and cache keys: `[a-z0-9_]+`.
pub fn validate_identifier(kind: &str, name: &str) -> Result<(), CatalogueError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(invalid(format!(
            "{kind} name {name:?} must match [a-z0-9_]+"
        )))
    }
}

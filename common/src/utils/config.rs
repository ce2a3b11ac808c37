use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Operational tunables for the Ingestion Queue, Chunking Pipeline, and
/// Composite Enrichment debounce (spec.md §4.5, §4.9, §4.10, §5).
#[derive(Clone, Deserialize, Debug)]
pub struct PipelineTuning {
    #[serde(default = "default_queue_concurrency")]
    pub queue_concurrency: usize,
    #[serde(default = "default_chunking_concurrency")]
    pub chunking_max_concurrent: usize,
    #[serde(default = "default_rpm_budget")]
    pub rpm_budget: u32,
    #[serde(default = "default_avg_requests_per_object")]
    pub avg_requests_per_object: f64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_window_secs")]
    pub circuit_breaker_window_secs: u64,
    #[serde(default = "default_circuit_breaker_half_open_probes")]
    pub circuit_breaker_half_open_probes: u32,
    #[serde(default = "default_debounce_secs")]
    pub composite_enrichment_debounce_secs: u64,
    #[serde(default = "default_html_parse_timeout_secs")]
    pub html_parse_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub chunking_shutdown_timeout_secs: u64,
    #[serde(default = "default_orphan_attempt_limit")]
    pub orphan_attempt_limit: u32,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            queue_concurrency: default_queue_concurrency(),
            chunking_max_concurrent: default_chunking_concurrency(),
            rpm_budget: default_rpm_budget(),
            avg_requests_per_object: default_avg_requests_per_object(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_window_secs: default_circuit_breaker_window_secs(),
            circuit_breaker_half_open_probes: default_circuit_breaker_half_open_probes(),
            composite_enrichment_debounce_secs: default_debounce_secs(),
            html_parse_timeout_secs: default_html_parse_timeout_secs(),
            chunking_shutdown_timeout_secs: default_shutdown_timeout_secs(),
            orphan_attempt_limit: default_orphan_attempt_limit(),
        }
    }
}

fn default_queue_concurrency() -> usize {
    5
}
fn default_chunking_concurrency() -> usize {
    10
}
fn default_rpm_budget() -> u32 {
    4900
}
fn default_avg_requests_per_object() -> f64 {
    1.5
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_circuit_breaker_window_secs() -> u64 {
    60
}
fn default_circuit_breaker_half_open_probes() -> u32 {
    2
}
fn default_debounce_secs() -> u64 {
    5
}
fn default_html_parse_timeout_secs() -> u64 {
    30
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_orphan_attempt_limit() -> u32 {
    3
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    /// Embedding dimension used by both RS schema checks and the VS HNSW
    /// index (spec.md §3, §6: fixed at 1536).
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub tuning: PipelineTuning,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}

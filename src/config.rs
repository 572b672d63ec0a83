//! Configuration parsing and validation.
//!
//! Hearth is configured via a TOML file (default: `config/hearth.toml`).
//! Every section is optional and falls back to the defaults below.
//!
//! # Example
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//!
//! [resources]
//! memory_ceiling_mb = 1024
//! memory_soft_threshold_mb = 800
//! sample_interval_ms = 2000
//! index_capacity_chunks = 20000
//!
//! [chunking]
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [context]
//! budget = 4000
//! unit = "chars"        # or "tokens"
//! top_k = 5
//! turn_window = 20
//!
//! [scheduler]
//! max_workers = 4
//! fairness_limit = 4
//! history_limit = 1000
//! max_queue = 100       # queued tasks across all kinds
//!
//! [embedding]
//! provider = "hashing"  # or "local"
//! dims = 384
//!
//! [generation]
//! provider = "extractive"  # or "disabled"
//! timeout_secs = 30
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_core::chunk::ChunkParams;
use hearth_core::compose::ComposeParams;
use hearth_core::models::BudgetUnit;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl StorageConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourcesConfig {
    #[serde(default = "default_memory_ceiling_mb")]
    pub memory_ceiling_mb: u64,
    #[serde(default = "default_memory_soft_threshold_mb")]
    pub memory_soft_threshold_mb: u64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_index_capacity_chunks")]
    pub index_capacity_chunks: usize,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_mb: default_memory_ceiling_mb(),
            memory_soft_threshold_mb: default_memory_soft_threshold_mb(),
            sample_interval_ms: default_sample_interval_ms(),
            index_capacity_chunks: default_index_capacity_chunks(),
        }
    }
}

fn default_memory_ceiling_mb() -> u64 {
    1024
}
fn default_memory_soft_threshold_mb() -> u64 {
    800
}
fn default_sample_interval_ms() -> u64 {
    2000
}
fn default_index_capacity_chunks() -> usize {
    20_000
}

impl ResourcesConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams::new(self.chunk_size, self.chunk_overlap)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_budget")]
    pub budget: usize,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_turn_window")]
    pub turn_window: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            unit: default_unit(),
            top_k: default_top_k(),
            turn_window: default_turn_window(),
        }
    }
}

fn default_budget() -> usize {
    4000
}
fn default_unit() -> String {
    "chars".to_string()
}
fn default_top_k() -> usize {
    5
}
fn default_turn_window() -> usize {
    20
}

impl ContextConfig {
    pub fn budget_unit(&self) -> BudgetUnit {
        match self.unit.as_str() {
            "tokens" => BudgetUnit::Tokens,
            _ => BudgetUnit::Chars,
        }
    }

    pub fn compose_params(&self) -> ComposeParams {
        ComposeParams {
            top_k: self.top_k,
            turn_window: self.turn_window,
            unit: self.budget_unit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_fairness_limit")]
    pub fairness_limit: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            fairness_limit: default_fairness_limit(),
            history_limit: default_history_limit(),
            max_queue: default_max_queue(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}
fn default_fairness_limit() -> usize {
    4
}
fn default_history_limit() -> usize {
    1000
}
fn default_max_queue() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        let config = Config::default();
        validate(&config)?;
        Ok(config)
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate resources
    let r = &config.resources;
    if r.memory_ceiling_mb == 0 {
        anyhow::bail!("resources.memory_ceiling_mb must be > 0");
    }
    if r.memory_soft_threshold_mb >= r.memory_ceiling_mb {
        anyhow::bail!(
            "resources.memory_soft_threshold_mb ({}) must be below memory_ceiling_mb ({})",
            r.memory_soft_threshold_mb,
            r.memory_ceiling_mb
        );
    }
    if r.sample_interval_ms == 0 {
        anyhow::bail!("resources.sample_interval_ms must be > 0");
    }
    if r.index_capacity_chunks == 0 {
        anyhow::bail!("resources.index_capacity_chunks must be > 0");
    }

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunk_size");
    }

    // Validate context
    if config.context.budget == 0 {
        anyhow::bail!("context.budget must be > 0");
    }
    if config.context.top_k < 1 {
        anyhow::bail!("context.top_k must be >= 1");
    }
    match config.context.unit.as_str() {
        "chars" | "tokens" => {}
        other => anyhow::bail!(
            "Unknown context unit: '{}'. Must be chars or tokens.",
            other
        ),
    }

    // Validate scheduler
    if config.scheduler.max_workers < 1 {
        anyhow::bail!("scheduler.max_workers must be >= 1");
    }
    if config.scheduler.fairness_limit < 1 {
        anyhow::bail!("scheduler.fairness_limit must be >= 1");
    }
    if config.scheduler.history_limit < 1 {
        anyhow::bail!("scheduler.history_limit must be >= 1");
    }
    if config.scheduler.max_queue < 1 {
        anyhow::bail!("scheduler.max_queue must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hashing" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing or local.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "extractive" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be extractive or disabled.",
            other
        ),
    }
    if config.generation.timeout_secs == 0 {
        anyhow::bail!("generation.timeout_secs must be > 0");
    }

    Ok(())
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::engine::extractor::RetryPolicy;

const CONFIG_FILE: &str = "config.yaml";

/// Default model order: CLIP first, then smaller/other variants
const DEFAULT_MODELS: &[&str] = &["clip-vit-b-32", "unicom-vit-b-32", "resnet50"];
const DEFAULT_LOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_PRECHECK_TIMEOUT_SECS: u64 = 5;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
const MAX_RETRIES_LIMIT: u32 = 10;
const RETRY_BASE_DELAY_LIMIT_MS: u64 = 60_000;
const DEFAULT_BATCH_SIZE: usize = 5;
const DEFAULT_PACING_DELAY_MS: u64 = 200;
const DEFAULT_MIN_SIMILARITY: f32 = 0.1;
const DEFAULT_RELAXED_SIMILARITY: f32 = 0.05;
const DEFAULT_FALLBACK_MIN: f32 = 0.5;
const DEFAULT_FALLBACK_MAX: f32 = 0.8;
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model names tried in order until one loads
    #[serde(default = "default_models")]
    pub configurations: Vec<String>,

    /// Budget for the whole sequence of load attempts, in seconds
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    #[serde(default)]
    pub show_download_progress: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            configurations: default_models(),
            load_timeout_secs: DEFAULT_LOAD_TIMEOUT_SECS,
            show_download_progress: false,
        }
    }
}

impl ModelConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Retry n waits n * retry_base_delay_ms
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_precheck_timeout_secs")]
    pub precheck_timeout_secs: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Largest remote image body accepted, in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            precheck_timeout_secs: DEFAULT_PRECHECK_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl ExtractionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn precheck_timeout(&self) -> Duration {
        Duration::from_secs(self.precheck_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batches, in milliseconds
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pacing_delay_ms: DEFAULT_PACING_DELAY_MS,
        }
    }
}

impl BatchConfig {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Threshold tried first [0.0, 1.0]
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,

    /// Threshold used when the first pass finds nothing
    #[serde(default = "default_relaxed_similarity")]
    pub relaxed_similarity: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_similarity: DEFAULT_MIN_SIMILARITY,
            relaxed_similarity: DEFAULT_RELAXED_SIMILARITY,
        }
    }
}

/// Score range handed out when no model is available
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_min")]
    pub min_score: f32,
    #[serde(default = "default_fallback_max")]
    pub max_score: f32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_FALLBACK_MIN,
            max_score: DEFAULT_FALLBACK_MAX,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

fn default_models() -> Vec<String> {
    DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()
}

fn default_load_timeout_secs() -> u64 {
    DEFAULT_LOAD_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

fn default_precheck_timeout_secs() -> u64 {
    DEFAULT_PRECHECK_TIMEOUT_SECS
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_max_image_bytes() -> u64 {
    DEFAULT_MAX_IMAGE_BYTES
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_pacing_delay_ms() -> u64 {
    DEFAULT_PACING_DELAY_MS
}

fn default_min_similarity() -> f32 {
    DEFAULT_MIN_SIMILARITY
}

fn default_relaxed_similarity() -> f32 {
    DEFAULT_RELAXED_SIMILARITY
}

fn default_fallback_min() -> f32 {
    DEFAULT_FALLBACK_MIN
}

fn default_fallback_max() -> f32 {
    DEFAULT_FALLBACK_MAX
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.configurations.is_empty() {
            bail!("model.configurations must name at least one model");
        }
        if self.model.configurations.iter().any(|m| m.trim().is_empty()) {
            bail!("model.configurations contains an empty model name");
        }
        if self.model.load_timeout_secs == 0 {
            bail!("model.load_timeout_secs must be greater than 0");
        }

        let ext = &self.extraction;
        if ext.precheck_timeout_secs == 0 || ext.fetch_timeout_secs == 0 {
            bail!("extraction timeouts must be greater than 0");
        }
        if ext.max_retries > MAX_RETRIES_LIMIT {
            bail!(
                "extraction.max_retries must be at most {MAX_RETRIES_LIMIT}, got {}",
                ext.max_retries
            );
        }
        if ext.retry_base_delay_ms > RETRY_BASE_DELAY_LIMIT_MS {
            bail!(
                "extraction.retry_base_delay_ms must be at most {RETRY_BASE_DELAY_LIMIT_MS}, got {}",
                ext.retry_base_delay_ms
            );
        }
        if ext.max_image_bytes == 0 {
            bail!("extraction.max_image_bytes must be greater than 0");
        }

        if self.batch.batch_size == 0 {
            bail!("batch.batch_size must be greater than 0");
        }

        let m = &self.matching;
        for (key, value) in [
            ("matching.min_similarity", m.min_similarity),
            ("matching.relaxed_similarity", m.relaxed_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{key} must be between 0.0 and 1.0, got {value}");
            }
        }
        if m.relaxed_similarity > m.min_similarity {
            bail!(
                "matching.relaxed_similarity ({}) must not exceed matching.min_similarity ({})",
                m.relaxed_similarity,
                m.min_similarity
            );
        }

        let f = &self.fallback;
        if !(0.0..=1.0).contains(&f.min_score)
            || !(0.0..=1.0).contains(&f.max_score)
            || f.min_score > f.max_score
        {
            bail!(
                "fallback score range [{}, {}] must be a non-empty range within [0.0, 1.0]",
                f.min_score,
                f.max_score
            );
        }

        if self.server.listen.trim().is_empty() {
            bail!("server.listen must not be empty");
        }

        Ok(())
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let config_str = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, config_str)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&path, config_str)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// `LOOKALIKE_BASE_PATH`, else `~/.local/share/lookalike`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("LOOKALIKE_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .map_err(|e| anyhow::anyhow!("could not determine home directory: {e:?}"))?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/lookalike"))
}

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for the scrape pool size.
pub const SCRAPE_WORKERS_ENV: &str = "OLO_SCRAPE_WORKERS";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_empty_backoff_secs")]
    pub empty_backoff_secs: u64,
    #[serde(default = "default_rescrape_after_days")]
    pub rescrape_after_days: u64,
}

fn default_lease_timeout_secs() -> u64 {
    1800
}
fn default_chunk_size() -> usize {
    10
}
fn default_empty_backoff_secs() -> u64 {
    5
}
fn default_rescrape_after_days() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: default_lease_timeout_secs(),
            chunk_size: default_chunk_size(),
            empty_backoff_secs: default_empty_backoff_secs(),
            rescrape_after_days: default_rescrape_after_days(),
        }
    }
}

impl QueueConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_secs(self.empty_backoff_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrapeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_hybrid_stale_days")]
    pub hybrid_stale_days: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_workers() -> usize {
    10
}
fn default_task_timeout_secs() -> u64 {
    120
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_hybrid_stale_days() -> i64 {
    180
}
fn default_user_agent() -> String {
    format!("open-locator/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            hybrid_stale_days: default_hybrid_stale_days(),
            user_agent: default_user_agent(),
        }
    }
}

impl ScrapeConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_epoch")]
    pub epoch: String,
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_harvest_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: i64,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: i64,
    #[serde(default = "default_high_volume_endpoints")]
    pub high_volume_endpoints: Vec<String>,
}

fn default_epoch() -> String {
    "2000-01-01".to_string()
}
fn default_retry_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    5
}
fn default_harvest_request_timeout_secs() -> u64 {
    120
}
fn default_error_backoff_secs() -> i64 {
    8 * 3600
}
fn default_min_interval_secs() -> i64 {
    120
}
fn default_high_volume_endpoints() -> Vec<String> {
    [
        "citeseerx.ist.psu.edu/oai2",
        "europepmc.org/oai.cgi",
        "export.arxiv.org/oai2",
        "www.ncbi.nlm.nih.gov/pmc/oai/oai.cgi",
        "www.ncbi.nlm.nih.gov/pmc/oai/oai.cgi2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            epoch: default_epoch(),
            retry_secs: default_retry_secs(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_harvest_request_timeout_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            min_interval_secs: default_min_interval_secs(),
            high_volume_endpoints: default_high_volume_endpoints(),
        }
    }
}

impl HarvestConfig {
    /// Parsed `epoch`. Validated at load time, so the fallback is never hit
    /// for configs that came through [`load_config`].
    pub fn epoch_date(&self) -> NaiveDate {
        NaiveDate::parse_from_str(&self.epoch, "%Y-%m-%d")
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }

    /// True when `base_url` is one of the endpoints that gets week-long windows.
    pub fn is_high_volume(&self, base_url: &str) -> bool {
        let trimmed = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        self.high_volume_endpoints.iter().any(|e| e == trimmed)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl Config {
    /// Config pointing at `db_path` with every other section defaulted.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            queue: QueueConfig::default(),
            scrape: ScrapeConfig::default(),
            harvest: HarvestConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(workers) = std::env::var(SCRAPE_WORKERS_ENV) {
        config.scrape.workers = workers
            .parse()
            .with_context(|| format!("{} must be a positive integer", SCRAPE_WORKERS_ENV))?;
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.queue.lease_timeout_secs == 0 {
        anyhow::bail!("queue.lease_timeout_secs must be > 0");
    }
    if config.queue.chunk_size == 0 {
        anyhow::bail!("queue.chunk_size must be > 0");
    }
    if config.scrape.workers == 0 {
        anyhow::bail!("scrape.workers must be > 0");
    }
    if config.scrape.task_timeout_secs == 0 {
        anyhow::bail!("scrape.task_timeout_secs must be > 0");
    }
    if NaiveDate::parse_from_str(&config.harvest.epoch, "%Y-%m-%d").is_err() {
        anyhow::bail!(
            "harvest.epoch must be a YYYY-MM-DD date, got '{}'",
            config.harvest.epoch
        );
    }
    if config.harvest.error_backoff_secs < 0 || config.harvest.min_interval_secs < 0 {
        anyhow::bail!("harvest backoff intervals must be >= 0");
    }
    Ok(())
}

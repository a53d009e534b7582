// Pipeline configuration, loaded from a JSON file

use crate::error::{PipelineError, Result};
use crate::mailbox::{
    ClaimOrder, DEFAULT_ACCEPT_PATTERN, DirMailbox, PRIORITY_ACCEPT_PATTERN,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/onionweave/config.json";

pub const FETCHER: &str = "fetcher";
pub const EXTRACTOR: &str = "extractor";
pub const ANALYZER: &str = "analyzer";
pub const FRONTIER: &str = "frontier";

/// Every worker pool, in pipeline order.
pub const POOLS: [&str; 4] = [FETCHER, EXTRACTOR, ANALYZER, FRONTIER];

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Root of every relative path below.
    pub data_dir: String,
    pub log_level: String,
    pub log_path: Option<String>,
    pub allowed_tlds: Vec<String>,
    pub runtime: RuntimeConfig,
    pub supervisor: SupervisorConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub fetcher: FetcherConfig,
    pub extractor: ExtractorConfig,
    pub analyzer: AnalyzerConfig,
    pub frontier: FrontierConfig,
}

/// Settings shared by every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub max_iterations: usize,
    pub max_poll_delay_ms: u64,
    /// `null` disables backpressure.
    pub outbox_max_size: Option<usize>,
    /// Failed messages are moved here instead of being deleted.
    pub dead_letter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub poll_delay_ms: u64,
    pub shutdown_grace_ms: u64,
    pub death_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Metric store database; metrics are discarded when unset.
    pub database: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetcherConfig {
    pub workers: usize,
    pub user_agent: String,
    pub proxy: Option<String>,
    pub max_content_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractorConfig {
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    pub workers: usize,
    pub tf_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrontierConfig {
    pub workers: usize,
    pub tick_interval_ms: u64,
    pub politeness_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.local/share/onionweave".to_string(),
            log_level: "info".to_string(),
            log_path: None,
            allowed_tlds: vec!["onion".to_string()],
            runtime: RuntimeConfig::default(),
            supervisor: SupervisorConfig::default(),
            database: DatabaseConfig::default(),
            metrics: MetricsConfig::default(),
            fetcher: FetcherConfig::default(),
            extractor: ExtractorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            frontier: FrontierConfig::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_poll_delay_ms: 5000,
            outbox_max_size: Some(450),
            dead_letter: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_delay_ms: 2000,
            shutdown_grace_ms: 5000,
            death_dir: "death".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "onionweave.db".to_string(),
            busy_timeout_ms: 30_000,
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workers: cpu_count() * 32,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0"
                .to_string(),
            proxy: Some("socks5h://127.0.0.1:9050".to_string()),
            max_content_size: 8_000_000,
            max_retries: 2,
            timeout_secs: 60,
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            workers: cpu_count(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            workers: cpu_count(),
            tf_limit: 50,
        }
    }
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            tick_interval_ms: 10_000,
            politeness_secs: 60,
        }
    }
}

impl PipelineConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from(shellexpand::tilde(DEFAULT_CONFIG_PATH).as_ref())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            PipelineError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| PipelineError::ConfigError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).as_ref())
    }

    /// Expands `~` and anchors relative paths at the data directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
        if expanded.is_absolute() {
            expanded
        } else {
            self.data_dir().join(expanded)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database.path)
    }

    pub fn metrics_path(&self) -> Option<PathBuf> {
        self.metrics.database.as_deref().map(|p| self.resolve(p))
    }

    pub fn death_dir(&self) -> PathBuf {
        self.resolve(&self.supervisor.death_dir)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database.busy_timeout_ms)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.supervisor.poll_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.supervisor.shutdown_grace_ms)
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.runtime.max_poll_delay_ms)
    }

    pub fn mailbox_dir(&self, pool: &str) -> PathBuf {
        self.data_dir().join("mailbox").join(pool)
    }

    /// Where content files travelling to `pool` are kept.
    pub fn content_dir(&self, pool: &str) -> PathBuf {
        self.data_dir().join("content").join(pool)
    }

    pub fn dead_letter_dir(&self, pool: &str) -> Option<PathBuf> {
        self.runtime
            .dead_letter
            .as_deref()
            .map(|dir| self.resolve(dir).join(pool))
    }

    pub fn workers(&self, pool: &str) -> Result<usize> {
        match pool {
            FETCHER => Ok(self.fetcher.workers),
            EXTRACTOR => Ok(self.extractor.workers),
            ANALYZER => Ok(self.analyzer.workers),
            FRONTIER => Ok(self.frontier.workers),
            other => Err(PipelineError::UnknownPool(other.to_string())),
        }
    }

    /// The inbox of `pool`. The fetcher inbox is priority ordered so that
    /// seeds and frontier emissions come first.
    pub fn inbox(&self, pool: &str) -> Result<DirMailbox> {
        if !POOLS.contains(&pool) {
            return Err(PipelineError::UnknownPool(pool.to_string()));
        }

        let mailbox = DirMailbox::new(self.mailbox_dir(pool))?
            .with_dead_letter(self.dead_letter_dir(pool));

        if pool == FETCHER {
            Ok(mailbox
                .with_pattern(PRIORITY_ACCEPT_PATTERN)?
                .with_order(ClaimOrder::Priority))
        } else {
            mailbox.with_pattern(DEFAULT_ACCEPT_PATTERN)
        }
    }

    /// Every inbox, for operator commands.
    pub fn inboxes(&self) -> Result<Vec<(&'static str, DirMailbox)>> {
        POOLS
            .iter()
            .map(|pool| Ok((*pool, self.inbox(pool)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = PipelineConfig::parse("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.runtime.outbox_max_size, Some(450));
        assert_eq!(config.analyzer.tf_limit, 50);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(PipelineConfig::parse(r#"{"fetcher": {"wokers": 3}}"#).is_err());
        assert!(PipelineConfig::parse(r#"{"colour": "blue"}"#).is_err());
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let config = PipelineConfig {
            data_dir: "/srv/crawl".to_string(),
            ..Default::default()
        };
        assert_eq!(config.resolve("db.sqlite"), PathBuf::from("/srv/crawl/db.sqlite"));
        assert_eq!(config.resolve("/tmp/x"), PathBuf::from("/tmp/x"));
        assert_eq!(config.death_dir(), PathBuf::from("/srv/crawl/death"));
    }

    #[test]
    fn test_unknown_pool() {
        let config = PipelineConfig::default();
        assert!(matches!(
            config.inbox("indexer"),
            Err(PipelineError::UnknownPool(_))
        ));
        assert!(config.workers("indexer").is_err());
    }

    #[test]
    fn test_fetcher_inbox_accepts_priority_names() {
        let config = PipelineConfig::default();
        let inbox = config.inbox(FETCHER).unwrap();
        assert!(inbox.accepts("0-Seed_1_2_3"));
        assert!(!inbox.accepts("Seed_1_2_3"));

        let extractor = config.inbox(EXTRACTOR).unwrap();
        assert!(extractor.accepts("Fetcher_1_2_3"));
    }
}

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};

/// Login counters are flushed 10 minutes after they were created.
const DEFAULT_AGGREGATION_WINDOW_SECS: u64 = 10 * 60;
/// Idle sweep: counters only need to be flushed eventually, not on time.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30 * 60;
/// Upper bound on distinct (network, IdP) pairs held in memory.
const DEFAULT_AGGREGATOR_MAX_ENTRIES: u64 = 100_000;
const DEFAULT_RANKING_SIZE: usize = 6;
const DEFAULT_RANKING_TTL_SECS: u64 = 60 * 60;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_RETENTION_DAYS: i64 = 30;
/// Metadata, and the filter lists derived from it, refresh every 15 minutes.
const DEFAULT_METADATA_REFRESH_SECS: u64 = 15 * 60;
/// A failed feed download is usually a restarting SP; try again soon.
const DEFAULT_METADATA_RETRY_SECS: u64 = 60;
const DEFAULT_FILTER_STALE_WAIT_MS: u64 = 500;
const DEFAULT_FILTER_COLD_WAIT_MS: u64 = 3000;
const DEFAULT_FILTER_MAX_LISTS: u64 = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How long a counter aggregates logins before it is written back
    pub window: Duration,
    pub max_entries: u64,
    /// Period of the forced sweep that expires counters during idle time
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// Number of IdPs kept per ranking
    pub size: usize,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub ttl: Duration,
    /// Wait bound for a refresh when a stale value can be served instead
    pub stale_wait: Duration,
    /// Wait bound for a refresh when nothing was ever loaded
    pub cold_wait: Duration,
    /// URL prefixes a filter list may be fetched from. Empty disables filtering.
    pub allowed_prefixes: Vec<String>,
    pub max_lists: u64,
}

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub feed_url: Option<String>,
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub aggregator: AggregatorConfig,
    pub ranking: RankingConfig,
    pub cleanup: CleanupConfig,
    pub filter: FilterConfig,
    pub metadata: MetadataConfig,
}

impl Default for Config {
    fn default() -> Self {
        let metadata_refresh = Duration::from_secs(DEFAULT_METADATA_REFRESH_SECS);
        Self {
            server: ServerConfig { port: 8080 },
            database: DatabaseConfig {
                path: PathBuf::from("./disco.sqlite3"),
                busy_timeout: Duration::from_secs(5),
            },
            aggregator: AggregatorConfig {
                window: Duration::from_secs(DEFAULT_AGGREGATION_WINDOW_SECS),
                max_entries: DEFAULT_AGGREGATOR_MAX_ENTRIES,
                sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            },
            ranking: RankingConfig {
                size: DEFAULT_RANKING_SIZE,
                ttl: Duration::from_secs(DEFAULT_RANKING_TTL_SECS),
            },
            cleanup: CleanupConfig {
                interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
                retention_days: DEFAULT_RETENTION_DAYS,
            },
            filter: FilterConfig {
                ttl: metadata_refresh,
                stale_wait: Duration::from_millis(DEFAULT_FILTER_STALE_WAIT_MS),
                cold_wait: Duration::from_millis(DEFAULT_FILTER_COLD_WAIT_MS),
                allowed_prefixes: Vec::new(),
                max_lists: DEFAULT_FILTER_MAX_LISTS,
            },
            metadata: MetadataConfig {
                feed_url: None,
                refresh_interval: metadata_refresh,
                retry_interval: Duration::from_secs(DEFAULT_METADATA_RETRY_SECS),
                request_timeout: Duration::from_secs(30),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(port) = env::var("PORT") {
            config.server.port = port.parse().context("PORT must be a port number")?;
        }

        if let Ok(path) = env::var("DATABASE_PATH") {
            config.database.path = PathBuf::from(path);
        }

        if let Some(max_entries) = parse_env::<u64>("AGGREGATOR_MAX_ENTRIES")? {
            config.aggregator.max_entries = max_entries;
        }

        if let Some(size) = parse_env::<usize>("RANKING_SIZE")? {
            anyhow::ensure!(size > 0, "RANKING_SIZE must be positive");
            config.ranking.size = size;
        }

        if let Some(days) = parse_env::<i64>("RETENTION_DAYS")? {
            anyhow::ensure!(days > 0, "RETENTION_DAYS must be positive");
            config.cleanup.retention_days = days;
        }

        config.metadata.feed_url = env::var("DISCOFEED_URL").ok().filter(|u| !u.is_empty());

        if let Some(secs) = parse_env::<u64>("METADATA_REFRESH_SECS")? {
            config.metadata.refresh_interval = Duration::from_secs(secs);
            // accepted-IdP lists go stale together with the metadata they resolve against
            config.filter.ttl = Duration::from_secs(secs);
        }

        if let Ok(prefixes) = env::var("FILTER_URL_PREFIXES") {
            config.filter.allowed_prefixes = parse_prefixes(&prefixes);
        }

        if let Some(max_lists) = parse_env::<u64>("FILTER_MAX_LISTS")? {
            anyhow::ensure!(max_lists > 0, "FILTER_MAX_LISTS must be positive");
            config.filter.max_lists = max_lists;
        }

        Ok(config)
    }
}

/// Comma separated, blanks skipped.
fn parse_prefixes(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
        .map(String::from)
        .collect()
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {}", name, value)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_aggregation_policy() {
        let config = Config::default();
        assert_eq!(config.aggregator.window, Duration::from_secs(600));
        assert_eq!(config.aggregator.sweep_interval, Duration::from_secs(1800));
        assert_eq!(config.ranking.ttl, Duration::from_secs(3600));
        assert_eq!(config.cleanup.retention_days, 30);
        assert_eq!(config.filter.stale_wait, Duration::from_millis(500));
        assert_eq!(config.filter.cold_wait, Duration::from_secs(3));
        assert_eq!(config.filter.ttl, config.metadata.refresh_interval);
        assert!(config.filter.allowed_prefixes.is_empty());
    }

    #[test]
    fn test_filter_prefixes_are_split_and_trimmed() {
        assert_eq!(
            parse_prefixes(" https://sp.example/ ,,https://lists.example/idps/"),
            vec!["https://sp.example/", "https://lists.example/idps/"]
        );
        assert!(parse_prefixes(" , ").is_empty());
    }
}

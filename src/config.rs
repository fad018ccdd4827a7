use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, bail};
use chrono::NaiveTime;
use serde::Deserialize;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// This is the top-level configuration structure loaded from
// `config.json`.
//
// It defines:
// - Where day-window files and logs live
// - Outbound HTTP settings (proxy, timeout)
// - Enabled sources and their cadences, retry and sink settings
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Optional outbound proxy, applied to upstream and sink traffic
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub http: HttpConfig,

    /// Seconds between metrics log lines
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sources.iter().all(|s| !s.enabled) {
            bail!("no enabled sources configured");
        }
        for source in &self.sources {
            if source.short_interval_secs == 0 {
                bail!("source '{}': short_interval_secs must be > 0", source.name);
            }
            if source.long_interval_secs == Some(0) {
                bail!("source '{}': long_interval_secs must be > 0", source.name);
            }
            if source.housekeeping_interval_secs == 0 {
                bail!(
                    "source '{}': housekeeping_interval_secs must be > 0",
                    source.name
                );
            }
            if let Some(hours) = &source.market_hours {
                hours
                    .parse()
                    .with_context(|| format!("source '{}': invalid market_hours", source.name))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding `<date>_<source>.json` day-window files
    pub dir: PathBuf,
}

// ------------------------------------------------------------
// Logging
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Directory for daily log files; stderr only when absent
    pub dir: Option<PathBuf>,

    /// Log file prefix: `<prefix>_<YYYY-MM-DD>.log`
    #[serde(default = "default_log_prefix")]
    pub prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: default_log_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Request timeout applied by the HTTP client
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
        }
    }
}

// ------------------------------------------------------------
// Source configuration
// ------------------------------------------------------------
//
// One entry per upstream feed. Each enabled source runs in its own
// task with its own cadences, day-window files and dedup scope.
//
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Source identifier (e.g. "announcements", "volume")
    pub name: String,

    pub enabled: bool,

    /// Unpaginated pull interval
    pub short_interval_secs: u64,

    /// Paginated / full pull interval; disabled when absent
    pub long_interval_secs: Option<u64>,

    /// Retention sweep interval
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,

    /// Gate every tick on weekday trading hours
    pub market_hours: Option<MarketHoursConfig>,

    /// Number of day windows kept, today included
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Hard cap on pages fetched by a paginated pull
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default)]
    pub fetch: RetryConfig,

    /// Downstream sink; forwarding is skipped when absent
    pub sink: Option<SinkConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Random pause around `delay_ms` (0.5x - 1.5x)
    Jitter,
    /// `attempt * delay_ms`
    Linear,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            delay_ms: default_delay_ms(),
            backoff: default_backoff(),
        }
    }
}

// ------------------------------------------------------------
// Sink configuration
// ------------------------------------------------------------
//
// `routes` maps a record route key (e.g. "high", "low") to its own
// URL; everything else goes to `url`.
//
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub url: String,

    #[serde(default)]
    pub routes: HashMap<String, String>,

    #[serde(default)]
    pub policy: DeliveryPolicy,

    #[serde(default = "default_sink_retries")]
    pub retries: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// One POST per record, partial failure possible
    #[default]
    PerRecord,
    /// One POST per route carrying a JSON array, all or nothing
    Batch,
}

// ------------------------------------------------------------
// Market hours
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct MarketHoursConfig {
    /// "HH:MM", local time
    pub open: String,
    /// "HH:MM", local time, inclusive
    pub close: String,
}

impl MarketHoursConfig {
    pub fn parse(&self) -> anyhow::Result<(NaiveTime, NaiveTime)> {
        let open = NaiveTime::parse_from_str(&self.open, "%H:%M")
            .with_context(|| format!("bad open time '{}'", self.open))?;
        let close = NaiveTime::parse_from_str(&self.close, "%H:%M")
            .with_context(|| format!("bad close time '{}'", self.close))?;
        if close <= open {
            bail!("close {} is not after open {}", self.close, self.open);
        }
        Ok((open, close))
    }
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_log_prefix() -> String {
    "bse-ingest".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_housekeeping_interval() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    70
}

fn default_retries() -> u32 {
    3
}

fn default_sink_retries() -> u32 {
    2
}

fn default_delay_ms() -> u64 {
    5_000
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Linear
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "storage": { "dir": "data" },
        "sources": [
            { "name": "volume", "enabled": true, "short_interval_secs": 300,
              "market_hours": { "open": "08:15", "close": "16:45" } }
        ]
    }"#;

    #[test]
    fn defaults_are_applied() {
        let cfg: Config = serde_json::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();

        let source = &cfg.sources[0];
        assert_eq!(source.retention_days, 1);
        assert_eq!(source.max_pages, 70);
        assert_eq!(source.housekeeping_interval_secs, 3600);
        assert_eq!(source.fetch.retries, 3);
        assert_eq!(source.fetch.backoff, BackoffKind::Linear);
        assert!(source.sink.is_none());
        assert_eq!(cfg.http.timeout_secs, 60);
        assert_eq!(cfg.logging.prefix, "bse-ingest");
    }

    #[test]
    fn sink_policy_and_routes_parse() {
        let sink: SinkConfig = serde_json::from_str(
            r#"{ "url": "http://sink/x", "policy": "batch",
                 "routes": { "high": "http://sink/high" } }"#,
        )
        .unwrap();

        assert_eq!(sink.policy, DeliveryPolicy::Batch);
        assert_eq!(sink.routes["high"], "http://sink/high");
        assert_eq!(sink.retries, 2);
    }

    #[test]
    fn rejects_inverted_market_hours() {
        let mut cfg: Config = serde_json::from_str(MINIMAL).unwrap();
        cfg.sources[0].market_hours = Some(MarketHoursConfig {
            open: "17:00".into(),
            close: "09:00".into(),
        });

        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shipped_example_is_valid() {
        let cfg: Config = serde_json::from_str(include_str!("../config.example.json")).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.sources.len(), 4);
        assert_eq!(cfg.sources[0].fetch.backoff, BackoffKind::Jitter);
        assert_eq!(cfg.sources[0].long_interval_secs, Some(1800));
        let high_low = &cfg.sources[2];
        assert!(high_low.market_hours.is_some());
        assert_eq!(high_low.sink.as_ref().unwrap().routes.len(), 2);
    }

    #[test]
    fn rejects_zero_cadence_intervals() {
        let mut cfg: Config = serde_json::from_str(MINIMAL).unwrap();
        cfg.sources[0].long_interval_secs = Some(0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("long_interval_secs"));

        cfg.sources[0].long_interval_secs = None;
        cfg.sources[0].housekeeping_interval_secs = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("housekeeping_interval_secs"));

        cfg.sources[0].housekeeping_interval_secs = 60;
        cfg.sources[0].long_interval_secs = Some(600);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_config_without_enabled_sources() {
        let mut cfg: Config = serde_json::from_str(MINIMAL).unwrap();
        cfg.sources[0].enabled = false;

        assert!(cfg.validate().is_err());
    }
}

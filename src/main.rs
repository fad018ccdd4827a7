// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Configuration structs loaded from JSON
// - schema:     Raw and canonical record definitions
// - util:       Shared helpers (headers, dates, row splitting)
// - fetcher:    HTTP transport with bounded retries and backoff
// - normalizer: Raw record → canonical record mapping
// - store:      Day-window persistence and dedup
// - uploader:   Forwarding of new records to the sink
// - sources:    Source adapters and adapter registry
// - collector:  Per-source pipeline, scheduler and runtime loop
// - logging:    Logger setup with daily log files
//
mod collector;
mod config;
mod fetcher;
mod logging;
mod metrics;
mod normalizer;
mod schema;
mod sources;
mod store;
mod uploader;
mod util;

#[cfg(test)]
mod mocks;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use anyhow::Context;
use log::{error, info};

use collector::runner::{SourceContext, prepare_source, run_source};
use config::Config;
use fetcher::ReqwestTransport;
use metrics::METRICS;
use sources::get_adapter;
use store::persistence::LogArtifacts;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::sleep;

const CONFIG_ENV: &str = "BSE_INGEST_CONFIG";
const DEFAULT_CONFIG: &str = "config.json";

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// This is the main runtime for the exchange disclosure ingester.
//
// Responsibilities:
// - Load and validate configuration
// - Prepare storage and logging
// - Start one collector task per enabled source
// - Keep the process alive indefinitely
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // Load configuration from disk
    //
    // Path: first CLI argument, then $BSE_INGEST_CONFIG,
    // then ./config.json
    // --------------------------------------------------------
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    let config = load_config(&path)?;

    // --------------------------------------------------------
    // IMPORTANT:
    // An unusable storage directory is fatal. Everything the
    // process does afterwards depends on it.
    // --------------------------------------------------------
    fs::create_dir_all(&config.storage.dir).with_context(|| {
        format!(
            "cannot create storage directory {}",
            config.storage.dir.display()
        )
    })?;

    logging::init(&config.logging)?;
    info!("Loaded configuration from {}", path);

    // --------------------------------------------------------
    // Shared HTTP transport
    //
    // One client (connection pool, proxy, timeout) for every
    // source and sink.
    // --------------------------------------------------------
    let transport = Arc::new(ReqwestTransport::new(
        &config.http,
        config.proxy.as_ref(),
    )?);

    let ctx = SourceContext {
        transport,
        storage_dir: config.storage.dir.clone(),
        logs: config.logging.dir.clone().map(|dir| LogArtifacts {
            dir,
            prefix: config.logging.prefix.clone(),
        }),
    };

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    let interval = Duration::from_secs(config.metrics_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            info!("{}", METRICS.summary());
        }
    });

    // --------------------------------------------------------
    // Start all enabled source collectors
    // --------------------------------------------------------
    for source_cfg in config.sources.iter().filter(|s| s.enabled) {
        let Some(adapter) = get_adapter(&source_cfg.name) else {
            error!("Source '{}' is not supported", source_cfg.name);
            continue;
        };

        let (pipeline, scheduler) = prepare_source(adapter, source_cfg, &ctx)
            .with_context(|| format!("source '{}'", source_cfg.name))?;

        info!("Starting {} collector", source_cfg.name);
        METRICS.sources_active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(run_source(pipeline, scheduler));
    }

    // --------------------------------------------------------
    // Keep the process alive forever
    //
    // All collectors run in background tasks.
    // This future never resolves.
    // --------------------------------------------------------
    std::future::pending::<()>().await;

    Ok(())
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk, deserializes it
// into the strongly typed `Config` structure and runs the
// semantic checks serde cannot express.
//
fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration file {}", path))?;
    let cfg: Config = serde_json::from_str(&data)
        .with_context(|| format!("invalid configuration file {}", path))?;
    cfg.validate()?;
    Ok(cfg)
}

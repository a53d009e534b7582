// Wiring of each pool's stage to its mailboxes, from the configuration

use crate::analyzer::Analyzer;
use crate::error::Result;
use crate::extractor::Extractor;
use crate::fetcher::{Fetcher, FetcherSettings};
use onionweave_core::config::{ANALYZER, EXTRACTOR, FETCHER, FRONTIER, PipelineConfig};
use onionweave_core::metrics::{MetricSink, MetricStore};
use onionweave_core::{
    Frontier, FrontierSettings, Outbox, PipelineError, Route, Stage, Storage, Worker,
    WorkerSettings,
};
use std::time::Duration;
use tracing::warn;

pub type PoolWorker = Worker<Box<dyn Stage>>;

fn storage(config: &PipelineConfig) -> Storage {
    Storage::new(&config.database_path()).with_busy_timeout(config.busy_timeout())
}

pub fn build_stage(config: &PipelineConfig, pool: &str) -> Result<Box<dyn Stage>> {
    let stage: Box<dyn Stage> = match pool {
        FETCHER => Box::new(Fetcher::new(FetcherSettings::from_config(
            &config.fetcher,
            config.content_dir(FETCHER),
        ))?),
        EXTRACTOR => Box::new(Extractor::new()),
        ANALYZER => Box::new(Analyzer::new(storage(config), config.analyzer.tf_limit)?),
        FRONTIER => {
            let settings = FrontierSettings {
                tick_interval: Duration::from_millis(config.frontier.tick_interval_ms),
                politeness: Duration::from_secs(config.frontier.politeness_secs),
                allowed_tlds: config.allowed_tlds.clone(),
            };
            Box::new(Frontier::new(storage(config), settings)?)
        }
        other => return Err(PipelineError::UnknownPool(other.to_string()).into()),
    };
    Ok(stage)
}

/// Where `pool` sends its results.
pub fn build_outbox(config: &PipelineConfig, pool: &str) -> Result<Outbox> {
    let max_size = config.runtime.outbox_max_size;

    let routes = match pool {
        FETCHER => {
            let mut routes = vec![
                Route::new(config.inbox(EXTRACTOR)?).with_content_dir(config.content_dir(EXTRACTOR)),
            ];
            // An analyzer inbox nobody drains would stall the fetchers
            if config.analyzer.workers > 0 {
                routes.push(
                    Route::new(config.inbox(ANALYZER)?)
                        .with_content_dir(config.content_dir(ANALYZER)),
                );
            }
            routes
        }
        EXTRACTOR => vec![Route::new(config.inbox(FRONTIER)?)],
        FRONTIER => vec![Route::new(config.inbox(FETCHER)?)],
        ANALYZER => Vec::new(),
        other => return Err(PipelineError::UnknownPool(other.to_string()).into()),
    };

    Ok(Outbox::new(routes, max_size))
}

fn metric_sink(config: &PipelineConfig) -> Option<Box<dyn MetricSink>> {
    let path = config.metrics_path()?;
    let storage = Storage::new(&path).with_busy_timeout(config.busy_timeout());
    match MetricStore::new(storage) {
        Ok(store) => Some(Box::new(store)),
        Err(e) => {
            warn!("Metric store unavailable, metrics disabled: {}", e);
            None
        }
    }
}

/// A ready-to-run worker for one process of `pool`.
pub fn build_worker(config: &PipelineConfig, pool: &str) -> Result<PoolWorker> {
    let stage = build_stage(config, pool)?;
    let outbox = build_outbox(config, pool)?;
    let settings = WorkerSettings {
        max_iterations: config.runtime.max_iterations,
        max_sleep: config.max_sleep(),
        death_dir: config.death_dir(),
    };

    let worker = Worker::new(stage, config.inbox(pool)?, outbox, settings);
    Ok(match metric_sink(config) {
        Some(sink) => worker.with_metrics(sink),
        None => worker,
    })
}

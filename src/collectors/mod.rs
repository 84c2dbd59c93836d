pub mod gpu;
pub mod services;

use crate::config::ServiceEndpoint;
use crate::history::HistoryStore;
use crate::metrics::Metrics;
use crate::state::SnapshotStore;
use gpu::GpuAdapter;
use services::ServiceAdapter;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {output}")]
    ToolFailed {
        program: String,
        status: std::process::ExitStatus,
        output: String,
    },
    #[error("unexpected {table} line {line:?}: expected {expected} fields, got {actual}")]
    FieldCount {
        table: &'static str,
        line: String,
        expected: usize,
        actual: usize,
    },
    #[error("endpoint {url} unreachable: {source}")]
    Unreachable { url: String, source: reqwest::Error },
    #[error("endpoint {url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("endpoint {url} returned a malformed payload: {source}")]
    Malformed {
        url: String,
        status: u16,
        source: reqwest::Error,
    },
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Keeps capture timestamps from going backwards when the wall clock does.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    pub fn observe(&mut self, timestamp: i64) -> i64 {
        self.last = self.last.max(timestamp);
        self.last
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub struct GpuCollector {
    adapter: GpuAdapter,
    store: Arc<SnapshotStore>,
    history: Arc<HistoryStore>,
    metrics: Arc<Metrics>,
    clock: MonotonicClock,
}

impl GpuCollector {
    pub fn new(
        adapter: GpuAdapter,
        store: Arc<SnapshotStore>,
        history: Arc<HistoryStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            adapter,
            store,
            history,
            metrics,
            clock: MonotonicClock::default(),
        }
    }

    /// One poll. Returns false when the tick was skipped; the previously
    /// published snapshot then stays current.
    pub async fn tick(&mut self) -> bool {
        let mut snapshot = match self.adapter.fetch_gpu().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    program = %self.adapter.program().display(),
                    error = %err,
                    "gpu poll failed, keeping previous snapshot"
                );
                self.metrics.inc_collect_error("gpu");
                return false;
            }
        };
        snapshot.timestamp = self.clock.observe(snapshot.timestamp);

        self.metrics.update_gpu(&snapshot);
        match self.history.append(&snapshot) {
            Ok(()) => self.metrics.inc_history_append(true),
            Err(err) => {
                warn!(error = %err, timestamp = snapshot.timestamp, "history append failed, sample dropped");
                self.metrics.inc_history_append(false);
            }
        }
        self.store.publish_gpu(snapshot).await;
        true
    }

    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?period, "gpu collector started");
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("gpu collector stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

pub struct ServiceCollector {
    adapter: ServiceAdapter,
    endpoints: Vec<ServiceEndpoint>,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    clock: MonotonicClock,
}

impl ServiceCollector {
    pub fn new(
        adapter: ServiceAdapter,
        endpoints: Vec<ServiceEndpoint>,
        store: Arc<SnapshotStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            adapter,
            endpoints,
            store,
            metrics,
            clock: MonotonicClock::default(),
        }
    }

    /// Always publishes: unreachable endpoints are recorded in place.
    pub async fn tick(&mut self) {
        let timestamp = self.clock.observe(now_unix());
        let snapshot = self
            .adapter
            .collect_service_status(&self.endpoints, timestamp)
            .await;

        let failed = snapshot.endpoints.iter().filter(|r| !r.reachable).count();
        for _ in 0..failed {
            self.metrics.inc_collect_error("service_status");
        }
        if failed > 0 {
            debug!(failed, total = snapshot.endpoints.len(), "some endpoints unreachable");
        }

        self.metrics.update_services(&snapshot);
        self.store.publish_service_status(snapshot).await;
    }

    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?period,
            endpoints = self.endpoints.len(),
            "service status collector started"
        );
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("service status collector stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

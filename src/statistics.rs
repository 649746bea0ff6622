use crate::callfiltering::FilterResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::interval;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteringStats {
    pub total_calls: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub silenced: u64, // Neither allowed nor rejected
    pub logged: u64,
    pub notified: u64,
    pub timed_out: u64,
    pub total_filtering_time_ms: u64,
    pub start_time: u64,
    pub last_updated: u64,
}

impl FilteringStats {
    fn new() -> Self {
        let now = unix_now();
        Self {
            start_time: now,
            last_updated: now,
            ..Default::default()
        }
    }

    pub fn average_filtering_time_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_filtering_time_ms as f64 / self.total_calls as f64
        }
    }

    fn apply(&mut self, event: &StatEvent) {
        self.last_updated = unix_now();
        match event {
            StatEvent::CallFiltered {
                result,
                timed_out,
                elapsed_ms,
            } => {
                self.total_calls += 1;
                self.total_filtering_time_ms += elapsed_ms;
                if result.allow {
                    self.allowed += 1;
                } else if result.reject {
                    self.rejected += 1;
                } else {
                    self.silenced += 1;
                }
                if !result.allow && result.log_call {
                    self.logged += 1;
                }
                if !result.allow && result.notify {
                    self.notified += 1;
                }
                if *timed_out {
                    self.timed_out += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    CallFiltered {
        result: FilterResult,
        timed_out: bool,
        elapsed_ms: u64,
    },
}

/// Cheap handle for reporting events to a [`StatisticsCollector`].
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    sender: mpsc::UnboundedSender<StatEvent>,
}

impl StatsRecorder {
    pub fn record_event(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("Failed to send statistics event: {e}");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Collects filtering outcomes on a background task and keeps a JSON
/// snapshot on disk.
pub struct StatisticsCollector {
    path: String,
    sender: mpsc::UnboundedSender<StatEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    pub fn new(path: String, flush_interval_seconds: u64) -> Result<Self> {
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create stats directory: {}", parent.display())
                })?;
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker_path = path.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                Self::stats_worker(worker_path, receiver, flush_interval_seconds.max(1)).await
            {
                log::error!("Statistics worker error: {e:#}");
            }
        });

        Ok(Self {
            path,
            sender,
            handle,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn record_event(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("Failed to send statistics event: {e}");
        }
    }

    pub fn recorder(&self) -> StatsRecorder {
        StatsRecorder {
            sender: self.sender.clone(),
        }
    }

    /// Stop the worker once every recorder is gone and everything received
    /// has been written.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.handle.await {
            log::error!("Statistics worker did not stop cleanly: {e}");
        }
    }

    async fn stats_worker(
        path: String,
        mut receiver: mpsc::UnboundedReceiver<StatEvent>,
        flush_interval_seconds: u64,
    ) -> Result<()> {
        let mut stats = match Self::load(&path) {
            Ok(stats) => stats,
            Err(e) => {
                log::debug!("Starting fresh statistics ({e:#})");
                FilteringStats::new()
            }
        };
        let mut dirty = false;
        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds));

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            stats.apply(&event);
                            dirty = true;
                        }
                        None => {
                            // Channel closed, flush and exit
                            if dirty {
                                Self::save(&path, &stats)?;
                            }
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if dirty {
                        if let Err(e) = Self::save(&path, &stats) {
                            log::error!("Failed to flush statistics: {e:#}");
                        } else {
                            dirty = false;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn load(path: &str) -> Result<FilteringStats> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read statistics: {path}"))?;
        let stats = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse statistics: {path}"))?;
        Ok(stats)
    }

    fn save(path: &str, stats: &FilteringStats) -> Result<()> {
        let content = serde_json::to_string_pretty(stats)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write statistics: {path}"))?;
        Ok(())
    }

    pub fn reset(path: &str) -> Result<()> {
        Self::save(path, &FilteringStats::new())
    }
}

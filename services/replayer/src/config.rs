use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::DriverConfig;

// Replayer configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ReplayerConfig {
    // JSON-lines capture file to replay.
    pub capture_path: Option<PathBuf>,
    // Endpoint that receives replayed requests.
    pub target_addr: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // How far past the current replay time reads may run ahead.
    pub buffer_window_ms: u64,
    // Ceiling on the summed cost of unacknowledged chunks.
    pub max_concurrent_cost: u32,
    // Cadence of watermark advances.
    pub watermark_tick_ms: u64,
    // Replay time multiplier; 2.0 replays twice as fast as captured.
    pub speedup_factor: f64,
    // Chunks per capture read; never more than max_concurrent_cost, since each
    // chunk costs 1 and a batch must fit the pool whole.
    pub read_batch_size: usize,
    // Bound on connecting to and writing one request to the target.
    pub write_timeout_ms: u64,
    // Collect requests in memory instead of sending them.
    pub dry_run: bool,
}

const DEFAULT_TARGET_ADDR: &str = "127.0.0.1:9200";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8081";
const DEFAULT_BUFFER_WINDOW_MS: u64 = 30_000;
const DEFAULT_MAX_CONCURRENT_COST: u32 = 1024;
const DEFAULT_WATERMARK_TICK_MS: u64 = 100;
const DEFAULT_SPEEDUP_FACTOR: f64 = 1.0;
const DEFAULT_READ_BATCH_SIZE: usize = 64;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct ReplayerConfigOverride {
    capture_path: Option<PathBuf>,
    target_addr: Option<String>,
    metrics_bind: Option<String>,
    buffer_window_ms: Option<u64>,
    max_concurrent_cost: Option<u32>,
    watermark_tick_ms: Option<u64>,
    speedup_factor: Option<f64>,
    read_batch_size: Option<usize>,
    write_timeout_ms: Option<u64>,
    dry_run: Option<bool>,
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse::<T>().ok())
}

fn valid_speedup(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl ReplayerConfig {
    pub fn from_env() -> Result<Self> {
        let capture_path = std::env::var("REPLAYER_CAPTURE_PATH").ok().map(PathBuf::from);
        let target_addr = std::env::var("REPLAYER_TARGET_ADDR")
            .unwrap_or_else(|_| DEFAULT_TARGET_ADDR.to_string())
            .parse()
            .with_context(|| "parse REPLAYER_TARGET_ADDR")?;
        let metrics_bind = std::env::var("REPLAYER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse REPLAYER_METRICS_BIND")?;
        let buffer_window_ms = env_parsed::<u64>("REPLAYER_BUFFER_WINDOW_MS")
            .unwrap_or(DEFAULT_BUFFER_WINDOW_MS);
        let max_concurrent_cost = env_parsed::<u32>("REPLAYER_MAX_CONCURRENT_COST")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_COST);
        let watermark_tick_ms = env_parsed::<u64>("REPLAYER_WATERMARK_TICK_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WATERMARK_TICK_MS);
        let speedup_factor = env_parsed::<f64>("REPLAYER_SPEEDUP_FACTOR")
            .filter(|value| valid_speedup(*value))
            .unwrap_or(DEFAULT_SPEEDUP_FACTOR);
        let read_batch_size = env_parsed::<usize>("REPLAYER_READ_BATCH_SIZE")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_READ_BATCH_SIZE);
        let write_timeout_ms = env_parsed::<u64>("REPLAYER_WRITE_TIMEOUT_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WRITE_TIMEOUT_MS);
        let dry_run = std::env::var("REPLAYER_DRY_RUN")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let mut config = Self {
            capture_path,
            target_addr,
            metrics_bind,
            buffer_window_ms,
            max_concurrent_cost,
            watermark_tick_ms,
            speedup_factor,
            read_batch_size,
            write_timeout_ms,
            dry_run,
        };
        config.fit_batch_to_capacity();
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("REPLAYER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read REPLAYER_CONFIG: {path}"))?;
            let override_cfg: ReplayerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse replayer config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: ReplayerConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.capture_path {
            self.capture_path = Some(value);
        }
        if let Some(value) = override_cfg.target_addr {
            self.target_addr = value.parse().with_context(|| "parse target_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.buffer_window_ms {
            self.buffer_window_ms = value;
        }
        if let Some(value) = override_cfg.max_concurrent_cost
            && value > 0
        {
            self.max_concurrent_cost = value;
        }
        if let Some(value) = override_cfg.watermark_tick_ms
            && value > 0
        {
            self.watermark_tick_ms = value;
        }
        if let Some(value) = override_cfg.speedup_factor
            && valid_speedup(value)
        {
            self.speedup_factor = value;
        }
        if let Some(value) = override_cfg.read_batch_size
            && value > 0
        {
            self.read_batch_size = value;
        }
        if let Some(value) = override_cfg.write_timeout_ms
            && value > 0
        {
            self.write_timeout_ms = value;
        }
        if let Some(value) = override_cfg.dry_run {
            self.dry_run = value;
        }
        self.fit_batch_to_capacity();
        Ok(())
    }

    fn fit_batch_to_capacity(&mut self) {
        let capacity = self.max_concurrent_cost as usize;
        if self.read_batch_size > capacity {
            tracing::warn!(
                read_batch_size = self.read_batch_size,
                max_concurrent_cost = self.max_concurrent_cost,
                "read batch size exceeds max concurrent cost, lowering it"
            );
            self.read_batch_size = capacity;
        }
    }

    pub fn capture_path(&self) -> Result<&Path> {
        self.capture_path
            .as_deref()
            .context("REPLAYER_CAPTURE_PATH (or capture_path in REPLAYER_CONFIG) is required")
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            buffer_time_window: Duration::from_millis(self.buffer_window_ms),
            max_concurrent_cost: self.max_concurrent_cost,
            watermark_tick: Duration::from_millis(self.watermark_tick_ms),
            speedup_factor: self.speedup_factor,
        }
    }
}

use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use data_model::DEFAULT_BUCKET;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::{driver::rocksdb, ConnectionOptions, FaultOptions, MemoryOptions};
use transfers::StrategyKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum StoreConfig {
    Memory {
        #[serde(default = "default_lock_timeout_ms")]
        lock_timeout_ms: u64,
        /// Simulated round trip per read and commit.
        #[serde(default)]
        latency_ms: u64,
    },
    Rocksdb {
        path: PathBuf,
        #[serde(default = "default_lock_timeout_ms")]
        lock_timeout_ms: u64,
    },
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            lock_timeout_ms: default_lock_timeout_ms(),
            latency_ms: 1,
        }
    }
}

impl StoreConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        match self {
            StoreConfig::Memory {
                lock_timeout_ms,
                latency_ms,
            } => ConnectionOptions::Memory(MemoryOptions {
                lock_timeout: Duration::from_millis(*lock_timeout_ms),
                latency: Some(Duration::from_millis(*latency_ms)),
            }),
            StoreConfig::Rocksdb {
                path,
                lock_timeout_ms,
            } => ConnectionOptions::RocksDB(rocksdb::Options {
                path: path.clone(),
                lock_timeout: Duration::from_millis(*lock_timeout_ms),
            }),
        }
    }

    fn lock_timeout_ms(&self) -> u64 {
        match self {
            StoreConfig::Memory { lock_timeout_ms, .. } |
            StoreConfig::Rocksdb { lock_timeout_ms, .. } => *lock_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub bucket: String,
    pub num_accounts: usize,
    pub initial_balance: i64,
    /// Strategies run in order, each over the same accounts.
    pub strategies: Vec<StrategyKind>,
    /// Transfer attempts issued per strategy.
    pub runs: usize,
    /// Exclusive upper bound of a transfer amount.
    pub max_transfer_amount: i64,
    pub seed: u64,
    pub aggregate_max_attempts: u32,
    /// Reject transfers that would overdraw the source when using
    /// read-modify-write.
    pub non_negative: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            bucket: DEFAULT_BUCKET.to_string(),
            num_accounts: 10_000,
            initial_balance: 100,
            strategies: vec![StrategyKind::ReadModifyWrite, StrategyKind::PartialUpdate],
            runs: 1000,
            max_transfer_amount: 100,
            seed: 213456,
            aggregate_max_attempts: transfers::DEFAULT_MAX_ATTEMPTS,
            non_negative: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Probability that a commit is aborted before reaching the store.
    pub abort_rate: f64,
    pub seed: u64,
}

impl FaultConfig {
    pub fn options(&self) -> Option<FaultOptions> {
        let options = FaultOptions {
            seed: self.seed,
            ..FaultOptions::with_abort_rate(self.abort_rate)
        };
        options.is_active().then_some(options)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Enable metrics.
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint. Defaults to using
    // OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    pub endpoint: Option<String>,
    // Metrics export interval. Defaults to 10 seconds.
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    pub structured_logging: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            structured_logging: false,
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub env: String,
    pub store: StoreConfig,
    pub workload: WorkloadConfig,
    pub faults: FaultConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            env: "local".to_string(),
            store: StoreConfig::default(),
            workload: WorkloadConfig::default(),
            faults: FaultConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl BenchConfig {
    pub fn from_path(path: &str) -> Result<BenchConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: BenchConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let workload = &self.workload;
        if workload.num_accounts < 2 {
            return Err(anyhow!(
                "at least two accounts are required, got {}",
                workload.num_accounts
            ));
        }
        if workload.max_transfer_amount <= 0 {
            return Err(anyhow!(
                "max_transfer_amount must be positive, got {}",
                workload.max_transfer_amount
            ));
        }
        if workload.aggregate_max_attempts == 0 {
            return Err(anyhow!("aggregate_max_attempts must be at least 1"));
        }
        if workload.bucket.is_empty() {
            return Err(anyhow!("bucket name must not be empty"));
        }
        if workload.strategies.is_empty() {
            return Err(anyhow!("at least one transfer strategy is required"));
        }
        if !(0.0..=1.0).contains(&self.faults.abort_rate) {
            return Err(anyhow!(
                "faults.abort_rate must be within [0, 1], got {}",
                self.faults.abort_rate
            ));
        }
        if self.store.lock_timeout_ms() == 0 {
            return Err(anyhow!("store lock_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.telemetry.structured_logging
    }
}

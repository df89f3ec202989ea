use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use tracing::info;

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

/// Install a global meter provider exporting over OTLP.
///
/// Returns `None` without touching the global provider when metrics are
/// disabled, in which case every instrument is a no-op.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "occ-bank"))
        .with_attribute(KeyValue::new("service.name", "occ-bank"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    info!(?interval, "exporting metrics over otlp");
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between its creation and its drop.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

/// Increments a counter by one when dropped.
pub struct Increment<'a, T: AutoIncrement + Sync> {
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: AutoIncrement + Sync> Increment<'a, T> {
    pub fn inc(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self { metric, labels }
    }
}

impl<'a, T: AutoIncrement + Sync> Drop for Increment<'a, T> {
    fn drop(&mut self) {
        self.metric.increment(self.labels);
    }
}

pub mod state_store {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Clone, Debug)]
    pub struct Metrics {
        pub commit_duration: Histogram<f64>,
        pub transactions_started: Counter<u64>,
        pub transactions_committed: Counter<u64>,
        pub transactions_aborted: Counter<u64>,
        pub driver_reads: Counter<u64>,
        pub driver_writes: Counter<u64>,
        pub driver_deletes: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("state_store");

            let commit_duration = meter
                .f64_histogram("occ.transaction_commit_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("Transaction commit latency in seconds")
                .build();

            let transactions_started = meter
                .u64_counter("occ.transactions_started")
                .with_description("Number of transactions opened")
                .build();

            let transactions_committed = meter
                .u64_counter("occ.transactions_committed")
                .with_description("Number of transactions committed")
                .build();

            let transactions_aborted = meter
                .u64_counter("occ.transactions_aborted")
                .with_description("Number of transactions aborted, by reason")
                .build();

            let driver_reads = meter
                .u64_counter("occ.state_driver_reads")
                .with_description("Number of state driver reads")
                .build();

            let driver_writes = meter
                .u64_counter("occ.state_driver_writes")
                .with_description("Number of state driver non-transactional writes")
                .build();

            let driver_deletes = meter
                .u64_counter("occ.state_driver_deletes")
                .with_description("Number of records removed by bucket truncation")
                .build();

            Metrics {
                commit_duration,
                transactions_started,
                transactions_committed,
                transactions_aborted,
                driver_reads,
                driver_writes,
                driver_deletes,
            }
        }
    }
}

pub mod transfers {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Clone, Debug)]
    pub struct Metrics {
        pub transfer_duration: Histogram<f64>,
        pub transfers: Counter<u64>,
        pub aggregate_attempts: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("transfers");

            let transfer_duration = meter
                .f64_histogram("occ.transfer_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("Transfer attempt latency in seconds, by strategy")
                .build();

            let transfers = meter
                .u64_counter("occ.transfers")
                .with_description("Number of transfer attempts, by strategy and outcome")
                .build();

            let aggregate_attempts = meter
                .u64_counter("occ.aggregate_attempts")
                .with_description("Number of balance aggregation attempts, by outcome")
                .build();

            Metrics {
                transfer_duration,
                transfers,
                aggregate_attempts,
            }
        }
    }
}

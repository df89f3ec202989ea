use data_model::AccountRef;
use metrics::transfers::Metrics;
use opentelemetry::KeyValue;
use state_store::{AbortReason, CommitOutcome, StoreClient};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("balance aggregation aborted {attempts} times, last reason: {last_reason}")]
    RetriesExhausted {
        attempts: u32,
        last_reason: AbortReason,
    },

    #[error("sum of balances overflows")]
    Overflow,

    #[error(transparent)]
    Store(#[from] state_store::Error),
}

/// Sums balances in a read-only transaction, retrying on aborts.
///
/// The commit of the read-only transaction validates that no loaded
/// account changed while it was being read, so a returned sum always comes
/// from one consistent snapshot.
pub struct RetryingAggregator {
    max_attempts: u32,
    metrics: Metrics,
}

impl RetryingAggregator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            metrics: Metrics::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Total balance of `refs`. Missing accounts count as zero. Store
    /// errors are returned immediately.
    #[instrument(skip_all, fields(accounts = account_refs.len()))]
    pub async fn sum_all_balances(
        &self,
        client: &StoreClient,
        account_refs: &[AccountRef],
    ) -> Result<i64, AggregateError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = client.begin_transaction();
            let mut sum: i64 = 0;
            for account_ref in account_refs {
                if let Some(account) = tx.load(account_ref).await? {
                    sum = sum
                        .checked_add(account.balance)
                        .ok_or(AggregateError::Overflow)?;
                }
            }

            match tx.commit().await? {
                CommitOutcome::Committed => {
                    self.metrics
                        .aggregate_attempts
                        .add(1, &[KeyValue::new("outcome", "committed")]);
                    info!(attempt, sum, "aggregated balances");
                    return Ok(sum);
                }
                CommitOutcome::Aborted(reason) => {
                    self.metrics
                        .aggregate_attempts
                        .add(1, &[KeyValue::new("outcome", reason.to_string())]);
                    if attempt >= self.max_attempts {
                        warn!(attempt, %reason, "giving up on balance aggregation");
                        return Err(AggregateError::RetriesExhausted {
                            attempts: attempt,
                            last_reason: reason,
                        });
                    }
                    debug!(attempt, %reason, "balance aggregation aborted, retrying");
                }
            }
        }
    }
}

impl Default for RetryingAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

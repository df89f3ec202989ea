use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use data_model::{AccountRef, Bucket, TransferIntent};
use occ_utils::{random_distinct_pair, timed};
use rand::{rngs::StdRng, Rng, SeedableRng};
use state_store::{AbortReason, StoreClient};
use tokio::task::JoinSet;
use tracing::{info, warn};
use transfers::{
    AggregateError,
    RetryingAggregator,
    StrategyKind,
    TransferOutcome,
    TransferStrategy,
};

use crate::config::WorkloadConfig;

/// Tally of one batch of concurrent transfer attempts.
#[derive(Debug, Default, Clone)]
pub struct TransferReport {
    pub attempted: usize,
    pub committed: usize,
    pub aborted: HashMap<AbortReason, usize>,
    pub insufficient_funds: usize,
    pub errors: usize,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn aborted(&self, reason: AbortReason) -> usize {
        self.aborted.get(&reason).copied().unwrap_or_default()
    }

    pub fn total_aborted(&self) -> usize {
        self.aborted.values().sum()
    }

    fn record(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Committed => self.committed += 1,
            TransferOutcome::Aborted(reason) => *self.aborted.entry(reason).or_default() += 1,
            TransferOutcome::InsufficientFunds => self.insufficient_funds += 1,
        }
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} committed, {} conflict_detected, {} lock_timeout, {} coordinator_unavailable, \
             {} insufficient_funds, {} errors in {:?}",
            self.committed,
            self.attempted,
            self.aborted(AbortReason::ConflictDetected),
            self.aborted(AbortReason::LockTimeout),
            self.aborted(AbortReason::CoordinatorUnavailable),
            self.insufficient_funds,
            self.errors,
            self.elapsed
        )
    }
}

/// The synthetic bank: a fixed set of accounts and a seeded source of
/// transfer intents.
pub struct Economy {
    client: StoreClient,
    refs: Arc<[AccountRef]>,
    rng: Mutex<StdRng>,
    max_transfer_amount: i64,
}

impl Economy {
    /// Empty the bucket and insert `num_accounts` accounts holding
    /// `initial_balance` each.
    pub async fn init(client: StoreClient, workload: &WorkloadConfig) -> Result<Economy> {
        let bucket = Bucket::new(workload.bucket.as_str());
        client.truncate_bucket(&bucket).await?;

        let mut refs = Vec::with_capacity(workload.num_accounts);
        for _ in 0..workload.num_accounts {
            let account = client.create_record(&bucket, workload.initial_balance);
            refs.push(account.account_ref.clone());
            client.insert(account).await?;
        }
        info!(
            %bucket,
            accounts = refs.len(),
            initial_balance = workload.initial_balance,
            "initialized economy"
        );

        Ok(Economy {
            client,
            refs: refs.into(),
            rng: Mutex::new(StdRng::seed_from_u64(workload.seed)),
            max_transfer_amount: workload.max_transfer_amount,
        })
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn refs(&self) -> &[AccountRef] {
        &self.refs
    }

    /// A transfer between two distinct random accounts of an amount in
    /// `[0, max_transfer_amount)`.
    pub fn random_intent(&self) -> Result<TransferIntent> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|e| anyhow!("workload rng lock poisoned: {e}"))?;
        let (source, dest) = random_distinct_pair(&self.refs[..], &mut *rng)?;
        let amount = rng.random_range(0..self.max_transfer_amount);
        Ok(TransferIntent::new(source.clone(), dest.clone(), amount)?)
    }

    pub async fn total_balance(
        &self,
        aggregator: &RetryingAggregator,
    ) -> Result<i64, AggregateError> {
        aggregator.sum_all_balances(&self.client, &self.refs).await
    }

    /// Issue `runs` transfer attempts at once, each on its own task and
    /// transaction, and wait for all of them.
    pub async fn run_transfers(
        &self,
        strategy: Arc<dyn TransferStrategy>,
        runs: usize,
    ) -> Result<TransferReport> {
        let intents = (0..runs)
            .map(|_| self.random_intent())
            .collect::<Result<Vec<_>>>()?;

        let kind = strategy.kind();
        let client = self.client.clone();
        let (report, elapsed) = timed(async move {
            let mut tasks = JoinSet::new();
            for intent in intents {
                let client = client.clone();
                let strategy = strategy.clone();
                tasks.spawn(async move { strategy.transfer(&client, &intent).await });
            }

            let mut report = TransferReport {
                attempted: runs,
                ..Default::default()
            };
            while let Some(result) = tasks.join_next().await {
                match result? {
                    Ok(outcome) => report.record(outcome),
                    Err(err) => {
                        warn!("transfer failed: {err}");
                        report.errors += 1;
                    }
                }
            }
            Ok::<_, anyhow::Error>(report)
        })
        .await;

        let mut report = report?;
        report.elapsed = elapsed;
        info!(strategy = %kind, "{report}");
        Ok(report)
    }

    #[cfg(test)]
    pub async fn run(&self, kind: StrategyKind, runs: usize) -> Result<TransferReport> {
        self.run_transfers(kind.build(), runs).await
    }
}

#[cfg(test)]
mod tests {
    use state_store::test_state_store::memory_client;

    use super::*;

    fn workload(num_accounts: usize) -> WorkloadConfig {
        WorkloadConfig {
            num_accounts,
            initial_balance: 100,
            max_transfer_amount: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_replaces_previous_accounts() -> Result<()> {
        let client = memory_client();
        let first = Economy::init(client.clone(), &workload(5)).await?;
        let second = Economy::init(client.clone(), &workload(3)).await?;

        for account_ref in first.refs() {
            assert!(client.get(account_ref).await?.is_none());
        }
        assert_eq!(second.refs().len(), 3);
        let total = second.total_balance(&RetryingAggregator::default()).await?;
        assert_eq!(total, 300);
        Ok(())
    }

    #[tokio::test]
    async fn test_random_intents_are_valid_and_seeded() -> Result<()> {
        let client = memory_client();
        let economy = Economy::init(client.clone(), &workload(4)).await?;
        for _ in 0..200 {
            let intent = economy.random_intent()?;
            assert_ne!(intent.source(), intent.dest());
            assert!((0..100).contains(&intent.amount()));
        }

        // Same seed over the same refs yields the same amounts.
        let a = Economy {
            client: client.clone(),
            refs: economy.refs.clone(),
            rng: Mutex::new(StdRng::seed_from_u64(1)),
            max_transfer_amount: 100,
        };
        let b = Economy {
            client,
            refs: economy.refs.clone(),
            rng: Mutex::new(StdRng::seed_from_u64(1)),
            max_transfer_amount: 100,
        };
        for _ in 0..20 {
            assert_eq!(a.random_intent()?, b.random_intent()?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_report_counts_every_attempt() -> Result<()> {
        let client = memory_client();
        let economy = Economy::init(client, &workload(10)).await?;
        let report = economy.run(StrategyKind::PartialUpdate, 25).await?;
        assert_eq!(report.attempted, 25);
        assert_eq!(
            report.committed + report.total_aborted() + report.insufficient_funds + report.errors,
            25
        );
        assert_eq!(report.committed, 25);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::Result;
    use data_model::{AccountField, PartialUpdateOp};
    use state_store::{
        driver::rocksdb,
        AbortReason,
        CommitOutcome,
        ConnectionOptions,
        Driver,
        FaultInjectingDriver,
        FaultOptions,
        MemoryDriver,
        MemoryOptions,
        StoreClient,
    };
    use transfers::{RetryingAggregator, StrategyKind};

    use crate::{
        config::WorkloadConfig,
        workload::{Economy, TransferReport},
    };

    const NUM_ACCOUNTS: usize = 10;
    const INITIAL_BALANCE: i64 = 100;
    const CONCURRENT_TRANSFERS: usize = 50;

    fn workload() -> WorkloadConfig {
        WorkloadConfig {
            num_accounts: NUM_ACCOUNTS,
            initial_balance: INITIAL_BALANCE,
            runs: CONCURRENT_TRANSFERS,
            ..Default::default()
        }
    }

    fn memory_options() -> MemoryOptions {
        MemoryOptions {
            lock_timeout: Duration::from_secs(5),
            latency: Some(Duration::from_millis(1)),
        }
    }

    fn memory_client() -> Result<StoreClient> {
        Ok(StoreClient::open(
            ConnectionOptions::Memory(memory_options()),
            None,
        )?)
    }

    fn rocksdb_client(path: &std::path::Path) -> Result<StoreClient> {
        Ok(StoreClient::open(
            ConnectionOptions::RocksDB(rocksdb::Options::new(path)),
            None,
        )?)
    }

    /// Seed the economy, run both strategies and check the total after each
    /// phase. Returns the read-modify-write report.
    async fn run_scenario(client: StoreClient, num_accounts: usize) -> Result<TransferReport> {
        let expected_total = num_accounts as i64 * INITIAL_BALANCE;
        let config = WorkloadConfig {
            num_accounts,
            ..workload()
        };
        let economy = Economy::init(client, &config).await?;
        let aggregator = RetryingAggregator::default();
        assert_eq!(economy.total_balance(&aggregator).await?, expected_total);

        let rmw = economy
            .run(StrategyKind::ReadModifyWrite, CONCURRENT_TRANSFERS)
            .await?;
        assert_eq!(rmw.attempted, CONCURRENT_TRANSFERS);
        assert_eq!(rmw.errors, 0);
        assert_eq!(rmw.committed + rmw.total_aborted(), CONCURRENT_TRANSFERS);
        assert_eq!(economy.total_balance(&aggregator).await?, expected_total);

        let pu = economy
            .run(StrategyKind::PartialUpdate, CONCURRENT_TRANSFERS)
            .await?;
        assert_eq!(pu.errors, 0);
        assert_eq!(pu.aborted(AbortReason::ConflictDetected), 0);
        assert_eq!(pu.committed, CONCURRENT_TRANSFERS);
        assert_eq!(economy.total_balance(&aggregator).await?, expected_total);

        Ok(rmw)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenario_memory() -> Result<()> {
        let rmw = run_scenario(memory_client()?, NUM_ACCOUNTS).await?;
        assert!(
            rmw.aborted(AbortReason::ConflictDetected) > 0,
            "expected read-modify-write conflicts"
        );
        assert!(rmw.committed < CONCURRENT_TRANSFERS);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenario_rocksdb() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        // Every transfer touches the same two accounts, so concurrent
        // read-modify-writes overlap on local storage too.
        let rmw = run_scenario(rocksdb_client(temp_dir.path())?, 2).await?;
        assert!(
            rmw.aborted(AbortReason::ConflictDetected) > 0,
            "expected read-modify-write conflicts"
        );
        assert!(rmw.committed < CONCURRENT_TRANSFERS);
        Ok(())
    }

    async fn overlapping_read_modify_write(client: StoreClient) -> Result<()> {
        let economy = Economy::init(client.clone(), &workload()).await?;
        let (a, b) = (&economy.refs()[0], &economy.refs()[1]);

        let mut first = client.begin_transaction();
        let mut second = client.begin_transaction();
        let mut first_a = first.load(a).await?.unwrap();
        let mut second_a = second.load(a).await?.unwrap();
        let mut first_b = first.load(b).await?.unwrap();
        let mut second_b = second.load(b).await?.unwrap();

        first_a.balance -= 10;
        first_b.balance += 10;
        first.update(first_a)?;
        first.update(first_b)?;
        second_a.balance -= 20;
        second_b.balance += 20;
        second.update(second_a)?;
        second.update(second_b)?;

        assert_eq!(first.commit().await?, CommitOutcome::Committed);
        assert_eq!(
            second.commit().await?,
            CommitOutcome::Aborted(AbortReason::ConflictDetected)
        );
        assert!(second.load(a).await.is_err());

        assert_eq!(client.get(a).await?.unwrap().balance, INITIAL_BALANCE - 10);
        assert_eq!(client.get(b).await?.unwrap().balance, INITIAL_BALANCE + 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_overlapping_read_modify_write_memory() -> Result<()> {
        overlapping_read_modify_write(memory_client()?).await
    }

    #[tokio::test]
    async fn test_overlapping_read_modify_write_rocksdb() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        overlapping_read_modify_write(rocksdb_client(temp_dir.path())?).await
    }

    async fn overlapping_partial_updates(client: StoreClient) -> Result<()> {
        let economy = Economy::init(client.clone(), &workload()).await?;
        let (a, b) = (&economy.refs()[0], &economy.refs()[1]);

        let mut first = client.begin_transaction();
        let mut second = client.begin_transaction();
        first.partial_update(a, PartialUpdateOp::decrement(AccountField::Balance, 10))?;
        first.partial_update(b, PartialUpdateOp::increment(AccountField::Balance, 10))?;
        second.partial_update(b, PartialUpdateOp::decrement(AccountField::Balance, 30))?;
        second.partial_update(a, PartialUpdateOp::increment(AccountField::Balance, 30))?;

        // Another writer commits in between.
        let mut interloper = client.begin_transaction();
        let mut stored_a = interloper.load(a).await?.unwrap();
        stored_a.balance += 1;
        interloper.update(stored_a)?;
        assert!(interloper.commit().await?.is_committed());

        assert!(first.commit().await?.is_committed());
        assert!(second.commit().await?.is_committed());
        assert_eq!(client.get(a).await?.unwrap().balance, INITIAL_BALANCE + 21);
        assert_eq!(client.get(b).await?.unwrap().balance, INITIAL_BALANCE - 20);
        Ok(())
    }

    #[tokio::test]
    async fn test_overlapping_partial_updates_memory() -> Result<()> {
        overlapping_partial_updates(memory_client()?).await
    }

    #[tokio::test]
    async fn test_overlapping_partial_updates_rocksdb() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        overlapping_partial_updates(rocksdb_client(temp_dir.path())?).await
    }

    #[tokio::test]
    async fn test_torn_read_is_detected() -> Result<()> {
        let client = memory_client()?;
        let economy = Economy::init(client.clone(), &workload()).await?;
        let (a, b) = (&economy.refs()[0], &economy.refs()[1]);

        let mut reader = client.begin_transaction();
        let before_a = reader.load(a).await?.unwrap().balance;

        let mut writer = client.begin_transaction();
        writer.partial_update(a, PartialUpdateOp::decrement(AccountField::Balance, 50))?;
        writer.partial_update(b, PartialUpdateOp::increment(AccountField::Balance, 50))?;
        assert!(writer.commit().await?.is_committed());

        let after_b = reader.load(b).await?.unwrap().balance;
        assert_eq!(before_a + after_b, 2 * INITIAL_BALANCE + 50);
        assert_eq!(
            reader.commit().await?,
            CommitOutcome::Aborted(AbortReason::ConflictDetected)
        );

        let total = economy
            .total_balance(&RetryingAggregator::default())
            .await?;
        assert_eq!(total, NUM_ACCOUNTS as i64 * INITIAL_BALANCE);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_injected_aborts_preserve_conservation() -> Result<()> {
        let inner: Arc<dyn Driver> = Arc::new(MemoryDriver::new(memory_options()));
        let faulty = StoreClient::new(Arc::new(FaultInjectingDriver::new(
            inner.clone(),
            FaultOptions {
                abort_rate: 0.3,
                seed: 11,
                ..Default::default()
            },
        )));
        let reliable = StoreClient::new(inner);

        let economy = Economy::init(faulty, &workload()).await?;
        let report = economy
            .run(StrategyKind::PartialUpdate, CONCURRENT_TRANSFERS)
            .await?;
        assert_eq!(report.aborted(AbortReason::ConflictDetected), 0);
        assert!(
            report.aborted(AbortReason::LockTimeout) +
                report.aborted(AbortReason::CoordinatorUnavailable) >
                0
        );
        assert_eq!(report.committed + report.total_aborted(), CONCURRENT_TRANSFERS);

        let total = RetryingAggregator::default()
            .sum_all_balances(&reliable, economy.refs())
            .await?;
        assert_eq!(total, NUM_ACCOUNTS as i64 * INITIAL_BALANCE);
        Ok(())
    }
}

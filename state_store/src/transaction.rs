use std::{collections::BTreeMap, mem, sync::Arc};

use data_model::{Account, AccountRef, PartialUpdateOp, Version};
use metrics::{state_store::Metrics, Timer};
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::driver::{CommitBatch, CommitOutcome, Driver, Error, TransactionId, TransactionState};

/// A client-side unit of work against the store.
///
/// Loads go to the store and are remembered along with the version they
/// observed. Updates and partial updates are only staged; nothing is
/// visible to other transactions until `commit` succeeds. Once committed,
/// aborted or failed the handle rejects every operation with
/// `Error::HandleClosed`. Dropping an open handle discards its staged
/// writes.
pub struct Transaction {
    id: TransactionId,
    driver: Arc<dyn Driver>,
    metrics: Arc<Metrics>,
    state: TransactionState,
    reads: BTreeMap<AccountRef, Option<Account>>,
    updates: BTreeMap<AccountRef, Account>,
    partial_updates: Vec<(AccountRef, PartialUpdateOp)>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, driver: Arc<dyn Driver>, metrics: Arc<Metrics>) -> Self {
        Self {
            id,
            driver,
            metrics,
            state: TransactionState::Open,
            reads: BTreeMap::new(),
            updates: BTreeMap::new(),
            partial_updates: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.state.is_terminal() {
            return Err(Error::HandleClosed {
                id: self.id,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Read a record through this transaction.
    ///
    /// A record staged with `update` is returned as staged. Otherwise the
    /// first load of a ref reads the store and later loads return the same
    /// snapshot. Staged partial updates are never reflected.
    pub async fn load(&mut self, account_ref: &AccountRef) -> Result<Option<Account>, Error> {
        self.ensure_open()?;
        if let Some(staged) = self.updates.get(account_ref) {
            return Ok(Some(staged.clone()));
        }
        if let Some(cached) = self.reads.get(account_ref) {
            return Ok(cached.clone());
        }

        let record = self.driver.get(account_ref).await?;
        self.metrics
            .driver_reads
            .add(1, &[KeyValue::new("driver", self.driver.name())]);
        self.reads.insert(account_ref.clone(), record.clone());
        Ok(record)
    }

    /// Load several refs in the order given.
    pub async fn load_all(
        &mut self,
        account_refs: &[AccountRef],
    ) -> Result<Vec<Option<Account>>, Error> {
        let mut records = Vec::with_capacity(account_refs.len());
        for account_ref in account_refs {
            records.push(self.load(account_ref).await?);
        }
        Ok(records)
    }

    /// Stage a full replacement of a record. The account's version must be
    /// the one it was loaded at; a later update of the same ref replaces
    /// the earlier one.
    pub fn update(&mut self, account: Account) -> Result<(), Error> {
        self.ensure_open()?;
        self.updates.insert(account.account_ref.clone(), account);
        Ok(())
    }

    /// Stage a delta the store applies to the record at commit time,
    /// without validating its version.
    pub fn partial_update(
        &mut self,
        account_ref: &AccountRef,
        op: PartialUpdateOp,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.partial_updates.push((account_ref.clone(), op));
        Ok(())
    }

    fn take_batch(&mut self) -> CommitBatch {
        let reads = mem::take(&mut self.reads)
            .into_iter()
            .map(|(account_ref, record)| {
                let version = record
                    .map(|record| record.version)
                    .unwrap_or(Version::UNSTORED);
                (account_ref, version)
            })
            .collect();
        CommitBatch {
            transaction_id: self.id,
            reads,
            updates: mem::take(&mut self.updates),
            partial_updates: mem::take(&mut self.partial_updates),
        }
    }

    /// Submit every staged operation as one atomic unit.
    ///
    /// Returns `Committed` when all of them were applied and
    /// `Aborted(reason)` when none was. An `Err` means the store failed;
    /// nothing was applied either. The handle is terminal afterwards in
    /// every case.
    #[tracing::instrument(skip(self), fields(transaction_id = %self.id, driver = self.driver.name()))]
    pub async fn commit(&mut self) -> Result<CommitOutcome, Error> {
        self.ensure_open()?;
        let batch = self.take_batch();
        let driver_label = [KeyValue::new("driver", self.driver.name())];

        let result = {
            let _timer = Timer::start_with_labels(&self.metrics.commit_duration, &driver_label);
            self.driver.commit(batch).await
        };

        match &result {
            Ok(CommitOutcome::Committed) => {
                self.state = TransactionState::Committed;
                self.metrics.transactions_committed.add(1, &driver_label);
            }
            Ok(CommitOutcome::Aborted(reason)) => {
                debug!(%reason, "transaction aborted");
                self.state = TransactionState::Aborted(*reason);
                self.metrics.transactions_aborted.add(
                    1,
                    &[
                        KeyValue::new("driver", self.driver.name()),
                        KeyValue::new("reason", reason.to_string()),
                    ],
                );
            }
            Err(err) => {
                warn!("transaction failed: {err}");
                self.state = TransactionState::Failed;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_account, mock_account_ref},
        AccountField,
    };

    use super::*;
    use crate::{
        driver::{AbortReason, FaultInjectingDriver, FaultOptions, MemoryDriver},
        StoreClient,
    };

    async fn client_with(ids: &[&str], balance: i64) -> StoreClient {
        let client = StoreClient::new(Arc::new(MemoryDriver::default()));
        for id in ids {
            client.insert(mock_account(id, balance)).await.unwrap();
        }
        client
    }

    #[tokio::test]
    async fn test_load_reads_your_own_updates() -> Result<(), Error> {
        let client = client_with(&["a"], 100).await;
        let mut tx = client.begin_transaction();

        let mut a = tx.load(&mock_account_ref("a")).await?.unwrap();
        a.balance = 10;
        tx.update(a)?;
        assert_eq!(tx.load(&mock_account_ref("a")).await?.unwrap().balance, 10);

        tx.partial_update(
            &mock_account_ref("a"),
            PartialUpdateOp::increment(AccountField::Balance, 5),
        )?;
        assert_eq!(tx.load(&mock_account_ref("a")).await?.unwrap().balance, 10);

        assert_eq!(tx.commit().await?, CommitOutcome::Committed);
        assert_eq!(client.get(&mock_account_ref("a")).await?.unwrap().balance, 15);
        Ok(())
    }

    #[tokio::test]
    async fn test_staged_writes_are_invisible_until_commit() -> Result<(), Error> {
        let client = client_with(&["a"], 100).await;
        let mut writer = client.begin_transaction();
        writer.partial_update(
            &mock_account_ref("a"),
            PartialUpdateOp::decrement(AccountField::Balance, 40),
        )?;

        let mut reader = client.begin_transaction();
        assert_eq!(reader.load(&mock_account_ref("a")).await?.unwrap().balance, 100);

        writer.commit().await?;
        // The reader keeps the snapshot it observed.
        assert_eq!(reader.load(&mock_account_ref("a")).await?.unwrap().balance, 100);
        assert_eq!(
            reader.commit().await?,
            CommitOutcome::Aborted(AbortReason::ConflictDetected)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_terminal_handle_rejects_operations() -> Result<(), Error> {
        let client = client_with(&["a"], 100).await;
        let mut tx = client.begin_transaction();
        tx.load(&mock_account_ref("a")).await?;
        assert_eq!(tx.commit().await?, CommitOutcome::Committed);
        assert_eq!(tx.state(), TransactionState::Committed);

        let err = tx.load(&mock_account_ref("a")).await.unwrap_err();
        assert!(err.is_misuse(), "{err}");
        assert!(matches!(
            tx.update(mock_account("a", 1)),
            Err(Error::HandleClosed { .. })
        ));
        assert!(matches!(
            tx.partial_update(
                &mock_account_ref("a"),
                PartialUpdateOp::increment(AccountField::Balance, 1)
            ),
            Err(Error::HandleClosed { .. })
        ));
        assert!(matches!(tx.commit().await, Err(Error::HandleClosed { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_aborted_handle_is_terminal() -> Result<(), Error> {
        let faults = Arc::new(FaultInjectingDriver::new(
            Arc::new(MemoryDriver::default()),
            FaultOptions {
                scheduled: vec![AbortReason::CoordinatorUnavailable],
                ..Default::default()
            },
        ));
        let client = StoreClient::new(faults);
        client.insert(mock_account("a", 100)).await?;

        let mut tx = client.begin_transaction();
        tx.partial_update(
            &mock_account_ref("a"),
            PartialUpdateOp::decrement(AccountField::Balance, 1),
        )?;
        assert_eq!(
            tx.commit().await?,
            CommitOutcome::Aborted(AbortReason::CoordinatorUnavailable)
        );
        assert_eq!(
            tx.state(),
            TransactionState::Aborted(AbortReason::CoordinatorUnavailable)
        );
        assert!(matches!(tx.commit().await, Err(Error::HandleClosed { .. })));
        assert_eq!(client.get(&mock_account_ref("a")).await?.unwrap().balance, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() -> Result<(), Error> {
        let client = client_with(&["a"], 100).await;
        let mut tx = client.begin_transaction();
        tx.partial_update(
            &mock_account_ref("a"),
            PartialUpdateOp::decrement(AccountField::Balance, 10),
        )?;
        tx.partial_update(
            &mock_account_ref("missing"),
            PartialUpdateOp::increment(AccountField::Balance, 10),
        )?;

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, Error::PartialUpdateOnMissingRecord { .. }));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert_eq!(client.get(&mock_account_ref("a")).await?.unwrap().balance, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_handle_discards_writes() -> Result<(), Error> {
        let client = client_with(&["a"], 100).await;
        {
            let mut tx = client.begin_transaction();
            let mut a = tx.load(&mock_account_ref("a")).await?.unwrap();
            a.balance = 0;
            tx.update(a)?;
        }
        assert_eq!(client.get(&mock_account_ref("a")).await?.unwrap().balance, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_all_keeps_order() -> Result<(), Error> {
        let client = client_with(&["a", "b"], 100).await;
        let mut tx = client.begin_transaction();
        let records = tx
            .load_all(&[
                mock_account_ref("b"),
                mock_account_ref("missing"),
                mock_account_ref("a"),
            ])
            .await?;
        let ids: Vec<_> = records
            .iter()
            .map(|record| record.as_ref().map(|a| a.account_ref.id().to_string()))
            .collect();
        assert_eq!(
            ids,
            vec![Some("b".to_string()), None, Some("a".to_string())]
        );
        Ok(())
    }
}

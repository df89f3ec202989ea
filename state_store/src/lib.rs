use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use data_model::{Account, AccountRef, Bucket};
use metrics::Increment;
use opentelemetry::KeyValue;
use tracing::info;

pub mod driver;
pub mod serializer;
pub mod test_state_store;
pub mod transaction;

pub use driver::{
    open_database,
    AbortReason,
    CommitOutcome,
    ConnectionOptions,
    Driver,
    Error,
    FaultInjectingDriver,
    FaultOptions,
    MemoryDriver,
    MemoryOptions,
    TransactionId,
    TransactionState,
};
pub use transaction::Transaction;

/// Entry point to an account store. Cheap to clone; clones share the
/// connection and the transaction id sequence.
#[derive(Clone)]
pub struct StoreClient {
    driver: Arc<dyn Driver>,
    metrics: Arc<metrics::state_store::Metrics>,
    transaction_id_seq: Arc<AtomicU64>,
}

impl StoreClient {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            metrics: Arc::new(metrics::state_store::Metrics::new()),
            transaction_id_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a connection and build a client on top of it.
    pub fn open(
        options: ConnectionOptions,
        faults: Option<FaultOptions>,
    ) -> Result<Self, Error> {
        let driver = open_database(options, faults)?;
        info!(driver = driver.name(), "opened account store");
        Ok(Self::new(driver))
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    fn driver_labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("driver", self.driver.name())]
    }

    /// Open a new transaction. Opening never contacts the store.
    pub fn begin_transaction(&self) -> Transaction {
        let id = TransactionId::new(self.transaction_id_seq.fetch_add(1, Ordering::Relaxed));
        let labels = self.driver_labels();
        let _inc = Increment::inc(&self.metrics.transactions_started, &labels);
        Transaction::new(id, self.driver.clone(), self.metrics.clone())
    }

    /// Read the latest committed record outside of any transaction.
    pub async fn get(&self, account_ref: &AccountRef) -> Result<Option<Account>, Error> {
        self.metrics.driver_reads.add(1, &self.driver_labels());
        self.driver.get(account_ref).await
    }

    /// A fresh, unstored account in `bucket`. Nothing is written until it
    /// is inserted or committed.
    pub fn create_record(&self, bucket: &Bucket, initial_balance: i64) -> Account {
        Account::new(AccountRef::create(bucket), initial_balance)
    }

    /// Store a record outside of any transaction.
    pub async fn insert(&self, account: Account) -> Result<(), Error> {
        self.driver.insert(account).await?;
        self.metrics.driver_writes.add(1, &self.driver_labels());
        Ok(())
    }

    /// Delete every record of a bucket.
    pub async fn truncate_bucket(&self, bucket: &Bucket) -> Result<usize, Error> {
        let removed = self.driver.truncate_bucket(bucket).await?;
        self.metrics
            .driver_deletes
            .add(removed as u64, &self.driver_labels());
        info!(%bucket, removed, "truncated bucket");
        Ok(removed)
    }
}

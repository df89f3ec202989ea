use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::{Account, AccountRef, Bucket, Version};
use occ_utils::OptionInspectNone;
use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    ErrorKind,
    IteratorMode,
    Options as RocksDBOptions,
    ReadOptions,
    TransactionDB,
    TransactionDBOptions,
    TransactionOptions,
    WriteOptions,
};
use tracing::{debug, error, info};

use super::{
    config::{
        ROCKSDB_KEEP_LOG_FILE_NUM,
        ROCKSDB_MAX_WRITE_BUFFER_NUMBER,
        ROCKSDB_THREAD_COUNT,
        ROCKSDB_TXN_NUM_STRIPES,
        ROCKSDB_WRITE_BUFFER_SIZE,
    },
    resolve_commit,
    AbortReason,
    CommitBatch,
    CommitOutcome,
    Driver,
    Error,
    Resolution,
};
use crate::serializer::{JsonEncode, JsonEncoder};

pub const ACCOUNTS_CF: &str = "accounts";

/// Options to start a connection with RocksDB.
#[derive(Debug, Clone)]
pub struct Options {
    pub path: PathBuf,
    /// Bound on acquiring the row lock of each record a commit touches.
    pub lock_timeout: Duration,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Driver backed by a local RocksDB transaction database.
///
/// Loads read the latest committed record without locking. A commit runs
/// on the blocking pool inside one pessimistic RocksDB transaction that
/// locks every touched key before validating versions.
pub struct RocksDBDriver {
    db: Arc<TransactionDB>,
    lock_timeout: Duration,
}

impl RocksDBDriver {
    /// Open a new connection with a RocksDB database.
    pub fn open(driver_options: Options) -> Result<RocksDBDriver, Error> {
        let mut db_opts = RocksDBOptions::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        db_opts.increase_parallelism(*ROCKSDB_THREAD_COUNT);
        db_opts.set_max_write_buffer_number(*ROCKSDB_MAX_WRITE_BUFFER_NUMBER);
        db_opts.set_write_buffer_size(*ROCKSDB_WRITE_BUFFER_SIZE);
        db_opts.set_keep_log_file_num(*ROCKSDB_KEEP_LOG_FILE_NUM);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_num_stripes(*ROCKSDB_TXN_NUM_STRIPES);

        let column_families = vec![ColumnFamilyDescriptor::new(
            ACCOUNTS_CF,
            RocksDBOptions::default(),
        )];

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &txn_db_opts,
            &driver_options.path,
            column_families,
        )
        .inspect_err(|e| error!(path = ?driver_options.path, "failed to open rocksdb: {e}"))?;

        info!(path = ?driver_options.path, "opened rocksdb account store");

        Ok(RocksDBDriver {
            db: Arc::new(db),
            lock_timeout: driver_options.lock_timeout,
        })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&TransactionDB) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref())).await?
    }
}

fn accounts_cf(db: &TransactionDB) -> Result<&ColumnFamily, Error> {
    db.cf_handle(ACCOUNTS_CF)
        .inspect_none(|| error!("failed to get column family handle for {ACCOUNTS_CF}"))
        .ok_or(Error::MissingColumnFamily(ACCOUNTS_CF.to_string()))
}

fn decode(bytes: Option<Vec<u8>>) -> Result<Option<Account>, Error> {
    bytes.map(|bytes| JsonEncoder::decode(&bytes)).transpose()
}

/// Map the failure of a RocksDB transaction to the abort reason a caller
/// can retry on, if any.
fn abort_reason(err: &rocksdb::Error) -> Option<AbortReason> {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::Busy | ErrorKind::Expired => {
            Some(AbortReason::LockTimeout)
        }
        ErrorKind::TryAgain | ErrorKind::ShutdownInProgress => {
            Some(AbortReason::CoordinatorUnavailable)
        }
        _ => None,
    }
}

fn commit_blocking(
    db: &TransactionDB,
    lock_timeout: Duration,
    batch: &CommitBatch,
) -> Result<CommitOutcome, Error> {
    let cf = accounts_cf(db)?;

    let mut txn_opts = TransactionOptions::default();
    txn_opts.set_lock_timeout(lock_timeout.as_millis() as i64);
    let txn = db.transaction_opt(&WriteOptions::default(), &txn_opts);

    let mut current = HashMap::new();
    for account_ref in batch.touched_refs() {
        let record = match txn.get_for_update_cf(cf, account_ref.key(), true) {
            Ok(record) => decode(record)?,
            Err(err) => match abort_reason(&err) {
                Some(reason) => {
                    debug!(
                        transaction_id = %batch.transaction_id,
                        %account_ref,
                        "failed to lock record: {err}"
                    );
                    return Ok(CommitOutcome::Aborted(reason));
                }
                None => return Err(err.into()),
            },
        };
        current.insert(account_ref, record);
    }

    let accounts = match resolve_commit(batch, &current)? {
        Resolution::Conflict { account_ref } => {
            debug!(
                transaction_id = %batch.transaction_id,
                %account_ref,
                "record changed since it was observed"
            );
            return Ok(CommitOutcome::Aborted(AbortReason::ConflictDetected));
        }
        Resolution::Apply(accounts) => accounts,
    };

    for account in &accounts {
        txn.put_cf(cf, account.key(), JsonEncoder::encode(account)?)?;
    }
    match txn.commit() {
        Ok(()) => Ok(CommitOutcome::Committed),
        Err(err) => match abort_reason(&err) {
            Some(reason) => Ok(CommitOutcome::Aborted(reason)),
            None => Err(err.into()),
        },
    }
}

#[async_trait]
impl Driver for RocksDBDriver {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    async fn get(&self, account_ref: &AccountRef) -> Result<Option<Account>, Error> {
        let key = account_ref.key();
        self.blocking(move |db| decode(db.get_cf(accounts_cf(db)?, key)?))
            .await
    }

    async fn commit(&self, batch: CommitBatch) -> Result<CommitOutcome, Error> {
        let lock_timeout = self.lock_timeout;
        self.blocking(move |db| commit_blocking(db, lock_timeout, &batch))
            .await
    }

    async fn insert(&self, mut account: Account) -> Result<(), Error> {
        self.blocking(move |db| {
            let cf = accounts_cf(db)?;
            let key = account.key();
            account.version = decode(db.get_cf(cf, &key)?)?
                .map(|existing| existing.version.next())
                .unwrap_or(Version::new(1));
            db.put_cf(cf, key, JsonEncoder::encode(&account)?)?;
            Ok(())
        })
        .await
    }

    async fn truncate_bucket(&self, bucket: &Bucket) -> Result<usize, Error> {
        let prefix = bucket.key_prefix();
        self.blocking(move |db| {
            let cf = accounts_cf(db)?;
            let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
            let mut keys = Vec::new();
            for item in db.iterator_cf_opt(cf, ReadOptions::default(), mode) {
                let (key, _) = item?;
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                keys.push(key);
            }
            for key in &keys {
                db.delete_cf(cf, key)?;
            }
            Ok(keys.len())
        })
        .await
    }
}

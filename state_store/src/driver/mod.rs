//! The driver module centralizes the commit contract of the
//! account store.
//!
//! A driver stores versioned account records and applies a whole
//! `CommitBatch` atomically or not at all. Every driver shares the same
//! validation rule (`resolve_commit`), so the observable outcome of a
//! batch only differs between drivers in how exclusive access to the
//! touched refs is obtained.

use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use data_model::{Account, AccountRef, Bucket, PartialUpdateError, PartialUpdateOp, Version};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter};

pub mod config;
pub mod faults;
pub mod memory;
pub mod rocksdb;

pub use faults::{FaultInjectingDriver, FaultOptions};
pub use memory::{MemoryDriver, MemoryOptions};

/// Why a commit did not apply. Every reason is recoverable by retrying the
/// whole transaction on a fresh handle.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    EnumIter,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    /// A loaded or fully updated record changed since this transaction
    /// observed it.
    ConflictDetected,
    /// Exclusive access to every touched record could not be acquired in
    /// time.
    LockTimeout,
    /// A subsystem required to finalize the commit was unreachable.
    CoordinatorUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Aborted(AbortReason),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            CommitOutcome::Committed => None,
            CommitOutcome::Aborted(reason) => Some(*reason),
        }
    }
}

impl fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitOutcome::Committed => write!(f, "committed"),
            CommitOutcome::Aborted(reason) => write!(f, "aborted({reason})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Aborted(AbortReason),
    /// The store reported an error while committing; nothing was applied.
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionState::Open)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Open => write!(f, "open"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::Aborted(reason) => write!(f, "aborted({reason})"),
            TransactionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("transaction {id} is {state}, no further operations are allowed")]
    HandleClosed {
        id: TransactionId,
        state: TransactionState,
    },

    #[error("cannot apply a partial update to a missing record: {account_ref}")]
    PartialUpdateOnMissingRecord { account_ref: AccountRef },

    #[error(transparent)]
    PartialUpdateFailed {
        #[from]
        source: PartialUpdateError,
    },

    #[error("Failed to decode a serialized record. error: {}", source)]
    JsonDecoderFailed { source: anyhow::Error },

    #[error("Failed to encode a new serialized record. error: {}", source)]
    JsonEncoderFailed { source: anyhow::Error },

    #[error("column family {0} is missing")]
    MissingColumnFamily(String),

    #[error(transparent)]
    RocksDBFailure {
        #[from]
        source: ::rocksdb::Error,
    },

    #[error("blocking store task failed. error: {}", source)]
    BlockingTaskFailed {
        #[from]
        source: tokio::task::JoinError,
    },
}

impl Error {
    /// Calling an operation on a terminal handle is a programming error.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::HandleClosed { .. })
    }
}

/// Everything a transaction staged, handed to the driver on commit.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub transaction_id: TransactionId,
    /// Version observed by every load. `Version::UNSTORED` records that the
    /// ref was absent.
    pub reads: BTreeMap<AccountRef, Version>,
    /// Full-object replacements, keyed by ref. Each account carries the
    /// version it was loaded at.
    pub updates: BTreeMap<AccountRef, Account>,
    /// Field deltas applied by the store without validation.
    pub partial_updates: Vec<(AccountRef, PartialUpdateOp)>,
}

impl CommitBatch {
    /// Every ref the commit needs exclusive access to, in ref order.
    pub fn touched_refs(&self) -> BTreeSet<AccountRef> {
        self.reads
            .keys()
            .chain(self.updates.keys())
            .chain(self.partial_updates.iter().map(|(r, _)| r))
            .cloned()
            .collect()
    }
}

/// Result of validating a batch against the current records.
#[derive(Debug, PartialEq)]
pub enum Resolution {
    Conflict { account_ref: AccountRef },
    /// Records to store, already carrying their new versions.
    Apply(Vec<Account>),
}

/// Validate a batch against the current state of the touched records and
/// compute the records to write.
///
/// `current` must hold an entry (possibly `None`) for every ref in
/// `batch.touched_refs()`. Reads and full updates are compared against the
/// stored version (first-committer-wins). Partial updates are applied on
/// top of whatever is stored and are never a source of conflicts.
pub fn resolve_commit(
    batch: &CommitBatch,
    current: &HashMap<AccountRef, Option<Account>>,
) -> Result<Resolution, Error> {
    let stored_version = |account_ref: &AccountRef| {
        current
            .get(account_ref)
            .and_then(|record| record.as_ref())
            .map(|record| record.version)
            .unwrap_or(Version::UNSTORED)
    };

    for (account_ref, observed) in &batch.reads {
        if stored_version(account_ref) != *observed {
            return Ok(Resolution::Conflict {
                account_ref: account_ref.clone(),
            });
        }
    }
    for (account_ref, account) in &batch.updates {
        if stored_version(account_ref) != account.version {
            return Ok(Resolution::Conflict {
                account_ref: account_ref.clone(),
            });
        }
    }

    let mut next: BTreeMap<AccountRef, Account> = BTreeMap::new();
    for (account_ref, account) in &batch.updates {
        let mut account = account.clone();
        account.version = stored_version(account_ref).next();
        next.insert(account_ref.clone(), account);
    }
    for (account_ref, op) in &batch.partial_updates {
        let record = match next.entry(account_ref.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let Some(mut stored) = current.get(account_ref).cloned().flatten() else {
                    return Err(Error::PartialUpdateOnMissingRecord {
                        account_ref: account_ref.clone(),
                    });
                };
                stored.version = stored.version.next();
                entry.insert(stored)
            }
        };
        op.apply_to(record)?;
    }

    Ok(Resolution::Apply(next.into_values().collect()))
}

/// Driver defines the operations a store needs to support.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read the latest committed version of a record.
    async fn get(&self, account_ref: &AccountRef) -> Result<Option<Account>, Error>;

    /// Atomically validate and apply a batch.
    ///
    /// Retryable failures are reported as `CommitOutcome::Aborted`; an
    /// `Err` means the store itself failed. In both cases nothing was
    /// applied.
    async fn commit(&self, batch: CommitBatch) -> Result<CommitOutcome, Error>;

    /// Store a record outside of any transaction. Replaces an existing
    /// record with the same ref.
    async fn insert(&self, account: Account) -> Result<(), Error>;

    /// Remove every record of a bucket and return how many were removed.
    async fn truncate_bucket(&self, bucket: &Bucket) -> Result<usize, Error>;
}

/// Options to open one of the supported drivers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionOptions {
    Memory(MemoryOptions),
    RocksDB(rocksdb::Options),
}

/// Open a connection to a store, optionally wrapping it with fault
/// injection.
pub fn open_database(
    options: ConnectionOptions,
    faults: Option<FaultOptions>,
) -> Result<Arc<dyn Driver>, Error> {
    let driver: Arc<dyn Driver> = match options {
        ConnectionOptions::Memory(options) => Arc::new(MemoryDriver::new(options)),
        ConnectionOptions::RocksDB(options) => Arc::new(rocksdb::RocksDBDriver::open(options)?),
    };
    Ok(match faults {
        Some(faults) if faults.is_active() => Arc::new(FaultInjectingDriver::new(driver, faults)),
        _ => driver,
    })
}

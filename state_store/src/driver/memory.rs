//! An in-process store. Records live in a map guarded by one lock, and
//! every ref has its own async mutex that a commit must hold.
//!
//! Reads and commits suspend at least once, so concurrent callers
//! interleave the way they would against a remote store.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use data_model::{Account, AccountRef, Bucket, Version};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::{resolve_commit, AbortReason, CommitBatch, CommitOutcome, Driver, Error, Resolution};

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Bound on acquiring every ref lock a commit touches.
    pub lock_timeout: Duration,
    /// Simulated round trip added to each read and commit. Without it the
    /// driver still yields once per call.
    pub latency: Option<Duration>,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            latency: None,
        }
    }
}

pub struct MemoryDriver {
    records: RwLock<HashMap<AccountRef, Account>>,
    locks: DashMap<AccountRef, Arc<Mutex<()>>>,
    options: MemoryOptions,
}

impl MemoryDriver {
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
            options,
        }
    }

    async fn round_trip(&self) {
        match self.options.latency {
            Some(latency) if !latency.is_zero() => tokio::time::sleep(latency).await,
            _ => tokio::task::yield_now().await,
        }
    }

    fn ref_lock(&self, account_ref: &AccountRef) -> Arc<Mutex<()>> {
        self.locks
            .entry(account_ref.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Lock every ref in order. Returns `None` when the locks could not be
    /// acquired within the lock timeout; guards acquired so far are
    /// released.
    async fn lock_refs(&self, refs: &BTreeSet<AccountRef>) -> Option<Vec<OwnedMutexGuard<()>>> {
        let acquire = async {
            let mut guards = Vec::with_capacity(refs.len());
            for account_ref in refs {
                guards.push(self.ref_lock(account_ref).lock_owned().await);
            }
            guards
        };
        tokio::time::timeout(self.options.lock_timeout, acquire)
            .await
            .ok()
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    #[cfg(test)]
    async fn hold_lock(&self, account_ref: &AccountRef) -> OwnedMutexGuard<()> {
        self.ref_lock(account_ref).lock_owned().await
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(MemoryOptions::default())
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, account_ref: &AccountRef) -> Result<Option<Account>, Error> {
        self.round_trip().await;
        Ok(self.records.read().await.get(account_ref).cloned())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<CommitOutcome, Error> {
        self.round_trip().await;

        let touched = batch.touched_refs();
        let Some(_guards) = self.lock_refs(&touched).await else {
            debug!(
                transaction_id = %batch.transaction_id,
                refs = touched.len(),
                "timed out acquiring ref locks"
            );
            return Ok(CommitOutcome::Aborted(AbortReason::LockTimeout));
        };

        let mut records = self.records.write().await;
        let current: HashMap<_, _> = touched
            .iter()
            .map(|account_ref| (account_ref.clone(), records.get(account_ref).cloned()))
            .collect();
        match resolve_commit(&batch, &current)? {
            Resolution::Conflict { account_ref } => {
                debug!(
                    transaction_id = %batch.transaction_id,
                    %account_ref,
                    "record changed since it was observed"
                );
                Ok(CommitOutcome::Aborted(AbortReason::ConflictDetected))
            }
            Resolution::Apply(accounts) => {
                for account in accounts {
                    records.insert(account.account_ref.clone(), account);
                }
                Ok(CommitOutcome::Committed)
            }
        }
    }

    async fn insert(&self, mut account: Account) -> Result<(), Error> {
        let mut records = self.records.write().await;
        account.version = records
            .get(&account.account_ref)
            .map(|existing| existing.version.next())
            .unwrap_or(Version::new(1));
        records.insert(account.account_ref.clone(), account);
        Ok(())
    }

    async fn truncate_bucket(&self, bucket: &Bucket) -> Result<usize, Error> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|account_ref, _| account_ref.bucket() != bucket);
        // A lock still shared with an in-flight commit stays, so a later
        // commit on the same ref cannot get a second mutex for it.
        self.locks.retain(|account_ref, lock| {
            account_ref.bucket() != bucket || Arc::strong_count(lock) > 1
        });
        Ok(before - records.len())
    }
}

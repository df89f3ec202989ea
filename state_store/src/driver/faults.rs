//! A driver wrapper that aborts commits on demand. Used to exercise the
//! retry paths of callers against reasons a local store rarely produces.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
};

use async_trait::async_trait;
use data_model::{Account, AccountRef, Bucket};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use super::{AbortReason, CommitBatch, CommitOutcome, Driver, Error};

#[derive(Debug, Clone)]
pub struct FaultOptions {
    /// Probability in `[0, 1]` that a commit is aborted before reaching the
    /// wrapped driver.
    pub abort_rate: f64,
    pub seed: u64,
    /// Reasons drawn from when a random abort fires.
    pub reasons: Vec<AbortReason>,
    /// Aborts returned, in order, by the next commits regardless of
    /// `abort_rate`.
    pub scheduled: Vec<AbortReason>,
}

impl Default for FaultOptions {
    fn default() -> Self {
        Self {
            abort_rate: 0.0,
            seed: 0,
            reasons: vec![AbortReason::LockTimeout, AbortReason::CoordinatorUnavailable],
            scheduled: Vec::new(),
        }
    }
}

impl FaultOptions {
    pub fn with_abort_rate(abort_rate: f64) -> Self {
        Self {
            abort_rate,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        (self.abort_rate > 0.0 && !self.reasons.is_empty()) || !self.scheduled.is_empty()
    }
}

pub struct FaultInjectingDriver {
    inner: Arc<dyn Driver>,
    abort_rate: f64,
    reasons: Vec<AbortReason>,
    scheduled: Mutex<VecDeque<AbortReason>>,
    rng: Mutex<StdRng>,
    injection_count: AtomicUsize,
}

impl FaultInjectingDriver {
    pub fn new(inner: Arc<dyn Driver>, options: FaultOptions) -> Self {
        Self {
            inner,
            abort_rate: options.abort_rate.clamp(0.0, 1.0),
            reasons: options.reasons,
            scheduled: Mutex::new(options.scheduled.into()),
            rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
            injection_count: AtomicUsize::new(0),
        }
    }

    /// Abort the next commit that has no earlier scheduled abort.
    pub fn schedule(&self, reason: AbortReason) {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reason);
    }

    pub fn injection_count(&self) -> usize {
        self.injection_count.load(Ordering::Relaxed)
    }

    fn next_fault(&self) -> Option<AbortReason> {
        // The queue and rng stay consistent across a panic in another
        // holder, so a poisoned lock is still used.
        let scheduled = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let fault = scheduled.or_else(|| {
            if self.abort_rate <= 0.0 || self.reasons.is_empty() {
                return None;
            }
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            if rng.random::<f64>() >= self.abort_rate {
                return None;
            }
            Some(self.reasons[rng.random_range(0..self.reasons.len())])
        });
        if fault.is_some() {
            self.injection_count.fetch_add(1, Ordering::Relaxed);
        }
        fault
    }
}

#[async_trait]
impl Driver for FaultInjectingDriver {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, account_ref: &AccountRef) -> Result<Option<Account>, Error> {
        self.inner.get(account_ref).await
    }

    async fn commit(&self, batch: CommitBatch) -> Result<CommitOutcome, Error> {
        if let Some(reason) = self.next_fault() {
            debug!(
                transaction_id = %batch.transaction_id,
                %reason,
                "injected commit abort"
            );
            return Ok(CommitOutcome::Aborted(reason));
        }
        self.inner.commit(batch).await
    }

    async fn insert(&self, account: Account) -> Result<(), Error> {
        self.inner.insert(account).await
    }

    async fn truncate_bucket(&self, bucket: &Bucket) -> Result<usize, Error> {
        self.inner.truncate_bucket(bucket).await
    }
}

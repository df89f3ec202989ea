use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use data_model::{
    Account,
    AccountField,
    AccountRef,
    PartialUpdateError,
    PartialUpdateOp,
    TransferIntent,
};
use metrics::transfers::Metrics;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use state_store::{AbortReason, CommitOutcome, StoreClient, Transaction};
use strum::{AsRefStr, EnumString};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Committed,
    Aborted(AbortReason),
    /// The source could not cover the amount. Nothing was committed.
    InsufficientFunds,
}

impl TransferOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransferOutcome::Committed)
    }

    fn label(&self) -> &'static str {
        match self {
            TransferOutcome::Committed => "committed",
            TransferOutcome::Aborted(AbortReason::ConflictDetected) => "conflict_detected",
            TransferOutcome::Aborted(AbortReason::LockTimeout) => "lock_timeout",
            TransferOutcome::Aborted(AbortReason::CoordinatorUnavailable) => {
                "coordinator_unavailable"
            }
            TransferOutcome::InsufficientFunds => "insufficient_funds",
        }
    }
}

impl From<CommitOutcome> for TransferOutcome {
    fn from(outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Committed => TransferOutcome::Committed,
            CommitOutcome::Aborted(reason) => TransferOutcome::Aborted(reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountRef),

    #[error(transparent)]
    Arithmetic(#[from] PartialUpdateError),

    #[error(transparent)]
    Store(#[from] state_store::Error),
}

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
    EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StrategyKind {
    ReadModifyWrite,
    PartialUpdate,
}

impl StrategyKind {
    pub fn build(&self) -> Arc<dyn TransferStrategy> {
        match self {
            StrategyKind::ReadModifyWrite => Arc::new(ReadModifyWrite::new()),
            StrategyKind::PartialUpdate => Arc::new(PartialUpdate::new()),
        }
    }
}

/// One way of moving an amount between two accounts in a single
/// transaction. Every call uses its own transaction handle and makes
/// exactly one commit attempt.
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn transfer(
        &self,
        client: &StoreClient,
        intent: &TransferIntent,
    ) -> Result<TransferOutcome, TransferError>;
}

/// Outcome label for the transfer metrics. Transfers that fail with an
/// error are counted as `error`.
fn outcome_label(result: &Result<TransferOutcome, TransferError>) -> &'static str {
    match result {
        Ok(outcome) => outcome.label(),
        Err(_) => "error",
    }
}

fn record(
    metrics: &Metrics,
    kind: StrategyKind,
    result: &Result<TransferOutcome, TransferError>,
    start: Instant,
) {
    let labels = [
        KeyValue::new("strategy", kind.as_ref().to_string()),
        KeyValue::new("outcome", outcome_label(result)),
    ];
    metrics
        .transfer_duration
        .record(start.elapsed().as_secs_f64(), &labels);
    metrics.transfers.add(1, &labels);
}

async fn load_existing(
    tx: &mut Transaction,
    account_ref: &AccountRef,
) -> Result<Account, TransferError> {
    tx.load(account_ref)
        .await?
        .ok_or_else(|| TransferError::AccountNotFound(account_ref.clone()))
}

/// Load both accounts, adjust their balances client-side and write them
/// back as full updates. Conflicts with any concurrent write to either
/// account.
pub struct ReadModifyWrite {
    non_negative: bool,
    metrics: Metrics,
}

impl ReadModifyWrite {
    pub fn new() -> Self {
        Self {
            non_negative: false,
            metrics: Metrics::new(),
        }
    }

    /// Reject transfers the source cannot cover instead of letting its
    /// balance go negative.
    pub fn non_negative() -> Self {
        Self {
            non_negative: true,
            ..Self::new()
        }
    }

    async fn attempt(
        &self,
        client: &StoreClient,
        intent: &TransferIntent,
    ) -> Result<TransferOutcome, TransferError> {
        let mut tx = client.begin_transaction();

        // Load in ref order so row locks are requested the way the store
        // orders them.
        let source_first = intent.source() < intent.dest();
        let (first, second) = if source_first {
            (intent.source(), intent.dest())
        } else {
            (intent.dest(), intent.source())
        };
        let mut first = load_existing(&mut tx, first).await?;
        let mut second = load_existing(&mut tx, second).await?;
        let (source, dest) = if source_first {
            (&mut first, &mut second)
        } else {
            (&mut second, &mut first)
        };

        if self.non_negative && source.balance < intent.amount() {
            debug!(
                source = %intent.source(),
                balance = source.balance,
                amount = intent.amount(),
                "insufficient funds"
            );
            return Ok(TransferOutcome::InsufficientFunds);
        }

        PartialUpdateOp::decrement(AccountField::Balance, intent.amount()).apply_to(source)?;
        PartialUpdateOp::increment(AccountField::Balance, intent.amount()).apply_to(dest)?;
        tx.update(first)?;
        tx.update(second)?;

        Ok(tx.commit().await?.into())
    }
}

impl Default for ReadModifyWrite {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferStrategy for ReadModifyWrite {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ReadModifyWrite
    }

    #[instrument(skip(self, client, intent), fields(strategy = "read_modify_write", %intent))]
    async fn transfer(
        &self,
        client: &StoreClient,
        intent: &TransferIntent,
    ) -> Result<TransferOutcome, TransferError> {
        let start = Instant::now();
        let result = self.attempt(client, intent).await;
        record(&self.metrics, self.kind(), &result, start);
        result
    }
}

/// Stage a decrement of the source and an increment of the destination
/// without reading either. The store applies both deltas on commit, so
/// concurrent transfers touching the same accounts do not conflict.
pub struct PartialUpdate {
    metrics: Metrics,
}

impl PartialUpdate {
    pub fn new() -> Self {
        Self {
            metrics: Metrics::new(),
        }
    }

    async fn attempt(
        &self,
        client: &StoreClient,
        intent: &TransferIntent,
    ) -> Result<TransferOutcome, TransferError> {
        let mut tx = client.begin_transaction();
        tx.partial_update(
            intent.source(),
            PartialUpdateOp::decrement(AccountField::Balance, intent.amount()),
        )?;
        tx.partial_update(
            intent.dest(),
            PartialUpdateOp::increment(AccountField::Balance, intent.amount()),
        )?;
        Ok(tx.commit().await?.into())
    }
}

impl Default for PartialUpdate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferStrategy for PartialUpdate {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PartialUpdate
    }

    #[instrument(skip(self, client, intent), fields(strategy = "partial_update", %intent))]
    async fn transfer(
        &self,
        client: &StoreClient,
        intent: &TransferIntent,
    ) -> Result<TransferOutcome, TransferError> {
        let start = Instant::now();
        let result = self.attempt(client, intent).await;
        record(&self.metrics, self.kind(), &result, start);
        result
    }
}

mod aggregator;
mod strategy;

pub use aggregator::{AggregateError, RetryingAggregator, DEFAULT_MAX_ATTEMPTS};
pub use strategy::{
    PartialUpdate,
    ReadModifyWrite,
    StrategyKind,
    TransferError,
    TransferOutcome,
    TransferStrategy,
};

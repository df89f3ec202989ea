use std::time::{SystemTime, UNIX_EPOCH};

pub mod random;
pub mod timed;

pub use random::{random_distinct_pair, random_element, SelectionError};
pub use timed::{timed, Timed};

pub trait OptionInspectNone<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self;
}

impl<T> OptionInspectNone<T> for Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        match &self {
            Some(_) => (),
            None => inspector_function(),
        }
        self
    }
}

/// Get the elapsed system time since the Unix Epoch in Milliseconds
pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

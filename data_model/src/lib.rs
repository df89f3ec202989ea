pub mod test_objects;

use std::fmt::{self, Display};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

pub const DEFAULT_BUCKET: &str = "test.bucket.Value";

/// A named collection of records sharing the account schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket(String);

impl Bucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    /// Storage key prefix shared by every record of this bucket.
    ///
    /// The name is length-prefixed so that no bucket's prefix is a prefix
    /// of another bucket's keys, even when names contain `/`.
    pub fn key_prefix(&self) -> String {
        format!("{}:{}/", self.0.len(), self.0)
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET)
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Bucket {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique, immutable reference to an account record.
///
/// Refs are totally ordered by `(bucket, id)`. Stores that lock refs
/// acquire them in this order, so callers that load several refs should
/// load them in the same order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountRef {
    bucket: Bucket,
    id: String,
}

impl AccountRef {
    /// Generate a fresh ref. Ids are never reused.
    pub fn create(bucket: &Bucket) -> Self {
        Self {
            bucket: bucket.clone(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn new(bucket: Bucket, id: impl Into<String>) -> Self {
        Self {
            bucket,
            id: id.into(),
        }
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> String {
        format!("{}{}", self.bucket.key_prefix(), self.id)
    }
}

impl Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/db/{}/{}", self.bucket, self.id)
    }
}

/// Per-record version maintained by the store.
///
/// `Version(0)` is the version of a record that was never stored.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct Version(u64);

impl Version {
    pub const UNSTORED: Version = Version(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Version {
        Version(self.0 + 1)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder, PartialEq)]
pub struct Account {
    pub account_ref: AccountRef,
    #[builder(default)]
    pub balance: i64,
    #[serde(default)]
    #[builder(default)]
    pub version: Version,

    // Declared by the account schema, never read by transfers.
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub name: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    #[builder(default = "Some(occ_utils::get_epoch_time_in_ms())")]
    pub created_at: Option<u64>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub geo: Option<GeoPoint>,
}

impl Account {
    pub fn new(account_ref: AccountRef, balance: i64) -> Self {
        Self {
            account_ref,
            balance,
            version: Version::UNSTORED,
            name: None,
            tags: Vec::new(),
            created_at: Some(occ_utils::get_epoch_time_in_ms()),
            geo: None,
        }
    }

    pub fn key(&self) -> String {
        self.account_ref.key()
    }
}

/// Numeric account fields that the store can change with a partial update.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccountField {
    Balance,
}

impl TryFrom<&str> for AccountField {
    type Error = PartialUpdateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "balance" => Ok(AccountField::Balance),
            other => Err(PartialUpdateError::UnknownField(other.to_string())),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpdateOperator {
    Increment,
    Decrement,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartialUpdateError {
    #[error("unknown field for partial update: {0}")]
    UnknownField(String),

    #[error("applying {operator} {magnitude} to {current} overflows")]
    Overflow {
        operator: UpdateOperator,
        magnitude: i64,
        current: i64,
    },
}

/// A field-level delta the store applies without a prior read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartialUpdateOp {
    pub field: AccountField,
    pub operator: UpdateOperator,
    pub magnitude: i64,
}

impl PartialUpdateOp {
    pub fn increment(field: AccountField, magnitude: i64) -> Self {
        Self {
            field,
            operator: UpdateOperator::Increment,
            magnitude,
        }
    }

    pub fn decrement(field: AccountField, magnitude: i64) -> Self {
        Self {
            field,
            operator: UpdateOperator::Decrement,
            magnitude,
        }
    }

    pub fn apply(&self, current: i64) -> Result<i64, PartialUpdateError> {
        let next = match self.operator {
            UpdateOperator::Increment => current.checked_add(self.magnitude),
            UpdateOperator::Decrement => current.checked_sub(self.magnitude),
        };
        next.ok_or(PartialUpdateError::Overflow {
            operator: self.operator,
            magnitude: self.magnitude,
            current,
        })
    }

    pub fn apply_to(&self, account: &mut Account) -> Result<(), PartialUpdateError> {
        match self.field {
            AccountField::Balance => account.balance = self.apply(account.balance)?,
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferIntentError {
    #[error("transfer amount must not be negative, got {0}")]
    NegativeAmount(i64),

    #[error("source and destination are the same account: {0}")]
    SameAccount(AccountRef),
}

/// One transfer attempt: move `amount` from `source` to `dest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    source: AccountRef,
    dest: AccountRef,
    amount: i64,
}

impl TransferIntent {
    pub fn new(
        source: AccountRef,
        dest: AccountRef,
        amount: i64,
    ) -> Result<Self, TransferIntentError> {
        if amount < 0 {
            return Err(TransferIntentError::NegativeAmount(amount));
        }
        if source == dest {
            return Err(TransferIntentError::SameAccount(source));
        }
        Ok(Self {
            source,
            dest,
            amount,
        })
    }

    pub fn source(&self) -> &AccountRef {
        &self.source
    }

    pub fn dest(&self) -> &AccountRef {
        &self.dest
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }
}

impl Display for TransferIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.source, self.dest, self.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_ref_order_and_key() {
        let bucket = Bucket::default();
        let a = AccountRef::new(bucket.clone(), "a");
        let b = AccountRef::new(bucket.clone(), "b");
        assert!(a < b);
        assert_eq!(a.key(), "17:test.bucket.Value/a");
        assert_eq!(a.to_string(), "/db/test.bucket.Value/a");

        let fresh = AccountRef::create(&bucket);
        assert_ne!(fresh, AccountRef::create(&bucket));
        assert_eq!(fresh.bucket(), &bucket);
    }

    #[test]
    fn test_keys_of_nested_bucket_names_are_distinct() {
        let outer = Bucket::new("a");
        let nested = Bucket::new("a/b");
        let in_nested = AccountRef::new(nested.clone(), "c");
        let in_outer = AccountRef::new(outer.clone(), "b/c");

        assert_ne!(in_nested.key(), in_outer.key());
        assert!(in_outer.key().starts_with(&outer.key_prefix()));
        assert!(!in_nested.key().starts_with(&outer.key_prefix()));
        assert!(in_nested.key().starts_with(&nested.key_prefix()));
        assert!(!in_outer.key().starts_with(&nested.key_prefix()));
    }

    #[test]
    fn test_transfer_intent_validation() {
        let bucket = Bucket::default();
        let a = AccountRef::new(bucket.clone(), "a");
        let b = AccountRef::new(bucket, "b");

        let intent = TransferIntent::new(a.clone(), b.clone(), 0).unwrap();
        assert_eq!(intent.amount(), 0);

        assert_eq!(
            TransferIntent::new(a.clone(), b.clone(), -1),
            Err(TransferIntentError::NegativeAmount(-1))
        );
        assert_eq!(
            TransferIntent::new(a.clone(), a.clone(), 10),
            Err(TransferIntentError::SameAccount(a))
        );
    }

    #[test]
    fn test_partial_update_apply() {
        let bucket = Bucket::default();
        let mut account = Account::new(AccountRef::new(bucket, "a"), 100);

        PartialUpdateOp::decrement(AccountField::Balance, 130)
            .apply_to(&mut account)
            .unwrap();
        assert_eq!(account.balance, -30);

        PartialUpdateOp::increment(AccountField::Balance, 30)
            .apply_to(&mut account)
            .unwrap();
        assert_eq!(account.balance, 0);

        let overflow = PartialUpdateOp::increment(AccountField::Balance, 1).apply(i64::MAX);
        assert!(matches!(overflow, Err(PartialUpdateError::Overflow { .. })));
    }

    #[test]
    fn test_account_field_names() {
        assert_eq!(AccountField::Balance.as_ref(), "balance");
        assert_eq!(AccountField::try_from("balance"), Ok(AccountField::Balance));
        assert_eq!(
            AccountField::try_from("amount"),
            Err(PartialUpdateError::UnknownField("amount".to_string()))
        );
    }

    #[test]
    fn test_account_builder_defaults() {
        let account = AccountBuilder::default()
            .account_ref(AccountRef::new(Bucket::default(), "a"))
            .balance(100)
            .build()
            .unwrap();
        assert_eq!(account.balance, 100);
        assert_eq!(account.version, Version::UNSTORED);
        assert!(account.tags.is_empty());
        assert!(account.created_at.is_some());

        assert!(AccountBuilder::default().balance(1).build().is_err());
    }

    #[test]
    fn test_account_decodes_without_auxiliary_fields() {
        let json = r#"{"account_ref":{"bucket":"b","id":"1"},"balance":5}"#;
        let account: Account = serde_json::from_str(json).unwrap();
        assert_eq!(account.balance, 5);
        assert_eq!(account.version, Version::UNSTORED);
        assert_eq!(account.name, None);
    }
}

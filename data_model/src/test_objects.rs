pub mod tests {
    use crate::{Account, AccountRef, Bucket};

    pub const TEST_BUCKET: &str = "test.bucket.Value";
    pub const TEST_INITIAL_BALANCE: i64 = 100;

    pub fn test_bucket() -> Bucket {
        Bucket::new(TEST_BUCKET)
    }

    pub fn mock_account_ref(id: &str) -> AccountRef {
        AccountRef::new(test_bucket(), id)
    }

    pub fn mock_account(id: &str, balance: i64) -> Account {
        Account::new(mock_account_ref(id), balance)
    }

    /// `count` unstored accounts with ids `acc-000`, `acc-001`, ... so that
    /// their ref order matches their index.
    pub fn mock_accounts(count: usize, balance: i64) -> Vec<Account> {
        (0..count)
            .map(|i| mock_account(&format!("acc-{i:03}"), balance))
            .collect()
    }
}

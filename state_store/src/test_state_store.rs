use std::sync::Arc;

use data_model::{test_objects::tests::mock_accounts, AccountRef};

use crate::{Error, MemoryDriver, MemoryOptions, StoreClient};

/// A store client over a fresh in-memory driver.
pub fn memory_client() -> StoreClient {
    StoreClient::new(Arc::new(MemoryDriver::new(MemoryOptions::default())))
}

/// Insert `count` accounts in the test bucket and return their refs in
/// ref order.
pub async fn seed_accounts(
    client: &StoreClient,
    count: usize,
    balance: i64,
) -> Result<Vec<AccountRef>, Error> {
    let mut refs = Vec::with_capacity(count);
    for account in mock_accounts(count, balance) {
        refs.push(account.account_ref.clone());
        client.insert(account).await?;
    }
    Ok(refs)
}

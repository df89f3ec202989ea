use std::{any::type_name, fmt::Debug};

use serde::{de::DeserializeOwned, Serialize};

use crate::driver::Error;

pub struct JsonEncoder;

pub trait JsonEncode {
    fn encode<T: Serialize + Debug>(value: &T) -> Result<Vec<u8>, Error>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error>;
}

impl JsonEncode for JsonEncoder {
    fn encode<T: Serialize + Debug>(value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(|e| Error::JsonEncoderFailed {
            source: anyhow::anyhow!(
                "error serializing into json: {}, type: {}, value: {:?}",
                e,
                type_name::<T>(),
                value
            ),
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::JsonDecoderFailed {
            source: anyhow::anyhow!(
                "error deserializing from json bytes: {}, type: {}, value: {}",
                e,
                type_name::<T>(),
                String::from_utf8_lossy(bytes)
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::mock_account, Account, Version};

    use super::*;

    #[test]
    fn test_account_survives_encoding() {
        let mut account = mock_account("a", -20);
        account.version = Version::new(3);
        account.tags = vec!["vip".to_string()];
        let bytes = JsonEncoder::encode(&account).unwrap();
        let decoded: Account = JsonEncoder::decode(&bytes).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn test_decode_reports_type_and_payload() {
        let err = JsonEncoder::decode::<Account>(b"{\"balance\": \"x\"}").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Account"), "{message}");
        assert!(message.contains("balance"), "{message}");
    }
}

//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Account;
    use crate::crypto::{sha256, Address, KeyPair};
    use crate::economics::{TRANSFER_FEE_PALS, VALIDATOR_DEPOSIT_PALS};
    use crate::error::ValidationError;

    fn create_test_address(s: &str) -> Address {
        sha256(s.as_bytes())
    }

    fn funded(balance: u64, nonce: u64) -> Account {
        Account {
            balance,
            nonce,
            ..Account::default()
        }
    }

    #[test]
    fn test_tx_validation_success() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::transfer(keypair.address(), create_test_address("bob"), 1_000, 1)
            .signed_by(&keypair)
            .unwrap();

        assert_eq!(tx.fee, TRANSFER_FEE_PALS);
        assert!(tx.validate(&funded(1_000_000, 0)).is_ok());
    }

    #[test]
    fn test_unsigned_transaction_fails() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::transfer(keypair.address(), create_test_address("bob"), 1_000, 1);
        assert_eq!(
            tx.validate(&funded(1_000_000, 0)),
            Err(ValidationError::InvalidSignature)
        );
    }

    #[test]
    fn test_key_not_owning_sender_fails() {
        let owner = KeyPair::generate().unwrap();
        let thief = KeyPair::generate().unwrap();
        let tx = Transaction::transfer(owner.address(), create_test_address("bob"), 1_000, 1)
            .signed_by(&thief)
            .unwrap();
        assert!(!tx.verify_signature());
    }

    #[test]
    fn test_tampered_amount_breaks_signature() {
        let keypair = KeyPair::generate().unwrap();
        let mut tx = Transaction::transfer(keypair.address(), create_test_address("bob"), 1_000, 1)
            .signed_by(&keypair)
            .unwrap();
        tx.payload = TxPayload::Transfer {
            recipient: create_test_address("bob"),
            amount: 999_999,
        };
        assert_eq!(tx.check_signature(), Err(ValidationError::InvalidSignature));
    }

    #[test]
    fn test_nonce_must_be_next() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::transfer(keypair.address(), create_test_address("bob"), 1_000, 3)
            .signed_by(&keypair)
            .unwrap();
        assert_eq!(
            tx.validate(&funded(1_000_000, 1)),
            Err(ValidationError::NonceMismatch { expected: 2, got: 3 })
        );
        assert!(tx.validate(&funded(1_000_000, 2)).is_ok());
    }

    #[test]
    fn test_balance_covers_amount_plus_fee() {
        let keypair = KeyPair::generate().unwrap();
        let tx = Transaction::transfer(keypair.address(), create_test_address("bob"), 200_000_000, 1)
            .signed_by(&keypair)
            .unwrap();

        assert!(tx.validate(&funded(200_050_450, 0)).is_ok());
        assert_eq!(
            tx.validate(&funded(200_000_500, 0)),
            Err(ValidationError::InsufficientBalance {
                required: 200_050_000,
                available: 200_000_500,
            })
        );
    }

    #[test]
    fn test_fee_is_fixed_per_kind() {
        let keypair = KeyPair::generate().unwrap();
        let mut tx = Transaction::transfer(keypair.address(), create_test_address("bob"), 10, 1);
        tx.fee = 1;
        let tx = tx.signed_by(&keypair).unwrap();
        assert_eq!(
            tx.check_shape(),
            Err(ValidationError::InvalidFee {
                expected: TRANSFER_FEE_PALS,
                got: 1
            })
        );

        let lock = Transaction::lock_deposit(keypair.address(), 1);
        assert_eq!(lock.fee, 0);
        assert_eq!(lock.required_balance(), Ok(VALIDATOR_DEPOSIT_PALS));
    }

    #[test]
    fn test_self_send_and_zero_amount_rejected() {
        let keypair = KeyPair::generate().unwrap();
        let self_send = Transaction::transfer(keypair.address(), keypair.address(), 10, 1);
        assert!(matches!(self_send.check_shape(), Err(ValidationError::InvalidAmount(_))));

        let zero = Transaction::transfer(keypair.address(), create_test_address("bob"), 0, 1);
        assert!(matches!(zero.check_shape(), Err(ValidationError::InvalidAmount(_))));
    }

    #[test]
    fn test_hash_ignores_signature() {
        let keypair = KeyPair::generate().unwrap();
        let unsigned = Transaction::request_withdrawal(keypair.address(), 4);
        let signed = unsigned.clone().signed_by(&keypair).unwrap();
        assert_eq!(unsigned.hash(), signed.hash());
    }

    #[test]
    fn test_fingerprint_hex_serde() {
        let fp = DeviceFingerprint(sha256(b"device"));
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: DeviceFingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
        assert!(DeviceFingerprint::from_hex("00ff").is_err());
    }
}

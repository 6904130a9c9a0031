/// Validation logic for transactions separated from type definitions
use crate::blockchain::Account;
use crate::crypto::verify_signed_by;
use crate::economics::VALIDATOR_DEPOSIT_PALS;
use crate::error::ValidationError;
use crate::transaction::types::{Transaction, TxPayload};

impl Transaction {
    /// Signature present, made by the key that hashes to `sender`.
    pub fn verify_signature(&self) -> bool {
        match (&self.signature, &self.public_key) {
            (Some(sig), Some(pk)) => verify_signed_by(&self.sender, pk, &self.hash(), sig),
            _ => false,
        }
    }

    pub fn check_signature(&self) -> Result<(), ValidationError> {
        if self.verify_signature() {
            Ok(())
        } else {
            Err(ValidationError::InvalidSignature)
        }
    }

    /// Fee and amount rules that need no state.
    pub fn check_shape(&self) -> Result<(), ValidationError> {
        let expected = self.payload.required_fee();
        if self.fee != expected {
            return Err(ValidationError::InvalidFee {
                expected,
                got: self.fee,
            });
        }

        if let TxPayload::Transfer { recipient, amount } = &self.payload {
            if *amount == 0 {
                return Err(ValidationError::InvalidAmount(
                    "transfer amount must be positive".to_string(),
                ));
            }
            if *recipient == self.sender {
                return Err(ValidationError::InvalidAmount(
                    "sender and recipient cannot be the same".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Pals the sender must hold for this transaction to apply.
    pub fn required_balance(&self) -> Result<u64, ValidationError> {
        let spend = match self.payload {
            TxPayload::Transfer { amount, .. } => amount,
            TxPayload::LockDeposit => VALIDATOR_DEPOSIT_PALS,
            _ => 0,
        };
        spend.checked_add(self.fee).ok_or(ValidationError::Overflow)
    }

    /// Nonce first, then balance.
    pub fn check_against(&self, account: &Account) -> Result<(), ValidationError> {
        let expected = account.nonce.checked_add(1).ok_or(ValidationError::Overflow)?;
        if self.nonce != expected {
            return Err(ValidationError::NonceMismatch {
                expected,
                got: self.nonce,
            });
        }

        let required = self.required_balance()?;
        if account.balance < required {
            return Err(ValidationError::InsufficientBalance {
                required,
                available: account.balance,
            });
        }
        Ok(())
    }

    /// The full per-transaction pipeline: signature, shape, nonce, balance.
    pub fn validate(&self, account: &Account) -> Result<(), ValidationError> {
        self.check_signature()?;
        self.check_shape()?;
        self.check_against(account)
    }
}

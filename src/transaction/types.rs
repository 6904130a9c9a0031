/// Transaction types for TIMPAL
use crate::blockchain::Sha256Hash;
use crate::crypto::{Address, KeyPair};
use crate::economics::TRANSFER_FEE_PALS;
use crate::error::ChainError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque 32-byte device token. Hex on the wire and in config.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceFingerprint(pub [u8; 32]);

impl DeviceFingerprint {
    pub fn from_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| ChainError::ConfigError(format!("Invalid device fingerprint hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            ChainError::ConfigError(format!("Device fingerprint must be 32 bytes, got {}", b.len()))
        })?;
        Ok(DeviceFingerprint(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceFingerprint({})", &self.to_hex()[..16])
    }
}

impl Serialize for DeviceFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DeviceFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DeviceFingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// What a transaction does. Everything except `Transfer` is a validator lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    Transfer { recipient: Address, amount: u64 },
    RegisterValidator { device_fingerprint: DeviceFingerprint },
    LockDeposit,
    RequestWithdrawal,
    ProcessWithdrawal,
}

impl TxPayload {
    fn tag(&self) -> &'static [u8] {
        match self {
            TxPayload::Transfer { .. } => b"transfer",
            TxPayload::RegisterValidator { .. } => b"register_validator",
            TxPayload::LockDeposit => b"lock_deposit",
            TxPayload::RequestWithdrawal => b"request_withdrawal",
            TxPayload::ProcessWithdrawal => b"process_withdrawal",
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, TxPayload::Transfer { .. })
    }

    /// The fee this kind must carry.
    pub fn required_fee(&self) -> u64 {
        if self.is_lifecycle() {
            0
        } else {
            TRANSFER_FEE_PALS
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub payload: TxPayload,
    pub fee: u64,
    pub nonce: u64,
    /// Milliseconds since the Unix epoch, as set by the sender.
    pub timestamp: u64,
    pub public_key: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
}

impl Transaction {
    /// Unsigned transaction with the fee its kind requires.
    pub fn new(sender: Address, payload: TxPayload, nonce: u64) -> Self {
        Transaction {
            sender,
            fee: payload.required_fee(),
            payload,
            nonce,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            public_key: None,
            signature: None,
        }
    }

    pub fn transfer(sender: Address, recipient: Address, amount: u64, nonce: u64) -> Self {
        Self::new(sender, TxPayload::Transfer { recipient, amount }, nonce)
    }

    pub fn register_validator(sender: Address, device_fingerprint: DeviceFingerprint, nonce: u64) -> Self {
        Self::new(sender, TxPayload::RegisterValidator { device_fingerprint }, nonce)
    }

    pub fn lock_deposit(sender: Address, nonce: u64) -> Self {
        Self::new(sender, TxPayload::LockDeposit, nonce)
    }

    pub fn request_withdrawal(sender: Address, nonce: u64) -> Self {
        Self::new(sender, TxPayload::RequestWithdrawal, nonce)
    }

    pub fn process_withdrawal(sender: Address, nonce: u64) -> Self {
        Self::new(sender, TxPayload::ProcessWithdrawal, nonce)
    }

    /// Canonical bytes of every field except the key and signature.
    pub fn signable_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(128);
        message.extend_from_slice(b"TIMPAL_TX:");
        message.extend_from_slice(self.payload.tag());
        message.extend_from_slice(&self.sender);
        match &self.payload {
            TxPayload::Transfer { recipient, amount } => {
                message.extend_from_slice(recipient);
                message.extend_from_slice(&amount.to_le_bytes());
            }
            TxPayload::RegisterValidator { device_fingerprint } => {
                message.extend_from_slice(&device_fingerprint.0);
            }
            TxPayload::LockDeposit | TxPayload::RequestWithdrawal | TxPayload::ProcessWithdrawal => {}
        }
        message.extend_from_slice(&self.fee.to_le_bytes());
        message.extend_from_slice(&self.nonce.to_le_bytes());
        message.extend_from_slice(&self.timestamp.to_le_bytes());
        message
    }

    /// Transaction id. Independent of the signature bytes.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.signable_message());
        hasher.finalize().into()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn sign(&mut self, signature: Vec<u8>, public_key: Vec<u8>) {
        self.signature = Some(signature);
        self.public_key = Some(public_key);
    }

    /// Sign with `keypair`, which must own `sender`.
    pub fn signed_by(mut self, keypair: &KeyPair) -> Result<Self, ChainError> {
        let signature = keypair.sign(&self.hash())?;
        self.sign(signature.to_vec(), keypair.public_key_bytes().to_vec());
        Ok(self)
    }

    pub fn amount(&self) -> u64 {
        match self.payload {
            TxPayload::Transfer { amount, .. } => amount,
            _ => 0,
        }
    }

    pub fn recipient(&self) -> Option<&Address> {
        match &self.payload {
            TxPayload::Transfer { recipient, .. } => Some(recipient),
            _ => None,
        }
    }
}

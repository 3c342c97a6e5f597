use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid recovery phrase: {0}")]
    InvalidPhrase(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Signature verification failed")]
    BadSignature,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown {kind} discriminant: {value}")]
    UnknownDiscriminant { kind: &'static str, value: u8 },

    #[error("Envelope too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

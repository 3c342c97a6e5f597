use serde::{Deserialize, Serialize};

use crate::constants::{ADDRESS_SIZE, LOCAL_ADDRESS_PREFIX};
use crate::error::{IdentityError, ProtocolError};

// Account address = first 20 bytes of BLAKE3(Ed25519 verifying key)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_SIZE]);

    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let hash = blake3::hash(public_key);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&hash.as_bytes()[..ADDRESS_SIZE]);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse `0x` followed by 40 hex digits (either case).
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| IdentityError::InvalidAddress(s.to_string()))?;

        if digits.len() != ADDRESS_SIZE * 2 {
            return Err(IdentityError::InvalidAddress(s.to_string()));
        }

        let bytes = hex::decode(digits).map_err(|_| IdentityError::InvalidAddress(s.to_string()))?;
        let mut arr = [0u8; ADDRESS_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn is_well_formed(s: &str) -> bool {
        Self::from_hex(s).is_ok()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn short(&self) -> String {
        self.to_hex()[..10].to_string()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Address {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Identifier of a blob in the content-addressed store.
///
/// Remote addresses are whatever the store hands back (an IPFS CID, or a
/// BLAKE3 hex digest for the in-memory store). Addresses of blobs that only
/// exist in local fallback storage carry the `local-` prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress(pub String);

impl ContentAddress {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Deterministic address for a blob kept in local fallback storage.
    pub fn local_for(bytes: &[u8]) -> Self {
        Self(format!("{LOCAL_ADDRESS_PREFIX}{}", blake3::hash(bytes).to_hex()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ADDRESS_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(RequestId, GroupId, MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestStatus {
    Pending = 0,
    Accepted = 1,
    Rejected = 2,
}

impl RequestStatus {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Accepted),
            2 => Ok(Self::Rejected),
            value => Err(ProtocolError::UnknownDiscriminant {
                kind: "request status",
                value,
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Text = 0,
    Image = 1,
    File = 2,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::Text),
            1 => Ok(Self::Image),
            2 => Ok(Self::File),
            value => Err(ProtocolError::UnknownDiscriminant {
                kind: "message type",
                value,
            }),
        }
    }
}

/// Health of the ledger connection as tracked by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Healthy,
    Degraded,
    CircuitOpen,
    Resetting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::CircuitOpen => "circuit-open",
            Self::Resetting => "resetting",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_roundtrip() {
        let addr = Address::from_public_key(&[7u8; 32]);
        let parsed = Address::from_hex(&addr.to_hex()).unwrap();
        assert_eq!(addr, parsed);
        assert_eq!(addr.to_hex().len(), 42);
    }

    #[test]
    fn test_address_accepts_uppercase() {
        let addr = Address([0xABu8; 20]);
        let upper = format!("0x{}", hex::encode_upper(addr.0));
        assert_eq!(Address::from_hex(&upper).unwrap(), addr);
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        assert!(!Address::is_well_formed(""));
        assert!(!Address::is_well_formed("0x1234"));
        assert!(!Address::is_well_formed(&"ab".repeat(20)));
        assert!(!Address::is_well_formed(&format!("0x{}", "zz".repeat(20))));
        assert!(!Address::is_well_formed(&format!("0x{}", "ab".repeat(21))));
    }

    #[test]
    fn test_local_content_address_is_deterministic() {
        let a = ContentAddress::local_for(b"sealed backup");
        let b = ContentAddress::local_for(b"sealed backup");
        assert_eq!(a, b);
        assert!(a.is_local());
        assert!(!ContentAddress::new("QmSomething").is_local());
    }

    #[test]
    fn test_request_status_discriminants() {
        assert_eq!(RequestStatus::from_byte(0).unwrap(), RequestStatus::Pending);
        assert!(RequestStatus::from_byte(1).unwrap().is_terminal());
        assert!(RequestStatus::from_byte(9).is_err());
    }
}

use bip39::{Language, Mnemonic};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_EXCHANGE_KEY, KDF_CONTEXT_PHRASE_KEY};
use crate::crypto::{derive_conversation_key, SymmetricKey};
use crate::error::IdentityError;
use crate::types::Address;

/// Signing key material for one account.
///
/// The Ed25519 secret is derived deterministically from a BIP-39 recovery
/// phrase, so the same phrase always yields the same address. The account's
/// X25519 exchange key is in turn derived from the Ed25519 secret.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity with no recovery phrase
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Derive the identity bound to a recovery phrase
    pub fn from_phrase(phrase: &str) -> Result<Self, IdentityError> {
        let secret = phrase_secret(phrase)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key_bytes())
    }

    /// Get the raw Ed25519 public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public half of the X25519 exchange key, published in the user record.
    pub fn exchange_public_key(&self) -> [u8; 32] {
        ExchangePublicKey::from(&self.exchange_secret()).to_bytes()
    }

    /// Symmetric key shared with `peer` for direct conversations.
    pub fn conversation_key(&self, peer: &Address, peer_exchange_key: &[u8; 32]) -> SymmetricKey {
        let shared = self
            .exchange_secret()
            .diffie_hellman(&ExchangePublicKey::from(*peer_exchange_key));
        derive_conversation_key(shared.as_bytes(), &self.address(), peer)
    }

    fn exchange_secret(&self) -> StaticSecret {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_EXCHANGE_KEY);
        hasher.update(self.signing_key.as_bytes());
        StaticSecret::from(*hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Generate a fresh 12-word English recovery phrase.
pub fn generate_phrase() -> Result<String, IdentityError> {
    let mut entropy = [0u8; 16];
    OsRng.fill_bytes(&mut entropy);
    Mnemonic::from_entropy_in(Language::English, &entropy)
        .map(|mnemonic| mnemonic.to_string())
        .map_err(|e| IdentityError::InvalidPhrase(e.to_string()))
}

/// Derive the account address for a phrase without keeping any key material.
pub fn address_from_phrase(phrase: &str) -> Result<Address, IdentityError> {
    Identity::from_phrase(phrase).map(|id| id.address())
}

fn phrase_secret(phrase: &str) -> Result<[u8; 32], IdentityError> {
    let normalized = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(IdentityError::InvalidPhrase("empty phrase".into()));
    }

    let mnemonic = Mnemonic::parse_in_normalized(Language::English, &normalized.to_lowercase())
        .map_err(|e| IdentityError::InvalidPhrase(e.to_string()))?;
    let seed = mnemonic.to_seed_normalized("");

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PHRASE_KEY);
    hasher.update(&seed);
    Ok(*hasher.finalize().as_bytes())
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_phrase_is_deterministic() {
        let a = Identity::from_phrase(PHRASE).unwrap();
        let b = Identity::from_phrase(PHRASE).unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(address_from_phrase(PHRASE).unwrap(), a.address());
    }

    #[test]
    fn test_phrase_whitespace_and_case_normalized() {
        let messy = format!("  {}  ", PHRASE.to_uppercase().replace(' ', "   "));
        assert_eq!(
            address_from_phrase(&messy).unwrap(),
            address_from_phrase(PHRASE).unwrap()
        );
    }

    #[test]
    fn test_generated_phrases_do_not_collide() {
        let mut addresses = HashSet::new();
        for _ in 0..32 {
            let phrase = generate_phrase().unwrap();
            assert_eq!(phrase.split(' ').count(), 12);
            assert!(addresses.insert(address_from_phrase(&phrase).unwrap()));
        }
    }

    #[test]
    fn test_invalid_phrase_rejected() {
        assert!(matches!(
            Identity::from_phrase("not a real mnemonic at all"),
            Err(IdentityError::InvalidPhrase(_))
        ));
        assert!(Identity::from_phrase("   ").is_err());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"createUser";
        let signature = id.sign(message);

        assert!(verify_signature(&id.public_key_bytes(), message, &signature).is_ok());
        assert_eq!(
            verify_signature(&id.public_key_bytes(), b"wrong", &signature),
            Err(IdentityError::BadSignature)
        );
    }

    #[test]
    fn test_conversation_key_agreement() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let k1 = alice.conversation_key(&bob.address(), &bob.exchange_public_key());
        let k2 = bob.conversation_key(&alice.address(), &alice.exchange_public_key());
        assert_eq!(k1, k2);
    }
}

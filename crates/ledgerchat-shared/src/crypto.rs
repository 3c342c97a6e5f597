use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{
    KDF_CONTEXT_CONVERSATION_KEY, KDF_CONTEXT_GROUP_KEY, KDF_CONTEXT_PIN_HASH, KDF_CONTEXT_PIN_KEY,
    NONCE_SIZE, PIN_KDF_M_COST, PIN_KDF_P_COST, PIN_KDF_T_COST,
};
use crate::error::CryptoError;
use crate::types::{Address, GroupId};

pub type SymmetricKey = [u8; 32];

/// One-way PIN digest, salted with the owning account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinHash(pub [u8; 32]);

impl PinHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt_with_nonce(key, &generate_nonce(), plaintext)
}

// Same plaintext + nonce under the same key always yields the same bytes,
// and therefore the same content address.
pub fn encrypt_with_nonce(
    key: &SymmetricKey,
    nonce_bytes: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// Pairwise key: X25519 shared secret bound to both addresses (order-independent)
pub fn derive_conversation_key(shared_secret: &[u8; 32], a: &Address, b: &Address) -> SymmetricKey {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CONVERSATION_KEY);
    hasher.update(shared_secret);
    hasher.update(&lo.0);
    hasher.update(&hi.0);
    *hasher.finalize().as_bytes()
}

// Placeholder group scheme: anyone who knows the group id and owner can derive it.
pub fn derive_group_key(group_id: GroupId, owner: &Address) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_GROUP_KEY);
    hasher.update(&group_id.0.to_be_bytes());
    hasher.update(&owner.0);
    *hasher.finalize().as_bytes()
}

/// Published PIN digest: Argon2id over the PIN, salted per account.
pub fn hash_pin(pin: &str, account: &Address) -> Result<PinHash, CryptoError> {
    argon2id(pin.as_bytes(), &pin_salt(KDF_CONTEXT_PIN_HASH, account)).map(PinHash)
}

// Separate salt from hash_pin so the published hash never doubles as the key.
pub fn derive_pin_key(pin: &str, account: &Address) -> Result<SymmetricKey, CryptoError> {
    argon2id(pin.as_bytes(), &pin_salt(KDF_CONTEXT_PIN_KEY, account))
}

fn pin_salt(context: &str, account: &Address) -> [u8; 32] {
    derive_key_from_passphrase(&account.0, context)
}

fn argon2id(password: &[u8], salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let params = argon2::Params::new(PIN_KDF_M_COST, PIN_KDF_T_COST, PIN_KDF_P_COST, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(output)
}

pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(passphrase);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

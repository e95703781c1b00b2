use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

pub type PublicKeyBytes = [u8; PUBLIC_KEY_LEN];
pub type SignatureBytes = [u8; SIGNATURE_LEN];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<SigningKey> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &SigningKey) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.verifying_key().to_bytes()),
        secret_key: hex::encode(keypair.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<SigningKey> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let secret: [u8; 32] = secret_bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::Config("invalid secret key length".into()))?;
    Ok(SigningKey::from_bytes(&secret))
}

pub fn sign_message(keypair: &SigningKey, message: &[u8]) -> SignatureBytes {
    keypair.sign(message).to_bytes()
}

pub fn verify_signature(
    public_key: &PublicKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> ChainResult<()> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

/// Checks a signature without surfacing the reason it failed.
pub fn signature_is_valid(
    public_key: &PublicKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> bool {
    verify_signature(public_key, message, signature).is_ok()
}

pub fn digest(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKeyBytes> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::Config("invalid public key length".into()))
}

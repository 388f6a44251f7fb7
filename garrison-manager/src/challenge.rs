//! Sealed-nonce shutdown challenge.
//!
//! The manager proves nothing to the caller; the caller proves it holds
//! the private half of the keypair whose public half rode in on
//! `READY_SHUTDOWN`. The nonce is sealed to that public key with an
//! ephemeral X25519 exchange, HKDF-SHA256 key derivation and AES-256-GCM;
//! only the private-key holder can recover the plaintext it must echo in
//! `CONFIRM_SHUTDOWN`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const HKDF_INFO: &[u8] = b"garrison shutdown challenge v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("bad key material: {0}")]
    BadKey(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
}

/// Wire form of a sealed challenge: both fields base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedChallenge {
    /// Ephemeral public key of the sealing side.
    pub epk: String,
    /// AEAD nonce followed by the ciphertext.
    pub ciphertext: String,
}

fn decode_key(b64: &str) -> Result<[u8; 32], ChallengeError> {
    let bytes = general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| ChallengeError::BadKey(format!("base64: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ChallengeError::BadKey("key must be 32 bytes".into()))
}

fn derive_key(shared: &[u8]) -> Result<[u8; 32], ChallengeError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut okm)
        .map_err(|e| ChallengeError::Crypto(format!("hkdf: {e}")))?;
    Ok(okm)
}

/// Seal `plaintext` to the holder of `recipient_pubkey_b64`.
pub fn seal(recipient_pubkey_b64: &str, plaintext: &str) -> Result<SealedChallenge, ChallengeError> {
    let recipient = PublicKey::from(decode_key(recipient_pubkey_b64)?);
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let epk = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_key(shared.as_bytes())?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| ChallengeError::Crypto(format!("cipher init: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| ChallengeError::Crypto(format!("encrypt: {e}")))?;

    let mut wire = nonce.to_vec();
    wire.append(&mut sealed);
    Ok(SealedChallenge {
        epk: general_purpose::STANDARD.encode(epk.as_bytes()),
        ciphertext: general_purpose::STANDARD.encode(wire),
    })
}

/// Recover the plaintext with the private half of the keypair.
pub fn open(private_key_b64: &str, sealed: &SealedChallenge) -> Result<String, ChallengeError> {
    let secret = StaticSecret::from(decode_key(private_key_b64)?);
    let epk = PublicKey::from(decode_key(&sealed.epk)?);
    let shared = secret.diffie_hellman(&epk);
    let key = derive_key(shared.as_bytes())?;

    let wire = general_purpose::STANDARD
        .decode(&sealed.ciphertext)
        .map_err(|e| ChallengeError::Crypto(format!("base64: {e}")))?;
    if wire.len() < NONCE_LEN {
        return Err(ChallengeError::Crypto("ciphertext too short".into()));
    }
    let (nonce, body) = wire.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| ChallengeError::Crypto(format!("cipher init: {e}")))?;
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|e| ChallengeError::Crypto(format!("decrypt: {e}")))?;
    String::from_utf8(plain).map_err(|e| ChallengeError::Crypto(format!("utf8: {e}")))
}

/// Fresh X25519 keypair as `(private_b64, public_b64)`; operator tooling
/// generates one per shutdown attempt.
pub fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (
        general_purpose::STANDARD.encode(secret.to_bytes()),
        general_purpose::STANDARD.encode(public.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_opens_with_matching_private_key() {
        let (private_key, public_key) = generate_keypair();
        let sealed = seal(&public_key, "1722470400123").unwrap();
        assert_eq!(open(&private_key, &sealed).unwrap(), "1722470400123");
    }

    #[test]
    fn wrong_private_key_cannot_open() {
        let (_, public_key) = generate_keypair();
        let (other_private, _) = generate_keypair();
        let sealed = seal(&public_key, "nonce").unwrap();
        assert!(open(&other_private, &sealed).is_err());
    }

    #[test]
    fn malformed_pubkey_is_rejected() {
        assert!(matches!(
            seal("not-base64!!", "nonce"),
            Err(ChallengeError::BadKey(_))
        ));
        assert!(matches!(
            seal(&general_purpose::STANDARD.encode([0u8; 16]), "nonce"),
            Err(ChallengeError::BadKey(_))
        ));
    }
}

//! Per-channel symmetric encryption and public-key sealing for key delivery.
//!
//! Two independent primitives, matching the two jobs the protocol needs:
//! - `ChannelKey` + `encrypt`/`decrypt`: AEAD of message bodies with a
//!   32-byte key shared by every member of a channel (ChaCha20-Poly1305).
//! - `seal_for`/`unseal`: anonymous public-key encryption used once per
//!   invite, to hand a `ChannelKey` to a new member without a prior shared
//!   secret (libsodium-style sealed box, ephemeral sender key discarded
//!   after use).

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use crypto_box::PublicKey as BoxPublicKey;
use hmac::Hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

/// Iteration count the reference client defaults to; callers that don't
/// have their own policy can pass this through to `derive_key_from_password`.
pub const DEFAULT_PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed hex input: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, found {found}")]
    BadLength { expected: usize, found: usize },
    #[error("AEAD decryption failed (wrong key or tampered ciphertext)")]
    DecryptFailed,
    #[error("sealed-box open failed (not addressed to this recipient or tampered)")]
    UnsealFailed,
}

/// A 256-bit symmetric key shared by every subscriber of one channel.
#[derive(Clone)]
pub struct ChannelKey(pub [u8; 32]);

impl Drop for ChannelKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl ChannelKey {
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| CryptoError::BadLength { expected: 32, found: v.len() })?;
        Ok(ChannelKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Generate a fresh random channel key. Called once by whoever creates a
/// channel; distributed to invitees via `seal_for`.
pub fn new_channel_key() -> ChannelKey {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    ChannelKey(bytes)
}

/// A symmetrically-encrypted message body, ready to drop into a wire
/// envelope (nonce and ciphertext are both hex, matching every other binary
/// field the protocol transmits).
pub struct Sealed {
    pub nonce_hex: String,
    pub ciphertext_hex: String,
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(key: &ChannelKey, plaintext: &[u8]) -> Sealed {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("chacha20poly1305 encryption does not fail for plain byte slices");
    Sealed {
        nonce_hex: hex::encode(nonce),
        ciphertext_hex: hex::encode(ciphertext),
    }
}

/// Decrypt a body produced by `encrypt`. Returns `DecryptFailed` for any
/// tampering, wrong key, or malformed nonce/ciphertext — callers should
/// treat all of these identically (drop the message, do not distinguish).
pub fn decrypt(key: &ChannelKey, nonce_hex: &str, ciphertext_hex: &str) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = hex::decode(nonce_hex)?;
    if nonce_bytes.len() != 12 {
        return Err(CryptoError::BadLength { expected: 12, found: nonce_bytes.len() });
    }
    let ciphertext = hex::decode(ciphertext_hex)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Encrypt `plaintext` (in practice, a hex-encoded `ChannelKey`) so that only
/// the holder of the X25519 secret key matching `recipient_public_hex` can
/// read it. The sender needs no prior relationship with the recipient and no
/// secret of their own — the ephemeral sender keypair is generated and
/// discarded inside `crypto_box::seal`.
pub fn seal_for(recipient_public_hex: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
    let pub_bytes = hex::decode(recipient_public_hex)?;
    let pub_arr: [u8; 32] = pub_bytes
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::BadLength { expected: 32, found: v.len() })?;
    let recipient = BoxPublicKey::from(pub_arr);

    let ciphertext =
        crypto_box::seal(&mut OsRng, &recipient, plaintext).map_err(|_| CryptoError::UnsealFailed)?;
    Ok(hex::encode(ciphertext))
}

/// Inverse of `seal_for`. `secret_key_bytes` is the recipient's raw 32-byte
/// X25519 secret key (the same bytes backing `Identity::encryption_secret`).
pub fn unseal(secret_key_bytes: &[u8; 32], ciphertext_hex: &str) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = hex::decode(ciphertext_hex)?;
    let secret = crypto_box::SecretKey::from(*secret_key_bytes);
    secret.unseal(&ciphertext).map_err(|_| CryptoError::UnsealFailed)
}

/// Derive a channel key from a human-chosen passphrase (used for
/// password-protected public channels). PBKDF2-HMAC-SHA256; `iterations`
/// is caller-controlled, defaulting to `DEFAULT_PBKDF2_ROUNDS` to match the
/// reference client.
pub fn derive_key_from_password(password: &str, salt: &[u8], iterations: u32) -> ChannelKey {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut out)
        .expect("32-byte output is within PBKDF2-HMAC-SHA256's output size limit");
    ChannelKey(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = new_channel_key();
        let sealed = encrypt(&key, b"hello channel");
        let plain = decrypt(&key, &sealed.nonce_hex, &sealed.ciphertext_hex).unwrap();
        assert_eq!(plain, b"hello channel");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key_a = new_channel_key();
        let key_b = new_channel_key();
        let sealed = encrypt(&key_a, b"hello channel");
        assert!(decrypt(&key_b, &sealed.nonce_hex, &sealed.ciphertext_hex).is_err());
    }

    #[test]
    fn decrypt_tampered_ciphertext_fails() {
        let key = new_channel_key();
        let sealed = encrypt(&key, b"hello channel");
        let mut bytes = hex::decode(&sealed.ciphertext_hex).unwrap();
        bytes[0] ^= 0xff;
        assert!(decrypt(&key, &sealed.nonce_hex, &hex::encode(bytes)).is_err());
    }

    #[test]
    fn seal_unseal_round_trip() {
        let secret = crypto_box::SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        let ciphertext_hex = seal_for(&hex::encode(public.as_bytes()), b"channel key bytes").unwrap();
        let secret_bytes: [u8; 32] = secret.to_bytes();
        let opened = unseal(&secret_bytes, &ciphertext_hex).unwrap();
        assert_eq!(opened, b"channel key bytes");
    }

    #[test]
    fn seal_for_wrong_recipient_fails() {
        let secret_a = crypto_box::SecretKey::generate(&mut OsRng);
        let secret_b = crypto_box::SecretKey::generate(&mut OsRng);
        let public_a = secret_a.public_key();
        let ciphertext_hex = seal_for(&hex::encode(public_a.as_bytes()), b"secret").unwrap();
        let secret_b_bytes: [u8; 32] = secret_b.to_bytes();
        assert!(unseal(&secret_b_bytes, &ciphertext_hex).is_err());
    }

    #[test]
    fn password_derivation_is_deterministic() {
        let salt = b"fixed-salt-for-test";
        // A small iteration count keeps this test fast; determinism and
        // cross-password divergence don't depend on the round count.
        let rounds = 8;
        let a = derive_key_from_password("correct horse battery staple", salt, rounds);
        let b = derive_key_from_password("correct horse battery staple", salt, rounds);
        assert_eq!(a.to_hex(), b.to_hex());

        let c = derive_key_from_password("different password", salt, rounds);
        assert_ne!(a.to_hex(), c.to_hex());
    }

    #[test]
    fn password_derivation_honors_iteration_count() {
        let salt = b"fixed-salt-for-test";
        let few = derive_key_from_password("correct horse battery staple", salt, 1);
        let many = derive_key_from_password("correct horse battery staple", salt, DEFAULT_PBKDF2_ROUNDS);
        assert_ne!(few.to_hex(), many.to_hex());
    }
}

//! Node identity: a long-term Ed25519 signing keypair (whose public half is
//! the node's global identifier) plus a co-generated X25519 encryption
//! keypair used only for sealed-box channel-key delivery (see `crypto`).
//!
//! The two keypairs are generated independently at identity-creation time
//! rather than one being derived from the other — see `SPEC_FULL.md` §3 for
//! why that choice was made over deterministic derivation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret as XSecret};
use zeroize::Zeroize;

const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("profile file is corrupted: {0}")]
    CorruptProfile(String),
    #[error("profile {0} is missing required fields")]
    MissingFields(PathBuf),
    #[error("unsupported profile version {0:?} (expected {FORMAT_VERSION:?})")]
    UnsupportedVersion(String),
    #[error("refusing to load {path}: permissions {mode:o} are too permissive (expected 0600)")]
    PermissionsTooOpen { path: PathBuf, mode: u32 },
    #[error("invalid key bytes in profile: {0}")]
    InvalidKeyBytes(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// On-disk profile shape (§6.1). `signing_key_hex` and
/// `encryption_secret_key_hex` are secret material; the file is created with
/// mode 0600 and refused on load if looser permissions are observed.
#[derive(Debug, Serialize, Deserialize)]
struct ProfileFile {
    version: String,
    username: String,
    signing_key_hex: String,
    verify_key_hex: String,
    encryption_secret_key_hex: String,
    encryption_public_key_hex: String,
}

/// A node's cryptographic identity: loaded once at startup, never mutated.
pub struct Identity {
    pub username: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    encryption_secret: XSecret,
    encryption_public: XPublicKey,
}

impl Drop for Identity {
    fn drop(&mut self) {
        // SigningKey and StaticSecret already zeroize their own bytes on
        // drop; this is a reminder for anyone adding a field later.
    }
}

impl Identity {
    /// Load an existing profile from `profile_path`, or create and persist a
    /// brand-new one if the file does not exist.
    pub fn load_or_create(profile_path: impl AsRef<Path>, username: &str) -> Result<Self, IdentityError> {
        let path = profile_path.as_ref();
        if path.exists() {
            tracing::info!(path = %path.display(), "loading identity profile");
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), username, "creating new identity profile");
            Self::create_and_save(path, username)
        }
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        check_permissions(path)?;

        let raw = fs::read_to_string(path)?;
        let profile: ProfileFile = serde_json::from_str(&raw)
            .map_err(|e| IdentityError::CorruptProfile(e.to_string()))?;

        if profile.version != FORMAT_VERSION {
            return Err(IdentityError::UnsupportedVersion(profile.version));
        }

        let mut signing_bytes = decode_32(&profile.signing_key_hex)?;
        let signing_key = SigningKey::from_bytes(&signing_bytes);
        scrub(&mut signing_bytes);
        let verifying_key = signing_key.verifying_key();

        // The stored verify_key_hex must match the key derived from the
        // signing key; a mismatch means the file was hand-edited or corrupt.
        if hex::encode(verifying_key.as_bytes()) != profile.verify_key_hex {
            return Err(IdentityError::CorruptProfile(
                "verify_key_hex does not match signing_key_hex".into(),
            ));
        }

        let mut enc_secret_bytes = decode_32(&profile.encryption_secret_key_hex)?;
        let encryption_secret = XSecret::from(enc_secret_bytes);
        scrub(&mut enc_secret_bytes);
        let encryption_public = XPublicKey::from(&encryption_secret);

        if hex::encode(encryption_public.as_bytes()) != profile.encryption_public_key_hex {
            return Err(IdentityError::CorruptProfile(
                "encryption_public_key_hex does not match encryption_secret_key_hex".into(),
            ));
        }

        Ok(Identity {
            username: profile.username,
            signing_key,
            verifying_key,
            encryption_secret,
            encryption_public,
        })
    }

    fn create_and_save(path: &Path, username: &str) -> Result<Self, IdentityError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let encryption_secret = XSecret::random_from_rng(OsRng);
        let encryption_public = XPublicKey::from(&encryption_secret);

        let mut signing_key_bytes = signing_key.to_bytes();
        let mut encryption_secret_bytes = encryption_secret.to_bytes();
        let profile = ProfileFile {
            version: FORMAT_VERSION.to_string(),
            username: username.to_string(),
            signing_key_hex: hex::encode(signing_key_bytes),
            verify_key_hex: hex::encode(verifying_key.as_bytes()),
            encryption_secret_key_hex: hex::encode(encryption_secret_bytes),
            encryption_public_key_hex: hex::encode(encryption_public.as_bytes()),
        };
        scrub(&mut signing_key_bytes);
        scrub(&mut encryption_secret_bytes);

        write_profile_atomically(path, &profile)?;

        Ok(Identity {
            username: username.to_string(),
            signing_key,
            verifying_key,
            encryption_secret,
            encryption_public,
        })
    }

    /// Sign raw bytes with the node's Ed25519 key.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    /// Verify a signature against a hex-encoded 32-byte public key. Never
    /// panics; malformed input is simply not a valid signature.
    pub fn verify(message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
        let Ok(sig_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);

        let Ok(key_bytes) = hex::decode(public_key_hex) else {
            return false;
        };
        let Ok(key_bytes): Result<[u8; 32], _> = key_bytes.try_into() else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };

        verifying_key.verify(message, &signature).is_ok()
    }

    /// This node's global identifier: hex-encoded Ed25519 public key.
    pub fn public_id(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Hex-encoded X25519 public key, advertised so other nodes can target
    /// this node with `CryptoBox::seal` during an invite.
    pub fn encryption_public_id(&self) -> String {
        hex::encode(self.encryption_public.as_bytes())
    }

    pub(crate) fn encryption_secret(&self) -> &XSecret {
        &self.encryption_secret
    }
}

fn decode_32(hex_str: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(hex_str).map_err(|e| IdentityError::InvalidKeyBytes(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyBytes("expected 32 bytes".into()))
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), IdentityError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(IdentityError::PermissionsTooOpen {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), IdentityError> {
    Ok(())
}

fn write_profile_atomically(path: &Path, profile: &ProfileFile) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(profile)?;
    fs::write(&tmp_path, json)?;
    set_owner_only(&tmp_path)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), IdentityError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), IdentityError> {
    Ok(())
}

/// Clears a raw key buffer. Kept for callers that extract bytes outside the
/// zeroizing wrapper types above (e.g. intermediate hex buffers).
pub(crate) fn scrub(bytes: &mut [u8]) {
    bytes.zeroize();
}

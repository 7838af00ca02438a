//! Master secret backup and at-rest storage.
//!
//! The secret is shown to the user as a 24-word BIP-39 phrase and kept on
//! disk encrypted under a passphrase (Argon2id + ChaCha20-Poly1305).

use crate::cipher::KEY_BYTES;
use crate::keys::MasterSecret;
use anyhow::{Context, Result, bail};
use bip39::Mnemonic;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const FORMAT_VERSION: u32 = 1;

/// On-disk format for a passphrase-protected master secret.
#[derive(Serialize, Deserialize)]
struct StoredSecret {
    /// Argon2id salt (hex).
    salt: String,
    /// ChaCha20-Poly1305 nonce (hex).
    nonce: String,
    /// Encrypted secret (hex).
    ciphertext: String,
    version: u32,
}

/// Derive a 32-byte wrapping key from a passphrase + salt using Argon2id.
pub fn derive_key_from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    use argon2::Argon2;

    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| anyhow::anyhow!("argon2 key derivation failed: {e}"))?;
    Ok(key)
}

/// Encrypt the master secret under `passphrase` and write it to `path` (mode 0600).
pub fn save_encrypted_secret(path: &Path, passphrase: &str, secret: &MasterSecret) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create secret directory {}", parent.display()))?;
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let wrapping_key = derive_key_from_passphrase(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&wrapping_key[..])
        .context("invalid wrapping key length")?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_bytes().as_slice())
        .map_err(|_| anyhow::anyhow!("failed to encrypt secret"))?;

    let stored = StoredSecret {
        salt: hex::encode(salt),
        nonce: hex::encode(nonce_bytes),
        ciphertext: hex::encode(ciphertext),
        version: FORMAT_VERSION,
    };
    let json = serde_json::to_string_pretty(&stored)?;
    fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    tracing::debug!(path = %path.display(), "stored encrypted master secret");
    Ok(())
}

/// Load and decrypt a stored master secret.
pub fn load_encrypted_secret(path: &Path, passphrase: &str) -> Result<MasterSecret> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read secret {}", path.display()))?;
    let stored: StoredSecret = serde_json::from_str(&json).context("invalid secret file format")?;

    if stored.version != FORMAT_VERSION {
        bail!("unsupported secret file version: {}", stored.version);
    }

    let salt = hex::decode(&stored.salt).context("invalid salt hex")?;
    let nonce_bytes = hex::decode(&stored.nonce).context("invalid nonce hex")?;
    let ciphertext = hex::decode(&stored.ciphertext).context("invalid ciphertext hex")?;
    if nonce_bytes.len() != NONCE_LEN {
        bail!("invalid nonce length");
    }

    let wrapping_key = derive_key_from_passphrase(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&wrapping_key[..])
        .context("invalid wrapping key length")?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| anyhow::anyhow!("failed to decrypt secret (wrong passphrase?)"))?,
    );

    let bytes: [u8; KEY_BYTES] = plaintext.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "stored secret has invalid length: expected {KEY_BYTES} bytes, got {}",
            plaintext.len()
        )
    })?;
    Ok(MasterSecret::from_bytes(bytes))
}

pub fn has_stored_secret(path: &Path) -> bool {
    path.exists()
}

/// Render the master secret as a 24-word BIP-39 backup phrase.
pub fn secret_to_mnemonic(secret: &MasterSecret) -> Result<String> {
    let mnemonic = Mnemonic::from_entropy(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to create mnemonic: {e}"))?;
    Ok(mnemonic.to_string())
}

/// Parse a backup phrase typed by a human: case, extra whitespace and
/// dash separators are tolerated.
pub fn mnemonic_to_secret(phrase: &str) -> Result<MasterSecret> {
    let normalized = phrase
        .to_lowercase()
        .replace('-', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mnemonic: Mnemonic = normalized
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid backup phrase: {e}"))?;
    let entropy = Zeroizing::new(mnemonic.to_entropy());
    let bytes: [u8; KEY_BYTES] = entropy.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "backup phrase encodes {} bytes, expected {KEY_BYTES}",
            entropy.len()
        )
    })?;
    Ok(MasterSecret::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        let secret = MasterSecret::generate();

        save_encrypted_secret(&path, "pass-123", &secret).unwrap();
        let loaded = load_encrypted_secret(&path, "pass-123").unwrap();
        assert_eq!(loaded.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        save_encrypted_secret(&path, "right", &MasterSecret::generate()).unwrap();

        let err = load_encrypted_secret(&path, "wrong").unwrap_err();
        assert!(err.to_string().contains("wrong passphrase"));
    }

    #[test]
    fn stored_file_is_versioned_json_without_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        let secret = MasterSecret::generate();
        save_encrypted_secret(&path, "pass", &secret).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["version"].as_u64(), Some(1));
        assert!(!raw.contains(&secret.to_base64()));
        assert!(!raw.contains(&hex::encode(secret.as_bytes())));
    }

    #[cfg(unix)]
    #[test]
    fn stored_file_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.json");
        save_encrypted_secret(&path, "pass", &MasterSecret::generate()).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert!(has_stored_secret(&path));
    }

    #[test]
    fn mnemonic_round_trip() {
        let secret = MasterSecret::generate();
        let phrase = secret_to_mnemonic(&secret).unwrap();
        assert_eq!(phrase.split_whitespace().count(), 24);
        let restored = mnemonic_to_secret(&phrase).unwrap();
        assert_eq!(restored.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn mnemonic_tolerates_sloppy_input() {
        let secret = MasterSecret::from_bytes([0x42; 32]);
        let phrase = secret_to_mnemonic(&secret).unwrap();
        let sloppy = format!("  {}  ", phrase.to_uppercase().replace(' ', " - "));
        let restored = mnemonic_to_secret(&sloppy).unwrap();
        assert_eq!(restored.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn mnemonic_rejects_short_phrase() {
        let short = Mnemonic::from_entropy(&[0x11u8; 16]).unwrap();
        assert!(mnemonic_to_secret(&short.to_string()).is_err());
        assert!(mnemonic_to_secret("definitely not a phrase").is_err());
    }
}

use crate::cipher::{KEY_BYTES, SealedBoxCipher, SecretBoxCipher};
use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Salt shared by every sub-key derived from the master secret.
const MASTER_SALT: &[u8] = b"tether-master-v1";

/// Context labels for sub-keys. Each label yields an independent key.
pub mod labels {
    /// Seed for the long-term content keypair (sealed boxes).
    pub const CONTENT_KEYPAIR: &str = "content-keypair";
    /// Secretbox key for entities created without a data-encryption-key.
    pub const LEGACY_SECRETBOX: &str = "legacy-secretbox";
    /// Anonymous analytics identifier.
    pub const ANALYTICS_ID: &str = "analytics-id";
}

/// HKDF-SHA256 with explicit salt and context label.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_BYTES]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_BYTES];
    hk.expand(info, &mut okm)
        .map_err(|e| anyhow!("key derivation failed: {e}"))?;
    Ok(okm)
}

/// Generate cryptographically random key material.
pub fn random_key_material() -> [u8; KEY_BYTES] {
    let mut out = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut out);
    out
}

/// The account's 32-byte master secret. Every other key is derived from it.
#[derive(Clone)]
pub struct MasterSecret(Zeroizing<[u8; KEY_BYTES]>);

impl MasterSecret {
    pub fn generate() -> Self {
        Self(Zeroizing::new(random_key_material()))
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a base64 secret. Accepts both the standard and URL-safe alphabets.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
            .context("secret is not valid base64")?;
        if bytes.len() != KEY_BYTES {
            bail!("secret must be {KEY_BYTES} bytes, got {}", bytes.len());
        }
        let mut out = [0u8; KEY_BYTES];
        out.copy_from_slice(&bytes);
        Ok(Self::from_bytes(out))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0[..])
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// Derive a sub-key for `label`. Deterministic: the same label always
    /// yields the same key, and distinct labels yield unrelated keys.
    pub fn derive(&self, label: &str) -> Result<Zeroizing<[u8; KEY_BYTES]>> {
        derive_key(&self.0[..], MASTER_SALT, label.as_bytes()).map(Zeroizing::new)
    }

    /// Long-term content keypair, able to open sealed boxes addressed to it.
    pub fn content_keypair(&self) -> Result<SealedBoxCipher> {
        let seed = self.derive(labels::CONTENT_KEYPAIR)?;
        SealedBoxCipher::from_seed(&seed)
    }

    /// Secretbox keyed directly by a derived sub-key.
    pub fn legacy_cipher(&self) -> Result<SecretBoxCipher> {
        let key = self.derive(labels::LEGACY_SECRETBOX)?;
        Ok(SecretBoxCipher::new(*key))
    }

    /// Stable anonymous identifier that reveals nothing about the secret.
    pub fn anonymous_id(&self) -> Result<String> {
        let key = self.derive(labels::ANALYTICS_ID)?;
        Ok(hex::encode(&key[..16]))
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::Cipher;

    #[test]
    fn derive_is_idempotent() {
        let secret = MasterSecret::from_bytes([7u8; 32]);
        let a = secret.derive("content").unwrap();
        let b = secret.derive("content").unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn labels_are_domain_separated() {
        let secret = MasterSecret::generate();
        let a = secret.derive(labels::CONTENT_KEYPAIR).unwrap();
        let b = secret.derive(labels::LEGACY_SECRETBOX).unwrap();
        let c = secret.derive(labels::ANALYTICS_ID).unwrap();
        assert_ne!(*a, *b);
        assert_ne!(*b, *c);
        assert_ne!(*a, *secret.as_bytes());
    }

    #[test]
    fn anonymous_id_is_stable_hex() {
        let secret = MasterSecret::from_bytes([1u8; 32]);
        let id = secret.anonymous_id().unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(id, secret.anonymous_id().unwrap());
        assert_ne!(id, MasterSecret::from_bytes([2u8; 32]).anonymous_id().unwrap());
    }

    #[test]
    fn base64_round_trip_accepts_url_safe() {
        let secret = MasterSecret::generate();
        let standard = secret.to_base64();
        assert_eq!(
            MasterSecret::from_base64(&standard).unwrap().as_bytes(),
            secret.as_bytes()
        );
        let url_safe = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret.as_bytes());
        assert_eq!(
            MasterSecret::from_base64(&url_safe).unwrap().as_bytes(),
            secret.as_bytes()
        );
    }

    #[test]
    fn from_base64_rejects_wrong_length() {
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(MasterSecret::from_base64(&short).is_err());
    }

    #[test]
    fn content_keypair_is_deterministic() {
        let secret = MasterSecret::from_bytes([9u8; 32]);
        let a = secret.content_keypair().unwrap();
        let b = secret.content_keypair().unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());

        let sealed = a.encrypt_one(b"dek").unwrap();
        assert_eq!(b.decrypt_one(&sealed).as_deref(), Some(&b"dek"[..]));
    }

    #[test]
    fn debug_does_not_leak() {
        let secret = MasterSecret::from_bytes([0xAB; 32]);
        assert_eq!(format!("{secret:?}"), "MasterSecret(..)");
    }
}

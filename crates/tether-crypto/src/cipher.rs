//! Authenticated encryption strategies over opaque byte buffers.
//!
//! Every strategy implements [`Cipher`]: batches in, batches out, same order,
//! one-to-one. Decryption never fails loudly; a buffer that cannot be opened
//! (wrong key, truncated, tampered) yields `None` in its slot.

use crate::keys::derive_key;
use aes_gcm::Aes256Gcm;
use anyhow::{Context, Result, anyhow};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use k256::ecdh::diffie_hellman;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

pub const KEY_BYTES: usize = 32;
pub const XNONCE_BYTES: usize = 24;
pub const GCM_NONCE_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;
/// SEC1 compressed secp256k1 point.
pub const PUBLIC_KEY_BYTES: usize = 33;
/// Leading byte of every AES-GCM payload. Bump to migrate algorithms.
pub const AES_GCM_VERSION: u8 = 0;

const SEALED_BOX_LABEL: &[u8] = b"tether-sealed-box-v1";
const KEYPAIR_LABEL: &[u8] = b"tether-keypair-v1";

/// Batch encrypt/decrypt capability shared by all strategies.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintexts: &[&[u8]]) -> Result<Vec<Vec<u8>>>;

    fn decrypt(&self, ciphertexts: &[&[u8]]) -> Vec<Option<Vec<u8>>>;

    fn encrypt_one(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(&[plaintext])?
            .pop()
            .ok_or_else(|| anyhow!("cipher returned an empty batch"))
    }

    fn decrypt_one(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        self.decrypt(&[ciphertext]).pop().flatten()
    }
}

fn random_nonce<const N: usize>() -> [u8; N] {
    let mut nonce = [0u8; N];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn xchacha_seal(key: &[u8; KEY_BYTES], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; XNONCE_BYTES])> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = random_nonce::<XNONCE_BYTES>();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow!("encryption failed"))?;
    Ok((ciphertext, nonce))
}

fn xchacha_open(key: &[u8; KEY_BYTES], nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()
}

// ---------------------------------------------------------------------------
// Secretbox
// ---------------------------------------------------------------------------

/// Single shared key, XChaCha20-Poly1305. Output: `nonce ‖ ciphertext`.
pub struct SecretBoxCipher {
    key: Zeroizing<[u8; KEY_BYTES]>,
}

impl SecretBoxCipher {
    pub fn new(key: [u8; KEY_BYTES]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    fn open(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < XNONCE_BYTES + TAG_BYTES {
            return None;
        }
        let (nonce, ciphertext) = data.split_at(XNONCE_BYTES);
        xchacha_open(&self.key, nonce, ciphertext)
    }
}

impl Cipher for SecretBoxCipher {
    fn encrypt(&self, plaintexts: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        plaintexts
            .iter()
            .map(|plaintext| {
                let (ciphertext, nonce) = xchacha_seal(&self.key, plaintext)?;
                let mut out = Vec::with_capacity(XNONCE_BYTES + ciphertext.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            })
            .collect()
    }

    fn decrypt(&self, ciphertexts: &[&[u8]]) -> Vec<Option<Vec<u8>>> {
        ciphertexts.iter().map(|data| self.open(data)).collect()
    }
}

// ---------------------------------------------------------------------------
// Sealed box (ephemeral sender key)
// ---------------------------------------------------------------------------

/// Asymmetric box addressed to a long-term secp256k1 keypair.
///
/// Every encryption uses a fresh ephemeral keypair, so the output carries no
/// sender identity: `ephemeral_public_key ‖ nonce ‖ ciphertext`.
/// Instances built with [`SealedBoxCipher::for_recipient`] can only encrypt.
pub struct SealedBoxCipher {
    recipient: PublicKey,
    secret: Option<SecretKey>,
}

impl SealedBoxCipher {
    /// Derive the recipient keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; KEY_BYTES]) -> Result<Self> {
        let scalar = derive_key(seed, KEYPAIR_LABEL, b"secret-scalar")?;
        let secret =
            SecretKey::from_slice(&scalar).context("derived seed is not a valid secp256k1 scalar")?;
        Ok(Self {
            recipient: secret.public_key(),
            secret: Some(secret),
        })
    }

    pub fn for_recipient(public_key: &[u8]) -> Result<Self> {
        let recipient =
            PublicKey::from_sec1_bytes(public_key).context("invalid recipient public key")?;
        Ok(Self {
            recipient,
            secret: None,
        })
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.recipient.to_encoded_point(true).as_bytes().to_vec()
    }

    fn box_key(shared: &[u8], ephemeral_public: &[u8]) -> Result<[u8; KEY_BYTES]> {
        derive_key(shared, ephemeral_public, SEALED_BOX_LABEL)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral = SecretKey::random(&mut OsRng);
        let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
        let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), self.recipient.as_affine());
        let key = Zeroizing::new(Self::box_key(
            shared.raw_secret_bytes().as_slice(),
            ephemeral_public.as_bytes(),
        )?);
        let (ciphertext, nonce) = xchacha_seal(&key, plaintext)?;

        let mut out = Vec::with_capacity(PUBLIC_KEY_BYTES + XNONCE_BYTES + ciphertext.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, data: &[u8]) -> Option<Vec<u8>> {
        let secret = self.secret.as_ref()?;
        if data.len() < PUBLIC_KEY_BYTES + XNONCE_BYTES + TAG_BYTES {
            return None;
        }
        let (ephemeral_bytes, rest) = data.split_at(PUBLIC_KEY_BYTES);
        let (nonce, ciphertext) = rest.split_at(XNONCE_BYTES);
        let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes).ok()?;
        let shared = diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
        let key = Zeroizing::new(
            Self::box_key(shared.raw_secret_bytes().as_slice(), ephemeral_bytes).ok()?,
        );
        xchacha_open(&key, nonce, ciphertext)
    }
}

impl Cipher for SealedBoxCipher {
    fn encrypt(&self, plaintexts: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        plaintexts.iter().map(|plaintext| self.seal(plaintext)).collect()
    }

    fn decrypt(&self, ciphertexts: &[&[u8]]) -> Vec<Option<Vec<u8>>> {
        ciphertexts.iter().map(|data| self.open(data)).collect()
    }
}

// ---------------------------------------------------------------------------
// AES-GCM (envelope-encrypted data keys)
// ---------------------------------------------------------------------------

/// AES-256-GCM under a data-encryption-key. Output: `version ‖ nonce ‖ ciphertext`.
pub struct AesGcmCipher {
    key: Zeroizing<[u8; KEY_BYTES]>,
}

impl AesGcmCipher {
    pub fn new(key: [u8; KEY_BYTES]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_BYTES] = key
            .try_into()
            .map_err(|_| anyhow!("data key must be {KEY_BYTES} bytes, got {}", key.len()))?;
        Ok(Self::new(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key[..]))
    }

    fn open(&self, data: &[u8]) -> Option<Vec<u8>> {
        let (&version, rest) = data.split_first()?;
        if version != AES_GCM_VERSION || rest.len() < GCM_NONCE_BYTES + TAG_BYTES {
            return None;
        }
        let (nonce, ciphertext) = rest.split_at(GCM_NONCE_BYTES);
        self.cipher()
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .ok()
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintexts: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        let cipher = self.cipher();
        plaintexts
            .iter()
            .map(|plaintext| {
                let nonce = random_nonce::<GCM_NONCE_BYTES>();
                let ciphertext = cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), *plaintext)
                    .map_err(|_| anyhow!("encryption failed"))?;
                let mut out = Vec::with_capacity(1 + GCM_NONCE_BYTES + ciphertext.len());
                out.push(AES_GCM_VERSION);
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            })
            .collect()
    }

    fn decrypt(&self, ciphertexts: &[&[u8]]) -> Vec<Option<Vec<u8>>> {
        ciphertexts.iter().map(|data| self.open(data)).collect()
    }
}

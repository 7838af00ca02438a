pub mod cipher;
pub mod keys;
pub mod recovery;

pub use cipher::{AesGcmCipher, Cipher, SealedBoxCipher, SecretBoxCipher};
pub use keys::MasterSecret;

//! Payload ciphers. Message content travels hex encoded; with a cluster key
//! it is sealed with ChaCha20-Poly1305 first.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::Rng;

use crate::error::{Result, StarlingError};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String>;
    fn decrypt(&self, content: &str) -> Result<Vec<u8>>;
}

/// Authenticated encryption with a key shared by the whole cluster.
///
/// Wire form is `hex(nonce || ciphertext || tag)`.
pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn from_hex(key: &str) -> Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(key.trim(), &mut bytes).map_err(|e| {
            StarlingError::Config(format!(
                "Cluster key must be {} hex encoded bytes: {}",
                KEY_SIZE, e
            ))
        })?;
        Ok(Self::new(&bytes))
    }
}

impl Cipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StarlingError::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    fn decrypt(&self, content: &str) -> Result<Vec<u8>> {
        let bytes = hex::decode(content)
            .map_err(|e| StarlingError::Crypto(format!("content is not hex: {}", e)))?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StarlingError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = bytes.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StarlingError::Crypto("authentication failed".to_string()))
    }
}

/// Hex only. Used when the cluster runs without a key.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainCodec;

impl Cipher for PlainCodec {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        Ok(hex::encode(plaintext))
    }

    fn decrypt(&self, content: &str) -> Result<Vec<u8>> {
        hex::decode(content)
            .map_err(|e| StarlingError::Crypto(format!("content is not hex: {}", e)))
    }
}

//! AES-128-CBC with PKCS#7 padding.
//!
//! Shared by the KLAP session (where the IV changes per request) and the AES
//! passthrough session (one key and IV for the whole session).

use aes::Aes128;
use base64::{Engine, engine::general_purpose::STANDARD};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::error::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Encrypts `plaintext` with AES-128-CBC and PKCS#7 padding.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts AES-128-CBC ciphertext and strips PKCS#7 padding.
///
/// Bad padding or a length that is not a multiple of the block size is an
/// [`Error::Integrity`].
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Integrity("AES padding check failed".into()))
}

/// Session cipher for the AES passthrough transport.
#[derive(Clone)]
pub struct AesCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl AesCipher {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Builds the cipher from the 32 bytes returned by the key exchange
    /// (`key ‖ iv`).
    pub fn from_key_material(material: &[u8]) -> Result<Self, Error> {
        if material.len() != 32 {
            return Err(Error::Protocol(format!(
                "AES key material has length {} (expected 32)",
                material.len()
            )));
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&material[..16]);
        iv.copy_from_slice(&material[16..]);
        Ok(Self { key, iv })
    }

    /// Encrypts and base64-encodes a payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        STANDARD.encode(cbc_encrypt(&self.key, &self.iv, plaintext))
    }

    /// Decodes and decrypts a base64 payload.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, Error> {
        let ciphertext = b64_decode(encoded)?;
        cbc_decrypt(&self.key, &self.iv, &ciphertext)
    }
}

impl std::fmt::Debug for AesCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesCipher([REDACTED])")
    }
}

pub fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn b64_decode(data: &str) -> Result<Vec<u8>, Error> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| Error::Protocol(format!("base64 decode failed: {e}")))
}

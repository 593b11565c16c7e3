//! RSA key pairs for the AES key exchange and encrypted discovery.

use rsa::{
    Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    rand_core::OsRng,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Key size used for the AES transport handshake.
pub const HANDSHAKE_KEY_BITS: usize = 1024;

/// Key size used for encrypted discovery.
pub const DISCOVERY_KEY_BITS: usize = 2048;

/// PEM encoded key pair, as stored in `DeviceConfig.aes_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairPem {
    pub private: String,
    pub public: String,
}

/// An RSA key pair with its public half pre-encoded as PEM.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public_pem: String,
}

impl KeyPair {
    /// Generates a new key pair. This is CPU bound; async callers should run it
    /// on a blocking task.
    pub fn generate(bits: usize) -> Result<Self, Error> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::Protocol(format!("RSA key generation failed: {e}")))?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, Error> {
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Protocol(format!("PEM encoding failed: {e}")))?;
        Ok(Self {
            private,
            public_pem,
        })
    }

    /// Restores a key pair from its PEM form.
    pub fn from_pem(pem: &KeyPairPem) -> Result<Self, Error> {
        let private = RsaPrivateKey::from_pkcs8_pem(&pem.private)
            .map_err(|e| Error::Config(format!("invalid RSA private key: {e}")))?;
        Self::from_private(private)
    }

    pub fn to_pem(&self) -> Result<KeyPairPem, Error> {
        let private = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Protocol(format!("PEM encoding failed: {e}")))?;
        Ok(KeyPairPem {
            private: private.to_string(),
            public: self.public_pem.clone(),
        })
    }

    /// SubjectPublicKeyInfo PEM of the public key.
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Decrypts the PKCS#1 v1.5 key material returned by the AES handshake.
    pub fn decrypt_handshake(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| Error::Protocol(format!("handshake key decryption failed: {e}")))
    }

    /// Decrypts the OAEP/SHA-1 key carried by an encrypted discovery reply.
    pub fn decrypt_discovery(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.private
            .decrypt(Oaep::new::<sha1::Sha1>(), ciphertext)
            .map_err(|e| Error::Protocol(format!("discovery key decryption failed: {e}")))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

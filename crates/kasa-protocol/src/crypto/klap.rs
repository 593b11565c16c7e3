//! KLAP hashing and session key schedule.
//!
//! Both protocol versions share the session derivation; they differ in how the
//! credentials are hashed and in the handshake proofs:
//!
//! | | auth hash | handshake1 proof | handshake2 payload |
//! |---|---|---|---|
//! | V1 | `md5(md5(u) ‖ md5(p))` | `sha256(local ‖ auth)` | `sha256(remote ‖ auth)` |
//! | V2 | `sha256(sha1(u) ‖ sha1(p))` | `sha256(local ‖ remote ‖ auth)` | `sha256(remote ‖ local ‖ auth)` |

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{
    Credentials,
    credentials::DefaultCredentials,
    crypto::aes::{cbc_decrypt, cbc_encrypt},
    error::Error,
};

/// Length of the signature prefix on every request and response body.
pub const SIGNATURE_LEN: usize = 32;

/// KLAP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KlapVersion {
    /// MD5 credential hash, used by IOT devices with older firmware.
    V1,
    /// SHA-based credential hash, used by SMART devices.
    V2,
}

impl KlapVersion {
    /// Hashes credentials into the shared handshake secret.
    pub fn auth_hash(self, credentials: &Credentials) -> Vec<u8> {
        match self {
            KlapVersion::V1 => generate_auth_hash(credentials).to_vec(),
            KlapVersion::V2 => generate_auth_hash_v2(credentials).to_vec(),
        }
    }

    /// The proof the device returns from handshake1.
    pub fn handshake1_proof(
        self,
        local_seed: &[u8; 16],
        remote_seed: &[u8; 16],
        auth_hash: &[u8],
    ) -> [u8; 32] {
        match self {
            KlapVersion::V1 => handshake1_seed_auth_hash(local_seed, auth_hash),
            KlapVersion::V2 => handshake1_seed_auth_hash_v2(local_seed, remote_seed, auth_hash),
        }
    }

    /// The payload the client posts to handshake2.
    pub fn handshake2_payload(
        self,
        local_seed: &[u8; 16],
        remote_seed: &[u8; 16],
        auth_hash: &[u8],
    ) -> [u8; 32] {
        match self {
            KlapVersion::V1 => handshake2_seed_auth_hash(remote_seed, auth_hash),
            KlapVersion::V2 => handshake2_seed_auth_hash_v2(local_seed, remote_seed, auth_hash),
        }
    }

    /// The single default pair tried when the configured credentials do not
    /// match the device's proof.
    pub fn default_credentials(self) -> DefaultCredentials {
        match self {
            KlapVersion::V1 => DefaultCredentials::Kasa,
            KlapVersion::V2 => DefaultCredentials::Tapo,
        }
    }
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// V1 auth hash: `md5(md5(username) ‖ md5(password))`.
pub fn generate_auth_hash(credentials: &Credentials) -> [u8; 16] {
    let user = Md5::digest(credentials.username.as_bytes());
    let pass = Md5::digest(credentials.expose_password().as_bytes());
    let mut hasher = Md5::new();
    hasher.update(user);
    hasher.update(pass);
    hasher.finalize().into()
}

/// V2 auth hash: `sha256(sha1(username) ‖ sha1(password))`.
pub fn generate_auth_hash_v2(credentials: &Credentials) -> [u8; 32] {
    let user = Sha1::digest(credentials.username.as_bytes());
    let pass = Sha1::digest(credentials.expose_password().as_bytes());
    sha256(&[&user, &pass])
}

pub fn handshake1_seed_auth_hash(local_seed: &[u8; 16], auth_hash: &[u8]) -> [u8; 32] {
    sha256(&[local_seed, auth_hash])
}

pub fn handshake1_seed_auth_hash_v2(
    local_seed: &[u8; 16],
    remote_seed: &[u8; 16],
    auth_hash: &[u8],
) -> [u8; 32] {
    sha256(&[local_seed, remote_seed, auth_hash])
}

pub fn handshake2_seed_auth_hash(remote_seed: &[u8; 16], auth_hash: &[u8]) -> [u8; 32] {
    sha256(&[remote_seed, auth_hash])
}

pub fn handshake2_seed_auth_hash_v2(
    local_seed: &[u8; 16],
    remote_seed: &[u8; 16],
    auth_hash: &[u8],
) -> [u8; 32] {
    sha256(&[remote_seed, local_seed, auth_hash])
}

/// Per-session keys derived from both seeds and the auth hash.
///
/// The client increments the sequence number before each request; the device
/// answers with the same sequence number, so [`decrypt_at`](Self::decrypt_at)
/// takes it explicitly.
pub struct KlapEncryptionSession {
    key: [u8; 16],
    iv_prefix: [u8; 12],
    sig_key: [u8; 28],
    seq: i32,
}

impl KlapEncryptionSession {
    pub fn new(local_seed: &[u8; 16], remote_seed: &[u8; 16], auth_hash: &[u8]) -> Self {
        let lsk = sha256(&[b"lsk", local_seed, remote_seed, auth_hash]);
        let ivseq = sha256(&[b"iv", local_seed, remote_seed, auth_hash]);
        let ldk = sha256(&[b"ldk", local_seed, remote_seed, auth_hash]);

        let mut key = [0u8; 16];
        key.copy_from_slice(&lsk[..16]);
        let mut iv_prefix = [0u8; 12];
        iv_prefix.copy_from_slice(&ivseq[..12]);
        let mut sig_key = [0u8; 28];
        sig_key.copy_from_slice(&ldk[..28]);
        let seq = i32::from_be_bytes([ivseq[28], ivseq[29], ivseq[30], ivseq[31]]);

        Self {
            key,
            iv_prefix,
            sig_key,
            seq,
        }
    }

    /// Current sequence number.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    fn iv(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv_prefix);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    fn signature(&self, seq: i32, ciphertext: &[u8]) -> [u8; 32] {
        sha256(&[&self.sig_key, &seq.to_be_bytes(), ciphertext])
    }

    /// Advances the sequence number and encrypts a request body.
    ///
    /// Returns `signature ‖ ciphertext` and the sequence number to send.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        (self.encrypt_at(self.seq, plaintext), self.seq)
    }

    /// Encrypts a body for an explicit sequence number.
    pub fn encrypt_at(&self, seq: i32, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = cbc_encrypt(&self.key, &self.iv(seq), plaintext);
        let mut body = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        body.extend_from_slice(&self.signature(seq, &ciphertext));
        body.extend_from_slice(&ciphertext);
        body
    }

    /// Checks the signature prefix of a body.
    pub fn verify_signature(&self, seq: i32, body: &[u8]) -> Result<(), Error> {
        if body.len() < SIGNATURE_LEN {
            return Err(Error::Integrity(format!(
                "KLAP body too short: {} bytes",
                body.len()
            )));
        }
        let (signature, ciphertext) = body.split_at(SIGNATURE_LEN);
        if signature != self.signature(seq, ciphertext) {
            return Err(Error::Integrity(format!(
                "KLAP signature mismatch for seq {seq}"
            )));
        }
        Ok(())
    }

    /// Decrypts a body without checking its signature.
    pub fn decrypt_at(&self, seq: i32, body: &[u8]) -> Result<Vec<u8>, Error> {
        let ciphertext = body.get(SIGNATURE_LEN..).unwrap_or_default();
        cbc_decrypt(&self.key, &self.iv(seq), ciphertext)
    }
}

impl std::fmt::Debug for KlapEncryptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapEncryptionSession")
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

//! XOR autokey cipher for the legacy TP-Link Smart Home Protocol.
//!
//! Each plaintext byte is XORed with the previous ciphertext byte, starting
//! from a key of 171. Decryption therefore has to remember the last
//! *ciphertext* byte it saw, which [`XorCipher`] does across chunks so a frame
//! split over several TCP segments decrypts the same as one read.

/// Initial key for the XOR autokey cipher.
pub const INITIAL_KEY: u8 = 171;

/// Stateful autokey cipher.
///
/// One instance encrypts or decrypts one logical stream; create a fresh one
/// per frame.
#[derive(Debug, Clone, Copy)]
pub struct XorCipher {
    key: u8,
}

impl XorCipher {
    pub fn new() -> Self {
        Self { key: INITIAL_KEY }
    }

    /// Encrypts `data` in place, continuing from the previous chunk.
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.key;
            self.key = *byte;
        }
    }

    /// Decrypts `data` in place, continuing from the previous chunk.
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let cipher = *byte;
            *byte ^= self.key;
            self.key = cipher;
        }
    }
}

impl Default for XorCipher {
    fn default() -> Self {
        Self::new()
    }
}

/// Encrypts a payload and prepends the 4-byte big-endian length header used on
/// TCP port 9999.
///
/// # Example
///
/// ```
/// use kasa_protocol::crypto::xor::encrypt;
///
/// let command = r#"{"system":{"get_sysinfo":{}}}"#;
/// let encrypted = encrypt(command.as_bytes());
/// assert_eq!(encrypted.len(), 4 + command.len());
/// ```
pub fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + plaintext.len());
    frame.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    frame.extend_from_slice(plaintext);
    XorCipher::new().encrypt_in_place(&mut frame[4..]);
    frame
}

/// Encrypts for UDP discovery (no length prefix).
pub fn encrypt_udp(plaintext: &[u8]) -> Vec<u8> {
    let mut out = plaintext.to_vec();
    XorCipher::new().encrypt_in_place(&mut out);
    out
}

/// Decrypts a payload without its length header.
///
/// # Example
///
/// ```
/// use kasa_protocol::crypto::xor::{decrypt, encrypt};
///
/// let original = br#"{"system":{"get_sysinfo":{}}}"#;
/// let encrypted = encrypt(original);
/// assert_eq!(decrypt(&encrypted[4..]), original.to_vec());
/// ```
pub fn decrypt(ciphertext: &[u8]) -> Vec<u8> {
    let mut out = ciphertext.to_vec();
    XorCipher::new().decrypt_in_place(&mut out);
    out
}

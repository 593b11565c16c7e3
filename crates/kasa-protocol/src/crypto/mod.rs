//! Cryptographic primitives for TP-Link device communication.
//!
//! - [`xor`]: legacy autokey cipher (port 9999)
//! - [`klap`]: KLAP credential hashing and session keys
//! - [`aes`]: AES-128-CBC shared by KLAP and the AES passthrough
//! - [`rsa`]: key pairs for the AES handshake and encrypted discovery

pub mod aes;
pub mod klap;
pub mod rsa;
pub mod xor;

pub use self::aes::AesCipher;
pub use self::klap::{KlapEncryptionSession, KlapVersion, generate_auth_hash, generate_auth_hash_v2};
pub use self::rsa::{KeyPair, KeyPairPem};
pub use self::xor::XorCipher;

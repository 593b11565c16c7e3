//! Credentials for authenticated device transports.
//!
//! KLAP and AES devices authenticate with the owner's TP-Link cloud account.
//! Legacy XOR devices need no credentials at all.
//!
//! # Default Credentials
//!
//! Devices that were set up without a cloud account, or that have been reset,
//! accept a well-known credential pair. The transports fall back to exactly one
//! such pair (see [`DefaultCredentials`]) before reporting an authentication
//! failure.
//!
//! # Security
//!
//! Passwords are stored using [`SecretString`] from the `secrecy` crate so they
//! never show up in logs or `Debug` output. Use
//! [`Credentials::expose_password()`] when the raw value is needed for hashing.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Credentials for authenticating with TP-Link devices.
///
/// # Example
///
/// ```
/// use kasa_protocol::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// assert!(!creds.is_blank());
///
/// let blank = Credentials::blank();
/// assert!(blank.is_blank());
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The username (the TP-Link cloud account email address).
    pub username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates new credentials with the given username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Creates blank (anonymous) credentials.
    pub fn blank() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Returns `true` if both username and password are empty.
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// Exposes the password for hashing.
    ///
    /// Never log or display the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Well-known credential pairs accepted by unprovisioned devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultCredentials {
    /// Kasa-branded devices (KLAP v1).
    Kasa,
    /// Tapo-branded devices (KLAP v2 and AES).
    Tapo,
    /// Cameras and hubs reached over HTTPS.
    TapoCamera,
}

impl DefaultCredentials {
    /// Returns the credential pair.
    pub fn credentials(self) -> Credentials {
        match self {
            DefaultCredentials::Kasa => Credentials::new("kasa@tp-link.net", "kasaSetup"),
            DefaultCredentials::Tapo => Credentials::new("test@tp-link.net", "test"),
            DefaultCredentials::TapoCamera => Credentials::new("admin", "admin"),
        }
    }

    /// Short label used in log events.
    pub fn label(self) -> &'static str {
        match self {
            DefaultCredentials::Kasa => "kasa default",
            DefaultCredentials::Tapo => "tapo default",
            DefaultCredentials::TapoCamera => "camera default",
        }
    }
}

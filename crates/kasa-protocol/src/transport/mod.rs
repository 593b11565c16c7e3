//! Transports: one per device protocol generation.
//!
//! - [`XorTransport`]: XOR-obfuscated TCP on port 9999 (legacy firmware)
//! - [`KlapTransport`]: KLAP over HTTP on port 80, in two versions
//! - [`AesTransport`]: RSA key exchange + AES passthrough over HTTP
//! - [`SslAesTransport`]: the same passthrough over HTTPS (cameras, hubs)
//!
//! A transport owns its connection and session. It takes `&mut self` for
//! everything that touches the session, so one transport can only ever be used
//! by one task at a time; protocols put it behind an async mutex.
//!
//! [`DeviceTransport`] is the closed set of transports, selected once from a
//! [`DeviceConfig`].

pub mod aes;
pub mod klap;
pub mod ssl_aes;
pub mod xor;

pub use self::aes::AesTransport;
pub use self::klap::KlapTransport;
pub use self::ssl_aes::SslAesTransport;
pub use self::xor::XorTransport;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::{
    config::{DeviceConfig, DeviceFamily, EncryptionType},
    crypto::KlapVersion,
    error::Error,
};

/// Session cookie set by KLAP and AES devices.
pub(crate) const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// Cookie carrying the device-reported session lifetime in seconds.
pub(crate) const TIMEOUT_COOKIE_NAME: &str = "TIMEOUT";

/// Session lifetime when the device does not report one.
pub(crate) const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Sessions are renewed this long before the device would expire them.
pub(crate) const SESSION_EXPIRE_BUFFER: Duration = Duration::from_secs(20 * 60);

/// Interface implemented by every transport.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the session if there is none (or it has expired).
    async fn connect(&mut self) -> Result<(), Error>;

    /// Sends a JSON request and returns the decrypted JSON response.
    ///
    /// Connects first when needed.
    async fn send(&mut self, request: &str) -> Result<String, Error>;

    /// Drops the session so the next request renegotiates.
    fn reset(&mut self);

    /// Drops the session and any open connection.
    async fn close(&mut self);

    /// Returns the encryption type used by this transport.
    fn encryption_type(&self) -> EncryptionType;

    /// Returns the device host.
    fn host(&self) -> &str;

    /// Returns the device port.
    fn port(&self) -> u16;

    /// Persistable hash of the configured credentials, `None` for anonymous
    /// access.
    fn credentials_hash(&self) -> Option<String>;
}

/// All transports, selected from `DeviceConfig.connection_type`.
#[derive(Debug)]
pub enum DeviceTransport {
    Xor(XorTransport),
    Klap(KlapTransport),
    Aes(AesTransport),
    SslAes(SslAesTransport),
}

impl DeviceTransport {
    /// Picks the transport for a configuration.
    ///
    /// | connection type | transport |
    /// |---|---|
    /// | `*.XOR` | [`XorTransport`] |
    /// | `IOT.KLAP` | [`KlapTransport`] V1 (V2 with login version 2) |
    /// | `SMART.KLAP` | [`KlapTransport`] V2 |
    /// | `SMART.AES` | [`AesTransport`] |
    /// | `SMART.AES` + https | [`SslAesTransport`] |
    pub fn from_config(config: &DeviceConfig) -> Result<Self, Error> {
        let connection = &config.connection_type;
        let transport = match connection.encryption_type {
            EncryptionType::Xor => DeviceTransport::Xor(XorTransport::from_config(config)),
            EncryptionType::Klap => {
                let version = klap_version(connection.device_family, connection.login_version);
                DeviceTransport::Klap(KlapTransport::new(config, version)?)
            }
            EncryptionType::Aes if connection.https => {
                DeviceTransport::SslAes(SslAesTransport::new(config)?)
            }
            EncryptionType::Aes => DeviceTransport::Aes(AesTransport::new(config)?),
        };
        Ok(transport)
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            DeviceTransport::Xor(t) => t,
            DeviceTransport::Klap(t) => t,
            DeviceTransport::Aes(t) => t,
            DeviceTransport::SslAes(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Transport {
        match self {
            DeviceTransport::Xor(t) => t,
            DeviceTransport::Klap(t) => t,
            DeviceTransport::Aes(t) => t,
            DeviceTransport::SslAes(t) => t,
        }
    }
}

#[async_trait]
impl Transport for DeviceTransport {
    async fn connect(&mut self) -> Result<(), Error> {
        self.inner_mut().connect().await
    }

    async fn send(&mut self, request: &str) -> Result<String, Error> {
        self.inner_mut().send(request).await
    }

    fn reset(&mut self) {
        self.inner_mut().reset()
    }

    async fn close(&mut self) {
        self.inner_mut().close().await
    }

    fn encryption_type(&self) -> EncryptionType {
        self.inner().encryption_type()
    }

    fn host(&self) -> &str {
        self.inner().host()
    }

    fn port(&self) -> u16 {
        self.inner().port()
    }

    fn credentials_hash(&self) -> Option<String> {
        self.inner().credentials_hash()
    }
}

/// KLAP version for a device family and login version.
pub fn klap_version(family: DeviceFamily, login_version: Option<u32>) -> KlapVersion {
    if !family.is_iot() || login_version == Some(2) {
        KlapVersion::V2
    } else {
        KlapVersion::V1
    }
}

/// When a session established now should be renewed, given the device's
/// `TIMEOUT` cookie.
pub(crate) fn session_expiry(timeout_cookie: Option<&str>) -> Instant {
    let lifetime = timeout_cookie
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_TIMEOUT);
    Instant::now() + lifetime.saturating_sub(SESSION_EXPIRE_BUFFER)
}

/// Lockout counters a device reports after rejected credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Lockout {
    pub failed_attempts: Option<u32>,
    pub remaining_attempts: Option<u32>,
}

impl Lockout {
    /// Looks for `failedAttempts` / `remainAttempts` at the top level, under
    /// `result`, or under `result.data`.
    pub fn from_json(body: &Value) -> Option<Self> {
        let candidates = [
            Some(body),
            body.get("result"),
            body.get("result").and_then(|r| r.get("data")),
        ];
        candidates.into_iter().flatten().find_map(|obj| {
            let counter = |key: &str| {
                obj.get(key)
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
            };
            let lockout = Lockout {
                failed_attempts: counter("failedAttempts"),
                remaining_attempts: counter("remainAttempts"),
            };
            (lockout != Lockout::default()).then_some(lockout)
        })
    }

    pub fn into_error(self, message: impl Into<String>) -> Error {
        Error::AuthenticationFailed {
            message: message.into(),
            code: None,
            failed_attempts: self.failed_attempts,
            remaining_attempts: self.remaining_attempts,
        }
    }
}

/// Milliseconds since the Unix epoch, sent as `request_time_milis`.
pub(crate) fn request_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

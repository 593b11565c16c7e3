//! Error types for kasa-protocol.
//!
//! Every failure surfaced by the library is an [`Error`]. The variants follow
//! the way a caller usually reacts to them: connection problems and timeouts
//! can be retried, authentication and device errors cannot, and integrity
//! errors mean the encrypted session can no longer be trusted.
//!
//! Devices speaking the SMART protocol report failures as numeric error codes,
//! modelled by [`SmartErrorCode`].

use std::fmt;

use thiserror::Error;

/// Error type for kasa-protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection to the device failed (refused, reset, unreachable).
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation exceeded the configured timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Handshake proof mismatch, rejected credentials, or device lockout.
    #[error("authentication failed: {message}{}", lockout_suffix(.failed_attempts, .remaining_attempts))]
    AuthenticationFailed {
        message: String,
        code: Option<SmartErrorCode>,
        failed_attempts: Option<u32>,
        remaining_attempts: Option<u32>,
    },

    /// The device accepted the request but reported an application error.
    #[error("device error {code}: {message}")]
    Device {
        code: SmartErrorCode,
        message: String,
    },

    /// Signature or padding mismatch on an encrypted payload.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The device rejected an established session (HTTP 403).
    #[error("session rejected: {0}")]
    SessionRejected(String),

    /// The device asked for the request to be repeated.
    #[error("retryable device error: {0}")]
    Retryable(String),

    /// Protocol error (malformed frame, unexpected response format, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to parse a device response.
    #[error("parse error: {0}")]
    Parse(String),

    /// The device could not be matched to a supported protocol.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn lockout_suffix(failed: &Option<u32>, remaining: &Option<u32>) -> String {
    match (*failed, *remaining) {
        (Some(f), Some(r)) => format!(" (failed attempts: {f}, remaining: {r})"),
        (Some(f), None) => format!(" (failed attempts: {f})"),
        (None, Some(r)) => format!(" (remaining attempts: {r})"),
        (None, None) => String::new(),
    }
}

impl Error {
    /// Creates an authentication error without device-reported details.
    pub fn auth(message: impl Into<String>) -> Self {
        Error::AuthenticationFailed {
            message: message.into(),
            code: None,
            failed_attempts: None,
            remaining_attempts: None,
        }
    }

    /// Creates an error for a SMART error code, classified by its kind.
    pub fn from_smart_code(code: SmartErrorCode, context: &str) -> Self {
        let message = format!("{context}: {}", code.description());
        if code.is_retryable() {
            Error::Retryable(message)
        } else if code.is_authentication() {
            Error::AuthenticationFailed {
                message,
                code: Some(code),
                failed_attempts: None,
                remaining_attempts: None,
            }
        } else {
            Error::Device { code, message }
        }
    }

    /// Whether the error is transient and the request may be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_)
                | Error::Timeout(_)
                | Error::SessionRejected(_)
                | Error::Retryable(_)
        )
    }

    /// Device-reported failed attempt counter, if this is an authentication error.
    pub fn failed_attempts(&self) -> Option<u32> {
        match self {
            Error::AuthenticationFailed {
                failed_attempts, ..
            } => *failed_attempts,
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(err.to_string()),
            _ => Error::ConnectionFailed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

/// Error codes reported by SMART devices in the `error_code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmartErrorCode {
    Success,
    // Transport errors
    SessionTimeout,
    MultiRequestFailed,
    HttpTransportFailed,
    LoginFailed,
    HandshakeFailed,
    TransportUnknownCredentials,
    TransportNotAvailable,
    CommandCancel,
    NullTransport,
    // Common method errors
    CommonFailed,
    Unspecific,
    UnknownMethod,
    JsonDecodeFail,
    JsonEncodeFail,
    AesDecodeFail,
    RequestLen,
    CloudFailed,
    Params,
    InvalidPublicKey,
    SessionParam,
    // Method specific errors
    QuickSetup,
    Device,
    DeviceNextEvent,
    Firmware,
    FirmwareVersion,
    Login,
    Time,
    Wireless,
    WirelessUnsupported,
    Schedule,
    Countdown,
    Antitheft,
    Account,
    Stat,
    Dst,
    // Secure (HTTPS) session errors
    SessionExpired,
    DeviceBlocked,
    DeviceFactory,
    BadUsername,
    InvalidNonce,
    // Raised by this library
    InternalUnknown,
    InternalQuery,
    /// A code this library does not know about.
    Other(i32),
}

impl SmartErrorCode {
    /// Maps a wire error code to its variant.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            9999 => Self::SessionTimeout,
            1200 => Self::MultiRequestFailed,
            1112 => Self::HttpTransportFailed,
            1111 => Self::LoginFailed,
            1100 => Self::HandshakeFailed,
            1003 => Self::TransportUnknownCredentials,
            1002 => Self::TransportNotAvailable,
            1001 => Self::CommandCancel,
            1000 => Self::NullTransport,
            -1 => Self::CommonFailed,
            -1001 => Self::Unspecific,
            -1002 => Self::UnknownMethod,
            -1003 => Self::JsonDecodeFail,
            -1004 => Self::JsonEncodeFail,
            -1005 => Self::AesDecodeFail,
            -1006 => Self::RequestLen,
            -1007 => Self::CloudFailed,
            -1008 => Self::Params,
            -1010 => Self::InvalidPublicKey,
            -1101 => Self::SessionParam,
            -1201 => Self::QuickSetup,
            -1301 => Self::Device,
            -1302 => Self::DeviceNextEvent,
            -1401 => Self::Firmware,
            -1402 => Self::FirmwareVersion,
            -1501 => Self::Login,
            -1601 => Self::Time,
            -1701 => Self::Wireless,
            -1702 => Self::WirelessUnsupported,
            -1801 => Self::Schedule,
            -1901 => Self::Countdown,
            -2001 => Self::Antitheft,
            -2101 => Self::Account,
            -2201 => Self::Stat,
            -2301 => Self::Dst,
            -40401 => Self::SessionExpired,
            -40404 => Self::DeviceBlocked,
            -40405 => Self::DeviceFactory,
            -40411 => Self::BadUsername,
            -40413 => Self::InvalidNonce,
            -100_000 => Self::InternalUnknown,
            -100_001 => Self::InternalQuery,
            other => Self::Other(other),
        }
    }

    /// The numeric wire value.
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::SessionTimeout => 9999,
            Self::MultiRequestFailed => 1200,
            Self::HttpTransportFailed => 1112,
            Self::LoginFailed => 1111,
            Self::HandshakeFailed => 1100,
            Self::TransportUnknownCredentials => 1003,
            Self::TransportNotAvailable => 1002,
            Self::CommandCancel => 1001,
            Self::NullTransport => 1000,
            Self::CommonFailed => -1,
            Self::Unspecific => -1001,
            Self::UnknownMethod => -1002,
            Self::JsonDecodeFail => -1003,
            Self::JsonEncodeFail => -1004,
            Self::AesDecodeFail => -1005,
            Self::RequestLen => -1006,
            Self::CloudFailed => -1007,
            Self::Params => -1008,
            Self::InvalidPublicKey => -1010,
            Self::SessionParam => -1101,
            Self::QuickSetup => -1201,
            Self::Device => -1301,
            Self::DeviceNextEvent => -1302,
            Self::Firmware => -1401,
            Self::FirmwareVersion => -1402,
            Self::Login => -1501,
            Self::Time => -1601,
            Self::Wireless => -1701,
            Self::WirelessUnsupported => -1702,
            Self::Schedule => -1801,
            Self::Countdown => -1901,
            Self::Antitheft => -2001,
            Self::Account => -2101,
            Self::Stat => -2201,
            Self::Dst => -2301,
            Self::SessionExpired => -40401,
            Self::DeviceBlocked => -40404,
            Self::DeviceFactory => -40405,
            Self::BadUsername => -40411,
            Self::InvalidNonce => -40413,
            Self::InternalUnknown => -100_000,
            Self::InternalQuery => -100_001,
            Self::Other(code) => *code,
        }
    }

    /// Human-readable description of the code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SessionTimeout => "session timeout",
            Self::MultiRequestFailed => "multiple request failed",
            Self::HttpTransportFailed => "HTTP transport failed",
            Self::LoginFailed => "login failed",
            Self::HandshakeFailed => "handshake failed",
            Self::TransportUnknownCredentials => "unknown credentials",
            Self::TransportNotAvailable => "transport not available",
            Self::CommandCancel => "command cancelled",
            Self::NullTransport => "null transport",
            Self::CommonFailed => "common failure",
            Self::Unspecific => "unspecific error",
            Self::UnknownMethod => "unknown method",
            Self::JsonDecodeFail => "JSON decode failed",
            Self::JsonEncodeFail => "JSON encode failed",
            Self::AesDecodeFail => "AES decode failed",
            Self::RequestLen => "request length error",
            Self::CloudFailed => "cloud request failed",
            Self::Params => "invalid parameters",
            Self::InvalidPublicKey => "invalid public key",
            Self::SessionParam => "session parameter error",
            Self::QuickSetup => "quick setup error",
            Self::Device => "device error",
            Self::DeviceNextEvent => "device next event error",
            Self::Firmware => "firmware error",
            Self::FirmwareVersion => "firmware version error",
            Self::Login => "login error",
            Self::Time => "time error",
            Self::Wireless => "wireless error",
            Self::WirelessUnsupported => "wireless unsupported",
            Self::Schedule => "schedule error",
            Self::Countdown => "countdown error",
            Self::Antitheft => "anti-theft error",
            Self::Account => "account error",
            Self::Stat => "statistics error",
            Self::Dst => "DST error",
            Self::SessionExpired => "session expired",
            Self::DeviceBlocked => "device blocked",
            Self::DeviceFactory => "device in factory state",
            Self::BadUsername => "bad username",
            Self::InvalidNonce => "invalid nonce",
            Self::InternalUnknown => "internal unknown error",
            Self::InternalQuery => "entry missing from device response",
            Self::Other(_) => "unknown error code",
        }
    }

    /// Codes after which the request can be sent again on a fresh session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportNotAvailable
                | Self::HttpTransportFailed
                | Self::Unspecific
                | Self::SessionTimeout
                | Self::SessionExpired
                | Self::InvalidNonce
        )
    }

    /// Codes that mean the credentials or the session key were rejected.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::Login
                | Self::LoginFailed
                | Self::AesDecodeFail
                | Self::HandshakeFailed
                | Self::TransportUnknownCredentials
                | Self::DeviceBlocked
                | Self::BadUsername
        )
    }
}

impl fmt::Display for SmartErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

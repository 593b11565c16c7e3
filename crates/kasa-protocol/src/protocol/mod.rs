//! Protocols: the request/response contract on top of a transport.
//!
//! - [`IotProtocol`]: `{target: {command: args}}` for IOT devices
//! - [`SmartProtocol`]: `{method, params}` for SMART devices, with batching
//!
//! Both own their transport behind an async mutex, so concurrent callers queue
//! instead of opening parallel sessions, and both retry according to a
//! [`RetryPolicy`].

pub mod iot;
pub mod retry;
pub mod smart;

pub use self::iot::IotProtocol;
pub use self::retry::{RetryDecision, RetryPolicy};
pub use self::smart::{MethodResult, SmartProtocol, SmartRequest};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::{DeviceConfig, EncryptionType},
    error::Error,
    transport::{DeviceTransport, Transport},
};

/// The protocol for a device, selected from its configuration.
#[derive(Debug)]
pub enum Protocol {
    Iot(IotProtocol),
    Smart(SmartProtocol),
}

impl Protocol {
    /// `IOT.*` families get [`IotProtocol`] (XOR or KLAP), `SMART.*` families
    /// get [`SmartProtocol`] (KLAP or AES). Other combinations are unsupported.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, Error> {
        let connection = &config.connection_type;
        match (connection.device_family.is_iot(), connection.encryption_type) {
            (true, EncryptionType::Xor | EncryptionType::Klap) => {
                Ok(Protocol::Iot(IotProtocol::from_config(config)?))
            }
            (false, EncryptionType::Klap | EncryptionType::Aes) => {
                Ok(Protocol::Smart(SmartProtocol::from_config(config)?))
            }
            _ => Err(Error::UnsupportedDevice(format!(
                "no protocol for connection type {connection}"
            ))),
        }
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        match self {
            Protocol::Iot(protocol) => Protocol::Iot(protocol.with_retry_policy(retry)),
            Protocol::Smart(protocol) => Protocol::Smart(protocol.with_retry_policy(retry)),
        }
    }

    /// Sends a request; see [`IotProtocol::query`] and [`SmartProtocol::query`]
    /// for the accepted shapes.
    pub async fn query(&self, request: &Value) -> Result<Value, Error> {
        match self {
            Protocol::Iot(protocol) => protocol.query(request).await,
            Protocol::Smart(protocol) => protocol.query(request).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Protocol::Iot(protocol) => protocol.close().await,
            Protocol::Smart(protocol) => protocol.close().await,
        }
    }

    pub async fn credentials_hash(&self) -> Option<String> {
        match self {
            Protocol::Iot(protocol) => protocol.credentials_hash().await,
            Protocol::Smart(protocol) => protocol.credentials_hash().await,
        }
    }
}

/// Sends `request` until it succeeds or the policy gives up. `check` turns a
/// parsed response into an error where the envelope reports one.
pub(crate) async fn send_with_retry(
    transport: &mut DeviceTransport,
    policy: &RetryPolicy,
    request: &str,
    check: impl Fn(&Value) -> Result<(), Error>,
) -> Result<Value, Error> {
    let mut attempt = 0;
    loop {
        let outcome = match transport.send(request).await {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .map_err(Error::from)
                .and_then(|response| check(&response).map(|()| response)),
            Err(err) => Err(err),
        };
        let err = match outcome {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        match policy.decide(&err, attempt) {
            RetryDecision::Retry { backoff } => {
                debug!(host = %transport.host(), attempt, error = %err, "retrying request");
                tokio::time::sleep(backoff).await;
            }
            RetryDecision::Renegotiate { backoff } => {
                warn!(host = %transport.host(), attempt, error = %err, "renegotiating session");
                transport.reset();
                tokio::time::sleep(backoff).await;
            }
            RetryDecision::Fail => return Err(err),
        }
        attempt += 1;
    }
}

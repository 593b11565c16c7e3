//! IOT protocol: `{target: {command: args}}` requests to Kasa devices, over
//! the XOR transport or KLAP V1.
//!
//! Responses mirror the request structure and are returned as-is; per-command
//! `err_code` fields are left to the caller.

use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    config::DeviceConfig,
    error::Error,
    protocol::{RetryPolicy, send_with_retry},
    transport::{DeviceTransport, Transport},
};

/// Protocol for IOT devices.
///
/// # Example
///
/// ```no_run
/// use kasa_protocol::{DeviceConfig, IotProtocol};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let protocol = IotProtocol::from_config(&DeviceConfig::new("192.168.1.100"))?;
///     let info = protocol.query(&json!({"system": {"get_sysinfo": {}}})).await?;
///     println!("{}", info["system"]["get_sysinfo"]["alias"]);
///     protocol.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct IotProtocol {
    transport: Mutex<DeviceTransport>,
    retry: RetryPolicy,
}

impl IotProtocol {
    pub fn new(transport: DeviceTransport) -> Self {
        Self {
            transport: Mutex::new(transport),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, Error> {
        Ok(Self::new(DeviceTransport::from_config(config)?))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sends a request and returns the device's response.
    pub async fn query(&self, request: &Value) -> Result<Value, Error> {
        let request = serde_json::to_string(request)?;
        let mut transport = self.transport.lock().await;
        send_with_retry(&mut transport, &self.retry, &request, |_| Ok(())).await
    }

    /// Closes the connection; the next query reconnects.
    pub async fn close(&self) {
        self.transport.lock().await.close().await;
    }

    /// Persistable credentials hash of the underlying transport.
    pub async fn credentials_hash(&self) -> Option<String> {
        self.transport.lock().await.credentials_hash()
    }
}

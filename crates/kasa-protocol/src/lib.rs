//! Transport, protocol and discovery layer for TP-Link Kasa and Tapo devices.
//!
//! TP-Link devices speak one of several wire formats depending on model and
//! firmware age. This crate hides them behind two protocols:
//!
//! - [`IotProtocol`]: `{"system":{"get_sysinfo":{}}}`-style requests to Kasa
//!   devices, over the XOR transport (TCP 9999) or KLAP V1
//! - [`SmartProtocol`]: `{"method":..., "params":...}` requests to Tapo and
//!   newer Kasa devices, over KLAP V2, AES or (for cameras) AES over TLS, with
//!   request batching
//!
//! [`Discover`] finds devices on the local network and produces a
//! [`DeviceConfig`] for each; [`Protocol::from_config`] turns that into a
//! ready-to-use protocol.
//!
//! # Example
//!
//! ```no_run
//! use kasa_protocol::{Credentials, Discover, Protocol};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kasa_protocol::Error> {
//!     let config = Discover::new()
//!         .with_credentials(Credentials::new("user@example.com", "password"))
//!         .discover_single("192.168.1.100")
//!         .await?;
//!
//!     let protocol = Protocol::from_config(&config)?;
//!     let request = match config.protocol_name() {
//!         "IOT" => json!({"system": {"get_sysinfo": {}}}),
//!         _ => json!("get_device_info"),
//!     };
//!     println!("{}", protocol.query(&request).await?);
//!     protocol.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Transports
//!
//! | Transport | Port | Used by |
//! |---|---|---|
//! | XOR | 9999 (TCP) | IOT devices with older firmware |
//! | KLAP V1 | 80 | IOT devices with newer firmware |
//! | KLAP V2 | 80 | SMART devices |
//! | AES | 80 | SMART devices with older firmware |
//! | AES over TLS | 443 | SMART cameras and doorbells |

use std::time::Duration;

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod http;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{DeviceConfig, DeviceConnectionParameters, DeviceFamily, EncryptionType};
pub use credentials::{Credentials, DefaultCredentials};
pub use discovery::{Discover, DiscoveryReply, UnsupportedReply};
pub use error::{Error, SmartErrorCode};
pub use http::HttpClient;
pub use protocol::{IotProtocol, MethodResult, Protocol, RetryPolicy, SmartProtocol, SmartRequest};
pub use transport::{DeviceTransport, Transport};

/// The version of the kasa-protocol library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default timeout for a single device request.
///
/// Applies to connection establishment, handshakes, reads and writes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

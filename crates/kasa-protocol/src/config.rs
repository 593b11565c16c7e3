//! Connection configuration for a single device.
//!
//! A [`DeviceConfig`] is produced by discovery (or built by hand) and consumed
//! when a protocol is constructed. It is what callers persist between runs via
//! [`DeviceConfig::to_map`] and [`DeviceConfig::from_map`]. Credentials and the
//! shared HTTP client are never serialized.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{Credentials, DEFAULT_TIMEOUT, crypto::KeyPairPem, error::Error, http::HttpClient};

/// Device family reported by discovery (`device_type` / `mic_type`).
///
/// The prefix selects the protocol: `IOT.*` devices speak the legacy
/// `{target: {command: args}}` dialect, `SMART.*` devices the method based one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    #[serde(rename = "IOT.SMARTPLUGSWITCH")]
    IotSmartPlugSwitch,
    #[serde(rename = "IOT.SMARTBULB")]
    IotSmartBulb,
    #[serde(rename = "IOT.IPCAMERA")]
    IotIpCamera,
    #[serde(rename = "SMART.KASAPLUG")]
    SmartKasaPlug,
    #[serde(rename = "SMART.KASASWITCH")]
    SmartKasaSwitch,
    #[serde(rename = "SMART.TAPOPLUG")]
    SmartTapoPlug,
    #[serde(rename = "SMART.TAPOBULB")]
    SmartTapoBulb,
    #[serde(rename = "SMART.TAPOSWITCH")]
    SmartTapoSwitch,
    #[serde(rename = "SMART.KASAHUB")]
    SmartKasaHub,
    #[serde(rename = "SMART.TAPOHUB")]
    SmartTapoHub,
    #[serde(rename = "SMART.IPCAMERA")]
    SmartIpCamera,
    #[serde(rename = "SMART.TAPOROBOVAC")]
    SmartTapoRobovac,
    #[serde(rename = "SMART.TAPOCHIME")]
    SmartTapoChime,
    #[serde(rename = "SMART.TAPODOORBELL")]
    SmartTapoDoorbell,
}

impl DeviceFamily {
    const ALL: [DeviceFamily; 14] = [
        DeviceFamily::IotSmartPlugSwitch,
        DeviceFamily::IotSmartBulb,
        DeviceFamily::IotIpCamera,
        DeviceFamily::SmartKasaPlug,
        DeviceFamily::SmartKasaSwitch,
        DeviceFamily::SmartTapoPlug,
        DeviceFamily::SmartTapoBulb,
        DeviceFamily::SmartTapoSwitch,
        DeviceFamily::SmartKasaHub,
        DeviceFamily::SmartTapoHub,
        DeviceFamily::SmartIpCamera,
        DeviceFamily::SmartTapoRobovac,
        DeviceFamily::SmartTapoChime,
        DeviceFamily::SmartTapoDoorbell,
    ];

    /// Wire name, e.g. `"SMART.TAPOPLUG"`.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceFamily::IotSmartPlugSwitch => "IOT.SMARTPLUGSWITCH",
            DeviceFamily::IotSmartBulb => "IOT.SMARTBULB",
            DeviceFamily::IotIpCamera => "IOT.IPCAMERA",
            DeviceFamily::SmartKasaPlug => "SMART.KASAPLUG",
            DeviceFamily::SmartKasaSwitch => "SMART.KASASWITCH",
            DeviceFamily::SmartTapoPlug => "SMART.TAPOPLUG",
            DeviceFamily::SmartTapoBulb => "SMART.TAPOBULB",
            DeviceFamily::SmartTapoSwitch => "SMART.TAPOSWITCH",
            DeviceFamily::SmartKasaHub => "SMART.KASAHUB",
            DeviceFamily::SmartTapoHub => "SMART.TAPOHUB",
            DeviceFamily::SmartIpCamera => "SMART.IPCAMERA",
            DeviceFamily::SmartTapoRobovac => "SMART.TAPOROBOVAC",
            DeviceFamily::SmartTapoChime => "SMART.TAPOCHIME",
            DeviceFamily::SmartTapoDoorbell => "SMART.TAPODOORBELL",
        }
    }

    /// `"IOT"` or `"SMART"`.
    pub fn protocol_name(self) -> &'static str {
        match self {
            DeviceFamily::IotSmartPlugSwitch
            | DeviceFamily::IotSmartBulb
            | DeviceFamily::IotIpCamera => "IOT",
            _ => "SMART",
        }
    }

    pub fn is_iot(self) -> bool {
        self.protocol_name() == "IOT"
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| Error::UnsupportedDevice(format!("unknown device family {s}")))
    }
}

/// Encryption scheme used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptionType {
    /// Legacy XOR cipher on port 9999 (no authentication).
    #[default]
    #[serde(rename = "XOR")]
    Xor,
    /// KLAP over HTTP on port 80.
    #[serde(rename = "KLAP")]
    Klap,
    /// RSA/AES passthrough over HTTP or HTTPS.
    #[serde(rename = "AES")]
    Aes,
}

impl EncryptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionType::Xor => "XOR",
            EncryptionType::Klap => "KLAP",
            EncryptionType::Aes => "AES",
        }
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "XOR" => Ok(EncryptionType::Xor),
            "KLAP" => Ok(EncryptionType::Klap),
            "AES" => Ok(EncryptionType::Aes),
            other => Err(Error::UnsupportedDevice(format!(
                "unknown encryption type {other}"
            ))),
        }
    }
}

/// Everything needed to pick a protocol and transport for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConnectionParameters {
    pub device_family: DeviceFamily,
    pub encryption_type: EncryptionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_version: Option<u32>,
    #[serde(default)]
    pub https: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

impl DeviceConnectionParameters {
    pub fn new(device_family: DeviceFamily, encryption_type: EncryptionType) -> Self {
        Self {
            device_family,
            encryption_type,
            login_version: None,
            https: false,
            http_port: None,
        }
    }

    /// Builds parameters from the wire strings reported by a device.
    pub fn from_values(
        device_family: &str,
        encryption_type: &str,
        login_version: Option<u32>,
        https: bool,
        http_port: Option<u16>,
    ) -> Result<Self, Error> {
        Ok(Self {
            device_family: device_family.parse()?,
            encryption_type: encryption_type.parse()?,
            login_version,
            https,
            http_port,
        })
    }

    pub fn with_login_version(mut self, login_version: u32) -> Self {
        self.login_version = Some(login_version);
        self
    }

    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    /// `"IOT"` or `"SMART"`, derived from the device family.
    pub fn protocol_name(&self) -> &'static str {
        self.device_family.protocol_name()
    }
}

impl Default for DeviceConnectionParameters {
    fn default() -> Self {
        Self::new(DeviceFamily::IotSmartPlugSwitch, EncryptionType::Xor)
    }
}

impl fmt::Display for DeviceConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device_family, self.encryption_type)?;
        if self.https {
            f.write_str(".HTTPS")?;
        }
        Ok(())
    }
}

/// Configuration for connecting to a device.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use kasa_protocol::{
///     Credentials, DeviceConfig, DeviceConnectionParameters, DeviceFamily, EncryptionType,
/// };
///
/// let config = DeviceConfig::new("192.168.1.50")
///     .with_connection_type(
///         DeviceConnectionParameters::new(DeviceFamily::SmartTapoPlug, EncryptionType::Klap)
///             .with_login_version(2),
///     )
///     .with_credentials(Credentials::new("user@example.com", "secret"))
///     .with_timeout(Duration::from_secs(5));
///
/// let map = config.to_map().unwrap();
/// assert_eq!(map["connection_type"]["device_family"], "SMART.TAPOPLUG");
/// assert!(map.get("credentials").is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Hostname or IP address.
    pub host: String,
    /// Port to use instead of the transport's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_override: Option<u16>,
    /// Timeout applied to every network operation.
    #[serde(default = "default_timeout", with = "timeout_secs")]
    pub timeout: Duration,
    #[serde(default)]
    pub connection_type: DeviceConnectionParameters,
    /// Whether the device is reached over HTTP (KLAP and AES devices).
    #[serde(default)]
    pub uses_http: bool,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// Base64 credentials hash reported by a previous session; used in place
    /// of credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_hash: Option<String>,
    /// Maximum number of calls per `multipleRequest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// RSA key pair from encrypted discovery, reused by the AES handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aes_keys: Option<KeyPairPem>,
    #[serde(skip)]
    pub http_client: Option<HttpClient>,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

mod timeout_secs {
    use super::*;

    pub fn serialize<S: Serializer>(timeout: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(timeout.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl DeviceConfig {
    /// Creates a configuration for a legacy plug, the most common device.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port_override: None,
            timeout: DEFAULT_TIMEOUT,
            connection_type: DeviceConnectionParameters::default(),
            uses_http: false,
            credentials: None,
            credentials_hash: None,
            batch_size: None,
            aes_keys: None,
            http_client: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the connection type. `uses_http` follows the encryption type.
    pub fn with_connection_type(mut self, connection_type: DeviceConnectionParameters) -> Self {
        self.uses_http = connection_type.encryption_type != EncryptionType::Xor;
        self.connection_type = connection_type;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_credentials_hash(mut self, hash: impl Into<String>) -> Self {
        self.credentials_hash = Some(hash.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_aes_keys(mut self, keys: KeyPairPem) -> Self {
        self.aes_keys = Some(keys);
        self
    }

    /// Shares an HTTP client (and its TLS configuration) between devices.
    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.http_client = Some(client);
        self
    }

    /// `"IOT"` or `"SMART"`.
    pub fn protocol_name(&self) -> &'static str {
        self.connection_type.protocol_name()
    }

    /// Serializes to a JSON object suitable for persistence.
    pub fn to_map(&self) -> Result<Value, Error> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restores a configuration saved with [`to_map`](Self::to_map).
    pub fn from_map(map: &Value) -> Result<Self, Error> {
        Self::deserialize(map).map_err(|e| Error::Config(format!("invalid device config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_family_wire_names() {
        assert_eq!(
            "SMART.TAPOPLUG".parse::<DeviceFamily>().unwrap(),
            DeviceFamily::SmartTapoPlug
        );
        assert_eq!(DeviceFamily::IotSmartBulb.to_string(), "IOT.SMARTBULB");
        assert_eq!(DeviceFamily::IotSmartBulb.protocol_name(), "IOT");
        assert_eq!(DeviceFamily::SmartIpCamera.protocol_name(), "SMART");
        assert!("SMART.TOASTER".parse::<DeviceFamily>().is_err());
        for family in DeviceFamily::ALL {
            assert_eq!(family.as_str().parse::<DeviceFamily>().unwrap(), family);
        }
    }

    #[test]
    fn test_map_roundtrip_drops_secrets() {
        let connection =
            DeviceConnectionParameters::from_values("SMART.TAPOBULB", "AES", Some(2), true, None)
                .unwrap();
        let config = DeviceConfig::new("10.0.0.2")
            .with_port(8080)
            .with_timeout(Duration::from_secs(7))
            .with_connection_type(connection)
            .with_credentials(Credentials::new("user", "pass"))
            .with_credentials_hash("aGFzaA==")
            .with_batch_size(3)
            .with_http_client(HttpClient::new());

        let map = config.to_map().unwrap();
        assert_eq!(map["timeout"], 7);
        assert_eq!(map["connection_type"]["encryption_type"], "AES");
        assert_eq!(map["connection_type"]["https"], true);
        assert!(map.get("credentials").is_none());
        assert!(map.get("http_client").is_none());
        assert!(map.get("aes_keys").is_none());

        let restored = DeviceConfig::from_map(&map).unwrap();
        assert_eq!(restored.host, "10.0.0.2");
        assert_eq!(restored.port_override, Some(8080));
        assert_eq!(restored.timeout, Duration::from_secs(7));
        assert_eq!(restored.connection_type, config.connection_type);
        assert!(restored.uses_http);
        assert!(restored.credentials.is_none());
        assert_eq!(restored.credentials_hash.as_deref(), Some("aGFzaA=="));
        assert_eq!(restored.batch_size, Some(3));
    }

    #[test]
    fn test_from_map_defaults() {
        let config = DeviceConfig::from_map(&json!({"host": "10.0.0.3"})).unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.protocol_name(), "IOT");
        assert_eq!(config.connection_type.encryption_type, EncryptionType::Xor);
        assert!(!config.uses_http);
    }

    #[test]
    fn test_from_map_rejects_unknown_family() {
        let map = json!({
            "host": "10.0.0.4",
            "connection_type": {"device_family": "SMART.TOASTER", "encryption_type": "KLAP"}
        });
        assert!(matches!(
            DeviceConfig::from_map(&map),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_connection_type_display() {
        let params =
            DeviceConnectionParameters::new(DeviceFamily::SmartTapoHub, EncryptionType::Aes)
                .with_https(true);
        assert_eq!(params.to_string(), "SMART.TAPOHUB.AES.HTTPS");
    }
}

//! Device discovery over UDP.
//!
//! Two probes run side by side, each from its own socket:
//! - **Port 9999 (legacy)**: XOR-obfuscated `{"system":{"get_sysinfo":{}}}`,
//!   answered by IOT devices with their sysinfo
//! - **Port 20002 (TDP)**: 16-byte TDP header plus a JSON body, answered by
//!   KLAP and AES devices with their encryption scheme
//!
//! Replies are deduplicated by source address. A TDP reply replaces an earlier
//! legacy reply from the same host, since only the former names the
//! encryption scheme.
//!
//! When encrypted discovery is on, the TDP probe carries an RSA public key and
//! devices may include an `encrypt_info` block whose payload is decrypted with
//! it. The key pair is handed on to AES devices' configurations.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    net::UdpSocket,
    sync::Notify,
    time::{Instant, timeout},
};
use tracing::{debug, warn};

use crate::{
    Credentials,
    config::{DeviceConfig, DeviceConnectionParameters, DeviceFamily, EncryptionType},
    crypto::{
        AesCipher, KeyPair, KeyPairPem,
        aes::b64_decode,
        rsa::DISCOVERY_KEY_BITS,
        xor::{decrypt, encrypt_udp},
    },
    error::Error,
    http::HttpClient,
    protocol::{Protocol, RetryPolicy},
};

/// Port for legacy XOR discovery.
pub const LEGACY_DISCOVERY_PORT: u16 = 9999;

/// Port for TDP (newer KLAP/SMART) discovery.
pub const TDP_DISCOVERY_PORT: u16 = 20002;

/// Broadcast address for discovery.
pub const BROADCAST_ADDR: &str = "255.255.255.255";

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes sent by each listener.
pub const PROBES_PER_LISTENER: usize = 3;

const PROBE_INTERVAL: Duration = Duration::from_millis(50);

const LEGACY_QUERY: &[u8] = br#"{"system":{"get_sysinfo":{}}}"#;

const TDP_HEADER_LEN: usize = 16;

/// TDP packet header structure.
///
/// Format (16 bytes):
/// - version: u8 (2)
/// - msg_type: u8 (0)
/// - op_code: u16 BE (1 = probe)
/// - msg_size: u16 BE (payload length)
/// - flags: u8 (17)
/// - padding: u8 (0)
/// - device_serial: u32 BE (random)
/// - crc32: u32 BE (computed over entire packet)
#[derive(Debug)]
struct TdpHeader {
    version: u8,
    msg_type: u8,
    op_code: u16,
    msg_size: u16,
    flags: u8,
    padding: u8,
    device_serial: u32,
    crc32: u32,
}

impl TdpHeader {
    fn new(payload_len: u16, serial: u32) -> Self {
        Self {
            version: 2,
            msg_type: 0,
            op_code: 1,
            msg_size: payload_len,
            flags: 17,
            padding: 0,
            device_serial: serial,
            // Placeholder while the checksum is computed.
            crc32: 0x5A6B7C8D,
        }
    }

    fn to_bytes(&self) -> [u8; TDP_HEADER_LEN] {
        let mut bytes = [0u8; TDP_HEADER_LEN];
        bytes[0] = self.version;
        bytes[1] = self.msg_type;
        bytes[2..4].copy_from_slice(&self.op_code.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.msg_size.to_be_bytes());
        bytes[6] = self.flags;
        bytes[7] = self.padding;
        bytes[8..12].copy_from_slice(&self.device_serial.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.crc32.to_be_bytes());
        bytes
    }
}

/// Builds a TDP packet: header, then `payload`, with the CRC32 of the whole
/// packet patched into the header.
fn tdp_packet(payload: &[u8]) -> Vec<u8> {
    let header = TdpHeader::new(payload.len() as u16, rand::random());
    let mut packet = Vec::with_capacity(TDP_HEADER_LEN + payload.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload);
    let crc = crc32fast::hash(&packet);
    packet[12..16].copy_from_slice(&crc.to_be_bytes());
    packet
}

/// Payload of a TDP probe.
fn tdp_query(key_pair: Option<&KeyPair>) -> Vec<u8> {
    let payload = match key_pair {
        Some(pair) => json!({"params": {"rsa_key": pair.public_pem()}}),
        None => json!({"params": {}}),
    };
    tdp_packet(payload.to_string().as_bytes())
}

#[derive(Debug, Clone, Deserialize)]
struct TdpResponse {
    #[serde(default)]
    error_code: i64,
    result: Option<Value>,
}

/// Fields of a TDP reply that drive classification.
#[derive(Debug, Clone, Deserialize)]
struct TdpDeviceInfo {
    device_type: String,
    #[serde(default)]
    mgt_encrypt_schm: Option<TdpEncryptionScheme>,
    #[serde(default)]
    encrypt_info: Option<TdpEncryptInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct TdpEncryptionScheme {
    #[serde(default)]
    encrypt_type: Option<String>,
    #[serde(default)]
    is_support_https: bool,
    #[serde(default)]
    http_port: Option<u16>,
    #[serde(default)]
    lv: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct TdpEncryptInfo {
    sym_schm: String,
    key: String,
    data: String,
}

/// Which probe a reply answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeKind {
    Legacy,
    Tdp,
}

/// A classified discovery reply.
#[derive(Debug, Clone)]
pub struct DiscoveryReply {
    pub host: String,
    /// Discovery port the reply came from.
    pub port_found: u16,
    /// Decoded reply: sysinfo for legacy replies, the `result` object for TDP
    /// replies (with `decrypted_data` when it was encrypted).
    pub info: Value,
    pub config: DeviceConfig,
}

/// A reply that could not be matched to a supported protocol.
#[derive(Debug, Clone)]
pub struct UnsupportedReply {
    pub host: String,
    pub port_found: u16,
    pub info: Value,
    pub reason: String,
}

pub type DiscoveredHandler = Arc<dyn Fn(&DiscoveryReply) + Send + Sync>;
pub type UnsupportedHandler = Arc<dyn Fn(&UnsupportedReply) + Send + Sync>;

/// Discovery options and entry points.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use kasa_protocol::{Credentials, Discover};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let devices = Discover::new()
///         .with_timeout(Duration::from_secs(3))
///         .with_credentials(Credentials::new("user@example.com", "password"))
///         .on_unsupported(|reply| eprintln!("unsupported device at {}", reply.host))
///         .discover()
///         .await?;
///     for (host, config) in devices {
///         println!("{host}: {}", config.connection_type);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Discover {
    target: String,
    discovery_timeout: Duration,
    legacy_port: u16,
    tdp_port: u16,
    credentials: Option<Credentials>,
    device_timeout: Duration,
    encrypted: bool,
    key_pair: Option<KeyPairPem>,
    direct_probe: bool,
    connect_port: Option<u16>,
    http_client: HttpClient,
    on_discovered: Option<DiscoveredHandler>,
    on_unsupported: Option<UnsupportedHandler>,
}

impl Default for Discover {
    fn default() -> Self {
        Self {
            target: BROADCAST_ADDR.to_string(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            legacy_port: LEGACY_DISCOVERY_PORT,
            tdp_port: TDP_DISCOVERY_PORT,
            credentials: None,
            device_timeout: crate::DEFAULT_TIMEOUT,
            encrypted: true,
            key_pair: None,
            direct_probe: false,
            connect_port: None,
            http_client: HttpClient::new(),
            on_discovered: None,
            on_unsupported: None,
        }
    }
}

impl Discover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address probes are sent to; the broadcast address by default.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// How long to listen for replies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Overrides the legacy and TDP discovery ports.
    pub fn with_ports(mut self, legacy: u16, tdp: u16) -> Self {
        self.legacy_port = legacy;
        self.tdp_port = tdp;
        self
    }

    /// Credentials placed in every discovered configuration.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Timeout placed in every discovered configuration.
    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    /// Whether the TDP probe carries an RSA key (on by default).
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Uses this key pair for encrypted discovery instead of generating one.
    pub fn with_key_pair(mut self, key_pair: KeyPairPem) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    /// Lets [`discover_single`](Self::discover_single) fall back to
    /// [`try_connect_all`](Self::try_connect_all) when nothing answers.
    pub fn with_direct_probe(mut self, direct_probe: bool) -> Self {
        self.direct_probe = direct_probe;
        self
    }

    /// Port used by [`try_connect_all`](Self::try_connect_all) instead of each
    /// transport's default.
    pub fn with_connect_port(mut self, port: u16) -> Self {
        self.connect_port = Some(port);
        self
    }

    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.http_client = client;
        self
    }

    /// Called once per host when a reply is recorded (or upgraded).
    pub fn on_discovered(
        mut self,
        handler: impl Fn(&DiscoveryReply) + Send + Sync + 'static,
    ) -> Self {
        self.on_discovered = Some(Arc::new(handler));
        self
    }

    /// Called once per host whose reply cannot be classified.
    pub fn on_unsupported(
        mut self,
        handler: impl Fn(&UnsupportedReply) + Send + Sync + 'static,
    ) -> Self {
        self.on_unsupported = Some(Arc::new(handler));
        self
    }

    /// Probes the target for the configured timeout and returns a
    /// configuration per responding host.
    pub async fn discover(&self) -> Result<HashMap<String, DeviceConfig>, Error> {
        let scan = self.scan(&self.target, None).await?;
        debug!(
            devices = scan.replies.len(),
            unsupported = scan.unsupported.len(),
            "discovery finished"
        );
        Ok(scan
            .replies
            .into_iter()
            .map(|(host, reply)| (host, reply.config))
            .collect())
    }

    /// Probes one host directly and returns as soon as it answers.
    pub async fn discover_single(&self, host: &str) -> Result<DeviceConfig, Error> {
        let ip = resolve(host).await?;
        let mut scan = self.scan(&ip, Some(&ip)).await?;

        if let Some(reply) = scan.replies.remove(&ip) {
            let mut config = reply.config;
            config.host = host.to_string();
            return Ok(config);
        }
        if let Some(reason) = scan.unsupported.remove(&ip) {
            return Err(Error::UnsupportedDevice(format!("{host}: {reason}")));
        }
        if self.direct_probe {
            debug!(host, "no discovery reply, probing connection types");
            return self.try_connect_all(host).await;
        }
        Err(Error::Timeout(format!("no discovery reply from {host}")))
    }

    /// Tries every connection type in turn with a basic info query and returns
    /// the configuration of the first one that answers.
    ///
    /// If none answers and at least one failed authentication, that error is
    /// returned.
    pub async fn try_connect_all(&self, host: &str) -> Result<DeviceConfig, Error> {
        let mut auth_error = None;

        for (connection, request) in connection_candidates() {
            let mut config = DeviceConfig::new(host)
                .with_timeout(self.device_timeout)
                .with_connection_type(connection)
                .with_http_client(self.http_client.clone());
            config.port_override = self.connect_port;
            config.credentials = self.credentials.clone();

            let protocol = Protocol::from_config(&config)?.with_retry_policy(RetryPolicy::none());
            debug!(host, connection = %connection, "trying connection type");
            let outcome = protocol.query(&request).await;
            protocol.close().await;

            match outcome {
                Ok(_) => {
                    debug!(host, connection = %connection, "device answered");
                    return Ok(config);
                }
                Err(err @ Error::AuthenticationFailed { .. }) => {
                    warn!(host, connection = %connection, error = %err, "authentication failed");
                    auth_error = Some(err);
                }
                Err(err) => {
                    debug!(host, connection = %connection, error = %err, "no answer");
                }
            }
        }

        Err(auth_error.unwrap_or_else(|| {
            Error::UnsupportedDevice(format!("{host} did not answer any connection type"))
        }))
    }

    async fn key_pair(&self) -> Result<Option<Arc<KeyPair>>, Error> {
        if !self.encrypted {
            return Ok(None);
        }
        let pair = match &self.key_pair {
            Some(pem) => KeyPair::from_pem(pem)?,
            None => tokio::task::spawn_blocking(|| KeyPair::generate(DISCOVERY_KEY_BITS))
                .await
                .map_err(|e| Error::Protocol(format!("key generation task failed: {e}")))??,
        };
        Ok(Some(Arc::new(pair)))
    }

    /// Runs both listeners under one deadline. With `single`, stops at the
    /// first reply from that host and ignores everyone else.
    async fn scan(&self, target: &str, single: Option<&str>) -> Result<Scan, Error> {
        let key_pair = self.key_pair().await?;
        let state = ScanState {
            single: single.map(str::to_string),
            key_pair,
            replies: Mutex::new(HashMap::new()),
            unsupported: Mutex::new(HashMap::new()),
            done: Notify::new(),
            deadline: Instant::now() + self.discovery_timeout,
        };

        let legacy_probe = encrypt_udp(LEGACY_QUERY);
        let tdp_probe = tdp_query(state.key_pair.as_deref());
        let (legacy, tdp) = tokio::join!(
            self.listen(ProbeKind::Legacy, target, &legacy_probe, &state),
            self.listen(ProbeKind::Tdp, target, &tdp_probe, &state),
        );
        legacy?;
        tdp?;

        Ok(Scan {
            replies: state.replies.into_inner().unwrap_or_default(),
            unsupported: state.unsupported.into_inner().unwrap_or_default(),
        })
    }

    fn port(&self, kind: ProbeKind) -> u16 {
        match kind {
            ProbeKind::Legacy => self.legacy_port,
            ProbeKind::Tdp => self.tdp_port,
        }
    }

    async fn listen(
        &self,
        kind: ProbeKind,
        target: &str,
        probe: &[u8],
        state: &ScanState,
    ) -> Result<(), Error> {
        let port = self.port(kind);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let addr = format!("{target}:{port}");

        let mut buf = vec![0u8; 4096];
        let mut probes_sent = 0;
        let mut next_probe = Instant::now();
        loop {
            if state.finished() {
                break;
            }
            let now = Instant::now();
            if now >= state.deadline {
                debug!(port, "discovery timeout reached");
                break;
            }
            if probes_sent < PROBES_PER_LISTENER && now >= next_probe {
                debug!(addr = %addr, bytes = probe.len(), "sending discovery probe");
                socket.send_to(probe, addr.as_str()).await?;
                probes_sent += 1;
                next_probe = now + PROBE_INTERVAL;
            }
            let wake = if probes_sent < PROBES_PER_LISTENER {
                next_probe.min(state.deadline)
            } else {
                state.deadline
            };
            let wait = wake.saturating_duration_since(now);

            tokio::select! {
                _ = state.done.notified(), if state.single.is_some() => break,
                received = timeout(wait, socket.recv_from(&mut buf)) => {
                    match received {
                        Ok(Ok((n, source))) => {
                            self.handle_reply(kind, port, &buf[..n], source, state)
                        }
                        Ok(Err(e)) if is_icmp_error(&e) => {
                            debug!(port, error = %e, "ignoring ICMP error");
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_reply(
        &self,
        kind: ProbeKind,
        port: u16,
        data: &[u8],
        source: SocketAddr,
        state: &ScanState,
    ) {
        let host = source.ip().to_string();
        if state.single.as_deref().is_some_and(|single| single != host) {
            return;
        }
        debug!(host = %host, port, bytes = data.len(), "discovery reply");

        let info = match kind {
            ProbeKind::Legacy => parse_legacy_reply(data),
            ProbeKind::Tdp => parse_tdp_reply(data, state.key_pair.as_deref()),
        };
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                debug!(host = %host, port, error = %err, "undecodable discovery reply");
                return;
            }
        };

        let connection = match kind {
            ProbeKind::Legacy => classify_legacy(&info),
            ProbeKind::Tdp => classify_tdp(&info),
        };
        let connection = match connection {
            Ok(connection) => connection,
            Err(err) => {
                self.report_unsupported(state, host, port, info, err);
                return;
            }
        };

        let mut config = DeviceConfig::new(host.clone())
            .with_timeout(self.device_timeout)
            .with_connection_type(connection)
            .with_http_client(self.http_client.clone());
        config.credentials = self.credentials.clone();
        if connection.encryption_type == EncryptionType::Aes
            && let Some(pair) = &state.key_pair
        {
            config.aes_keys = pair.to_pem().ok();
        }

        let reply = DiscoveryReply {
            host: host.clone(),
            port_found: port,
            info,
            config,
        };
        let recorded = {
            let Ok(mut replies) = state.replies.lock() else {
                return;
            };
            let replace = match replies.get(&host) {
                None => true,
                Some(existing) => kind == ProbeKind::Tdp && existing.port_found == self.legacy_port,
            };
            if replace {
                replies.insert(host.clone(), reply.clone());
            }
            replace
        };
        if !recorded {
            return;
        }

        debug!(host = %host, port, connection = %connection, "discovered device");
        if let Some(handler) = &self.on_discovered {
            handler(&reply);
        }
        if state.single.is_some() {
            state.done.notify_waiters();
        }
    }

    fn report_unsupported(
        &self,
        state: &ScanState,
        host: String,
        port: u16,
        info: Value,
        err: Error,
    ) {
        let first = state
            .unsupported
            .lock()
            .map(|mut seen| seen.insert(host.clone(), err.to_string()).is_none())
            .unwrap_or(false);
        if !first {
            return;
        }
        warn!(host = %host, port, error = %err, "unsupported device");
        if let Some(handler) = &self.on_unsupported {
            handler(&UnsupportedReply {
                host,
                port_found: port,
                info,
                reason: err.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for Discover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discover")
            .field("target", &self.target)
            .field("discovery_timeout", &self.discovery_timeout)
            .field("legacy_port", &self.legacy_port)
            .field("tdp_port", &self.tdp_port)
            .field("encrypted", &self.encrypted)
            .field("direct_probe", &self.direct_probe)
            .finish_non_exhaustive()
    }
}

struct ScanState {
    single: Option<String>,
    key_pair: Option<Arc<KeyPair>>,
    replies: Mutex<HashMap<String, DiscoveryReply>>,
    unsupported: Mutex<HashMap<String, String>>,
    done: Notify,
    deadline: Instant,
}

impl ScanState {
    /// Whether the single host being looked for has answered.
    fn finished(&self) -> bool {
        match &self.single {
            Some(host) => self
                .replies
                .lock()
                .map(|replies| replies.contains_key(host))
                .unwrap_or(false),
            None => false,
        }
    }
}

struct Scan {
    replies: HashMap<String, DiscoveryReply>,
    unsupported: HashMap<String, String>,
}

async fn resolve(host: &str) -> Result<String, Error> {
    let mut addrs = tokio::net::lookup_host((host, 0)).await?;
    addrs
        .next()
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| Error::ConnectionFailed(format!("cannot resolve {host}")))
}

/// Connection types tried by `try_connect_all`, in order, with the request
/// used to check each.
fn connection_candidates() -> Vec<(DeviceConnectionParameters, Value)> {
    let iot_query = json!({"system": {"get_sysinfo": {}}});
    let smart_query = json!("get_device_info");
    let camera_query = json!({"getDeviceInfo": {"device_info": {"name": ["basic_info"]}}});
    vec![
        (
            DeviceConnectionParameters::new(DeviceFamily::IotSmartPlugSwitch, EncryptionType::Xor),
            iot_query.clone(),
        ),
        (
            DeviceConnectionParameters::new(DeviceFamily::IotSmartPlugSwitch, EncryptionType::Klap),
            iot_query,
        ),
        (
            DeviceConnectionParameters::new(DeviceFamily::SmartTapoPlug, EncryptionType::Klap)
                .with_login_version(2),
            smart_query.clone(),
        ),
        (
            DeviceConnectionParameters::new(DeviceFamily::SmartTapoPlug, EncryptionType::Aes)
                .with_login_version(2),
            smart_query,
        ),
        (
            DeviceConnectionParameters::new(DeviceFamily::SmartIpCamera, EncryptionType::Aes)
                .with_login_version(2)
                .with_https(true),
            camera_query,
        ),
    ]
}

/// Decrypts a legacy reply and returns the whole response object.
/// ICMP port-unreachable from an earlier send, reported on the next receive.
fn is_icmp_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}

fn parse_legacy_reply(data: &[u8]) -> Result<Value, Error> {
    Ok(serde_json::from_slice(&decrypt(data))?)
}

/// Returns the `result` object of a TDP reply, with `decrypted_data` added
/// when the reply carried an `encrypt_info` block we can decrypt.
fn parse_tdp_reply(data: &[u8], key_pair: Option<&KeyPair>) -> Result<Value, Error> {
    let payload = data
        .get(TDP_HEADER_LEN..)
        .ok_or_else(|| Error::Protocol(format!("TDP reply too short: {} bytes", data.len())))?;
    let response: TdpResponse = serde_json::from_slice(payload)?;
    if response.error_code != 0 {
        return Err(Error::Protocol(format!(
            "TDP reply has error_code {}",
            response.error_code
        )));
    }
    let mut result = response
        .result
        .ok_or_else(|| Error::Protocol("TDP reply has no result".into()))?;

    if let (Some(pair), Some(encrypt_info)) = (key_pair, result.get("encrypt_info")) {
        match serde_json::from_value::<TdpEncryptInfo>(encrypt_info.clone())
            .map_err(Error::from)
            .and_then(|info| decrypt_encrypt_info(pair, &info))
        {
            Ok(decrypted) => result["decrypted_data"] = decrypted,
            Err(err) => debug!(error = %err, "could not decrypt discovery payload"),
        }
    }
    Ok(result)
}

fn decrypt_encrypt_info(key_pair: &KeyPair, info: &TdpEncryptInfo) -> Result<Value, Error> {
    if info.sym_schm != "AES" {
        return Err(Error::Protocol(format!(
            "unsupported discovery encryption {}",
            info.sym_schm
        )));
    }
    let key_material = key_pair.decrypt_discovery(&b64_decode(&info.key)?)?;
    let plaintext = AesCipher::from_key_material(&key_material)?.decrypt(&info.data)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Legacy replies are always XOR; the family comes from `type` or `mic_type`.
fn classify_legacy(info: &Value) -> Result<DeviceConnectionParameters, Error> {
    let sysinfo = info
        .pointer("/system/get_sysinfo")
        .filter(|v| v.is_object())
        .ok_or_else(|| Error::UnsupportedDevice("legacy reply has no sysinfo".into()))?;
    let family = match sysinfo
        .get("type")
        .or_else(|| sysinfo.get("mic_type"))
        .and_then(Value::as_str)
    {
        None => DeviceFamily::IotSmartPlugSwitch,
        Some(kind) => kind
            .parse::<DeviceFamily>()
            .ok()
            .filter(|family| family.is_iot())
            .ok_or_else(|| Error::UnsupportedDevice(format!("unknown legacy device type {kind}")))?,
    };
    Ok(DeviceConnectionParameters::new(family, EncryptionType::Xor))
}

fn classify_tdp(info: &Value) -> Result<DeviceConnectionParameters, Error> {
    let device: TdpDeviceInfo = serde_json::from_value(info.clone())
        .map_err(|e| Error::UnsupportedDevice(format!("unrecognised TDP reply: {e}")))?;
    let family: DeviceFamily = device.device_type.parse()?;
    let scheme = device.mgt_encrypt_schm.as_ref();

    let encryption = scheme
        .and_then(|s| s.encrypt_type.as_deref())
        .or_else(|| device.encrypt_info.as_ref().map(|e| e.sym_schm.as_str()))
        .ok_or_else(|| {
            Error::UnsupportedDevice(format!(
                "{} reply has no encryption scheme",
                device.device_type
            ))
        })?;
    let encryption: EncryptionType = encryption.parse()?;

    let mut connection = DeviceConnectionParameters::new(family, encryption);
    if let Some(scheme) = scheme {
        connection.login_version = scheme.lv;
        connection.https = scheme.is_support_https;
        connection.http_port = scheme.http_port.filter(|&p| p > 0);
    }
    Ok(connection)
}

//! KLAP transport for newer TP-Link Kasa and Tapo devices.
//!
//! KLAP (Kasa Local Authentication Protocol) runs over plain HTTP on port 80.
//!
//! # Protocol Overview
//!
//! 1. **Handshake 1**: client posts 16 random bytes, device answers with its
//!    own 16 bytes plus a proof that it knows the credentials hash
//! 2. **Handshake 2**: client posts its own proof, with the session cookie
//! 3. **Request**: `POST /app/request?seq=N` with `signature ‖ AES-CBC(payload)`
//!
//! Sessions expire after the device-reported `TIMEOUT` (24 h by default); the
//! transport renegotiates 20 minutes early.
//!
//! # Lockout
//!
//! Devices count failed logins. A handshake1 rejected with lockout counters is
//! retried with a fresh seed at most [`MAX_HANDSHAKE1_ATTEMPTS`] times in total,
//! and never once the device reports no remaining attempts.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    Credentials,
    config::{DeviceConfig, EncryptionType},
    crypto::{KlapEncryptionSession, KlapVersion},
    error::Error,
    http::{Endpoint, HttpClient, HttpResponse},
    transport::{Lockout, SESSION_COOKIE_NAME, TIMEOUT_COOKIE_NAME, Transport, session_expiry},
};

/// Default HTTP port for KLAP protocol.
pub const DEFAULT_PORT: u16 = 80;

/// Total handshake1 attempts when the device reports lockout counters.
pub const MAX_HANDSHAKE1_ATTEMPTS: usize = 3;

const CONTENT_TYPE: &str = "application/octet-stream";

struct KlapSession {
    cipher: KlapEncryptionSession,
    cookie: Option<String>,
    expires_at: Instant,
}

/// Transport using the KLAP protocol over HTTP.
///
/// # Example
///
/// ```no_run
/// use kasa_protocol::{
///     Credentials, DeviceConfig, DeviceConnectionParameters, DeviceFamily, EncryptionType,
///     crypto::KlapVersion,
///     transport::{KlapTransport, Transport},
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DeviceConfig::new("192.168.1.100")
///         .with_connection_type(DeviceConnectionParameters::new(
///             DeviceFamily::SmartTapoPlug,
///             EncryptionType::Klap,
///         ))
///         .with_credentials(Credentials::new("user@example.com", "password"));
///     let mut transport = KlapTransport::new(&config, KlapVersion::V2)?;
///
///     let response = transport
///         .send(r#"{"method":"get_device_info","requestID":1}"#)
///         .await?;
///     println!("{}", response);
///     Ok(())
/// }
/// ```
pub struct KlapTransport {
    endpoint: Endpoint,
    client: HttpClient,
    version: KlapVersion,
    auth_hash: Vec<u8>,
    anonymous: bool,
    session: Option<KlapSession>,
}

impl KlapTransport {
    /// Creates an unconnected transport.
    ///
    /// A `credentials_hash` in the configuration takes precedence over the
    /// credentials; with neither, the blank pair is used.
    pub fn new(config: &DeviceConfig, version: KlapVersion) -> Result<Self, Error> {
        let (auth_hash, anonymous) = match (&config.credentials_hash, &config.credentials) {
            (Some(hash), _) => {
                let decoded = STANDARD
                    .decode(hash)
                    .map_err(|e| Error::Config(format!("invalid credentials hash: {e}")))?;
                (decoded, false)
            }
            (None, Some(credentials)) => (version.auth_hash(credentials), credentials.is_blank()),
            (None, None) => (version.auth_hash(&Credentials::blank()), true),
        };

        Ok(Self {
            endpoint: Endpoint {
                host: config.host.clone(),
                port: config
                    .port_override
                    .or(config.connection_type.http_port)
                    .unwrap_or(DEFAULT_PORT),
                https: false,
                timeout: config.timeout,
            },
            client: config.http_client.clone().unwrap_or_default(),
            version,
            auth_hash,
            anonymous,
            session: None,
        })
    }

    pub fn version(&self) -> KlapVersion {
        self.version
    }

    fn has_live_session(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| Instant::now() < s.expires_at)
    }

    async fn post(
        &self,
        path: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        self.client
            .post(&self.endpoint, path, CONTENT_TYPE, body, cookie)
            .await
    }

    async fn handshake(&mut self) -> Result<(), Error> {
        self.session = None;
        let host = self.endpoint.host.clone();
        let port = self.endpoint.port;

        let (local_seed, remote_seed, proof, response) = self.handshake1().await?;
        let cookie = response
            .cookie(SESSION_COOKIE_NAME)
            .map(|v| format!("{SESSION_COOKIE_NAME}={v}"));

        let auth_hash = self.matching_auth_hash(&local_seed, &remote_seed, &proof)?;

        let payload = self
            .version
            .handshake2_payload(&local_seed, &remote_seed, &auth_hash);
        debug!(host = %host, port, "performing KLAP handshake2");
        let response2 = self
            .post("/app/handshake2", &payload, cookie.as_deref())
            .await?;
        if response2.status != 200 {
            return Err(Error::auth(format!(
                "handshake2 returned status {}",
                response2.status
            )));
        }

        self.session = Some(KlapSession {
            cipher: KlapEncryptionSession::new(&local_seed, &remote_seed, &auth_hash),
            cookie,
            expires_at: session_expiry(response.cookie(TIMEOUT_COOKIE_NAME)),
        });
        debug!(host = %host, port, version = ?self.version, "KLAP handshake completed");
        Ok(())
    }

    /// Posts handshake1 until the device answers 200, retrying only while it
    /// reports lockout counters.
    async fn handshake1(&self) -> Result<([u8; 16], [u8; 16], [u8; 32], HttpResponse), Error> {
        let host = self.endpoint.host.as_str();
        let port = self.endpoint.port;
        let mut last_lockout = Lockout::default();

        for attempt in 1..=MAX_HANDSHAKE1_ATTEMPTS {
            let mut local_seed = [0u8; 16];
            rand::rng().fill_bytes(&mut local_seed);

            debug!(host, port, attempt, "performing KLAP handshake1");
            let response = self.post("/app/handshake1", &local_seed, None).await?;

            if response.status == 200 {
                if response.body.len() != 48 {
                    return Err(Error::Protocol(format!(
                        "handshake1 response has length {} (expected 48)",
                        response.body.len()
                    )));
                }
                let mut remote_seed = [0u8; 16];
                let mut proof = [0u8; 32];
                remote_seed.copy_from_slice(&response.body[..16]);
                proof.copy_from_slice(&response.body[16..48]);
                return Ok((local_seed, remote_seed, proof, response));
            }

            let lockout = serde_json::from_slice::<Value>(&response.body)
                .ok()
                .as_ref()
                .and_then(Lockout::from_json);
            let Some(lockout) = lockout else {
                return Err(Error::Protocol(format!(
                    "handshake1 returned status {}",
                    response.status
                )));
            };

            warn!(
                host,
                port,
                attempt,
                failed_attempts = ?lockout.failed_attempts,
                remaining_attempts = ?lockout.remaining_attempts,
                "device rejected handshake1"
            );
            if lockout.remaining_attempts == Some(0) {
                return Err(lockout.into_error(
                    "device locked out further login attempts",
                ));
            }
            last_lockout = lockout;
        }

        Err(last_lockout.into_error(format!(
            "handshake1 rejected {MAX_HANDSHAKE1_ATTEMPTS} times"
        )))
    }

    /// Returns the auth hash that reproduces the device's proof: the configured
    /// one, or the version's default credentials.
    fn matching_auth_hash(
        &self,
        local_seed: &[u8; 16],
        remote_seed: &[u8; 16],
        proof: &[u8; 32],
    ) -> Result<Vec<u8>, Error> {
        if self
            .version
            .handshake1_proof(local_seed, remote_seed, &self.auth_hash)
            == *proof
        {
            return Ok(self.auth_hash.clone());
        }

        let default = self.version.default_credentials();
        let default_hash = self.version.auth_hash(&default.credentials());
        if self
            .version
            .handshake1_proof(local_seed, remote_seed, &default_hash)
            == *proof
        {
            warn!(
                host = %self.endpoint.host,
                credentials = default.label(),
                "device accepted default credentials"
            );
            return Ok(default_hash);
        }

        Err(Error::auth(
            "KLAP handshake1 proof did not match the configured or default credentials",
        ))
    }

    async fn request(&mut self, request: &str) -> Result<String, Error> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Protocol("no KLAP session".into()))?;
        let (body, seq) = session.cipher.encrypt(request.as_bytes());
        let cookie = session.cookie.clone();

        let path = format!("/app/request?seq={seq}");
        debug!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            seq,
            bytes = body.len(),
            "sending KLAP request"
        );
        let response = self.post(&path, &body, cookie.as_deref()).await?;

        match response.status {
            200 => {}
            403 => {
                self.session = None;
                return Err(Error::SessionRejected(format!(
                    "device rejected KLAP session at seq {seq}"
                )));
            }
            status => {
                self.session = None;
                return Err(Error::Protocol(format!("request returned status {status}")));
            }
        }

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Protocol("no KLAP session".into()))?;
        session.cipher.verify_signature(seq, &response.body)?;
        let plaintext = match session.cipher.decrypt_at(seq, &response.body) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.session = None;
                return Err(err);
            }
        };

        String::from_utf8(plaintext)
            .map_err(|e| Error::Protocol(format!("response is not valid UTF-8: {e}")))
    }
}

#[async_trait]
impl Transport for KlapTransport {
    async fn connect(&mut self) -> Result<(), Error> {
        if !self.has_live_session() {
            self.handshake().await?;
        }
        Ok(())
    }

    async fn send(&mut self, request: &str) -> Result<String, Error> {
        self.connect().await?;
        self.request(request).await
    }

    fn reset(&mut self) {
        self.session = None;
    }

    async fn close(&mut self) {
        self.session = None;
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Klap
    }

    fn host(&self) -> &str {
        &self.endpoint.host
    }

    fn port(&self) -> u16 {
        self.endpoint.port
    }

    fn credentials_hash(&self) -> Option<String> {
        (!self.anonymous).then(|| STANDARD.encode(&self.auth_hash))
    }
}

// Implement Debug manually to avoid exposing sensitive session data
impl std::fmt::Debug for KlapTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapTransport")
            .field("host", &self.endpoint.host)
            .field("port", &self.endpoint.port)
            .field("version", &self.version)
            .field("session", &self.session.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

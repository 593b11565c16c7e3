//! AES passthrough transport for Tapo devices.
//!
//! 1. **Key exchange**: the client posts an RSA public key to `/app`; the device
//!    answers with an AES key and IV encrypted to it, plus a session cookie.
//! 2. **Login**: `login_device` travels through the encrypted passthrough and
//!    returns a token.
//! 3. **Requests**: every payload is AES-CBC encrypted (same key and IV for the
//!    whole session), base64 encoded, and wrapped in a `securePassthrough`
//!    envelope posted to `/app?token=...`.
//!
//! The RSA key pair is generated once per transport and reused when the
//! session is renegotiated.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    Credentials,
    config::{DeviceConfig, EncryptionType},
    credentials::DefaultCredentials,
    crypto::{
        AesCipher, KeyPair,
        aes::b64_decode,
        rsa::{HANDSHAKE_KEY_BITS, KeyPairPem},
    },
    error::{Error, SmartErrorCode},
    http::{Endpoint, HttpClient, HttpResponse},
    transport::{
        Lockout, SESSION_COOKIE_NAME, TIMEOUT_COOKIE_NAME, Transport, request_time_millis,
        session_expiry,
    },
};

/// Default HTTP port for the AES transport.
pub const DEFAULT_PORT: u16 = 80;

const CONTENT_TYPE: &str = "application/json";

/// Where the session stands. Only `Established` sessions carry the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesState {
    Closed,
    KeyExchange,
    Login,
    Established,
}

/// Which credentials are tried, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginOrder {
    /// Configured credentials, then the Tapo default on a login error.
    ExplicitThenTapo,
    /// The camera default pair, then the configured credentials.
    CameraDefaultFirst,
}

/// Hashed `login_device` parameters.
#[derive(Clone)]
pub(crate) struct LoginParams(Value);

impl LoginParams {
    fn from_credentials(credentials: &Credentials, login_version: u32) -> Self {
        let username = STANDARD.encode(sha1_hex(&credentials.username));
        let params = if login_version >= 2 {
            json!({
                "username": username,
                "password2": STANDARD.encode(sha1_hex(credentials.expose_password())),
            })
        } else {
            json!({
                "username": username,
                "password": STANDARD.encode(credentials.expose_password()),
            })
        };
        Self(params)
    }

    fn from_hash(hash: &str) -> Result<Self, Error> {
        let decoded = b64_decode(hash)
            .map_err(|e| Error::Config(format!("invalid credentials hash: {e}")))?;
        let params: Value = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("invalid credentials hash: {e}")))?;
        if !params.is_object() {
            return Err(Error::Config("invalid credentials hash".into()));
        }
        Ok(Self(params))
    }

    fn to_hash(&self) -> String {
        STANDARD.encode(self.0.to_string())
    }
}

fn sha1_hex(value: &str) -> String {
    hex::encode(Sha1::digest(value.as_bytes()))
}

struct AesSession {
    cipher: AesCipher,
    cookie: Option<String>,
    token: Option<String>,
    expires_at: Instant,
}

/// Transport using RSA key exchange and AES passthrough over HTTP.
pub struct AesTransport {
    endpoint: Endpoint,
    client: HttpClient,
    login_version: u32,
    login: Option<LoginParams>,
    login_order: LoginOrder,
    key_pem: Option<KeyPairPem>,
    key_pair: Option<Arc<KeyPair>>,
    state: AesState,
    session: Option<AesSession>,
}

impl AesTransport {
    pub fn new(config: &DeviceConfig) -> Result<Self, Error> {
        let port = config
            .port_override
            .or(config.connection_type.http_port)
            .unwrap_or(DEFAULT_PORT);
        Self::with_options(config, port, false, LoginOrder::ExplicitThenTapo)
    }

    pub(crate) fn with_options(
        config: &DeviceConfig,
        port: u16,
        https: bool,
        login_order: LoginOrder,
    ) -> Result<Self, Error> {
        let login_version = config.connection_type.login_version.unwrap_or(1);
        let login = match (&config.credentials_hash, &config.credentials) {
            (Some(hash), _) => Some(LoginParams::from_hash(hash)?),
            (None, Some(credentials)) if !credentials.is_blank() => {
                Some(LoginParams::from_credentials(credentials, login_version))
            }
            _ => None,
        };

        Ok(Self {
            endpoint: Endpoint {
                host: config.host.clone(),
                port,
                https,
                timeout: config.timeout,
            },
            client: config.http_client.clone().unwrap_or_default(),
            login_version,
            login,
            login_order,
            key_pem: config.aes_keys.clone(),
            key_pair: None,
            state: AesState::Closed,
            session: None,
        })
    }

    pub fn state(&self) -> AesState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn set_endpoint_https(&mut self, https: bool) {
        self.endpoint.https = https;
    }

    fn has_live_session(&self) -> bool {
        self.state == AesState::Established
            && self
                .session
                .as_ref()
                .is_some_and(|s| Instant::now() < s.expires_at)
    }

    /// Request path; the token is only attached to established sessions.
    fn request_path(&self) -> String {
        let token = self.session.as_ref().and_then(|s| s.token.as_ref());
        match (&self.state, token) {
            (AesState::Established, Some(token)) => format!("/app?token={token}"),
            _ => "/app".to_string(),
        }
    }

    async fn key_pair(&mut self) -> Result<Arc<KeyPair>, Error> {
        if let Some(pair) = &self.key_pair {
            return Ok(pair.clone());
        }
        let pair = match &self.key_pem {
            Some(pem) => KeyPair::from_pem(pem)?,
            None => {
                debug!(host = %self.endpoint.host, "generating RSA key pair");
                tokio::task::spawn_blocking(|| KeyPair::generate(HANDSHAKE_KEY_BITS))
                    .await
                    .map_err(|e| Error::Protocol(format!("key generation task failed: {e}")))??
            }
        };
        let pair = Arc::new(pair);
        self.key_pair = Some(pair.clone());
        Ok(pair)
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        let body = serde_json::to_vec(body)?;
        self.client
            .post(&self.endpoint, path, CONTENT_TYPE, &body, cookie)
            .await
    }

    async fn key_exchange(&mut self) -> Result<(), Error> {
        self.session = None;
        self.state = AesState::KeyExchange;
        let key_pair = self.key_pair().await?;

        debug!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            "performing AES key exchange"
        );
        let request = json!({
            "method": "handshake",
            "params": {
                "key": key_pair.public_pem(),
                "request_time_milis": request_time_millis(),
            },
        });
        let response = self.post("/app", &request, None).await?;
        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "key exchange returned status {}",
                response.status
            )));
        }

        let body: Value = serde_json::from_slice(&response.body)?;
        check_error_code(&body, "handshake")?;
        let encrypted_key = body
            .pointer("/result/key")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("handshake response has no key".into()))?;
        let key_material = key_pair.decrypt_handshake(&b64_decode(encrypted_key)?)?;

        let cookie = response
            .cookie(SESSION_COOKIE_NAME)
            .or_else(|| response.cookie("SESSIONID"))
            .map(|v| format!("{SESSION_COOKIE_NAME}={v}"));
        self.session = Some(AesSession {
            cipher: AesCipher::from_key_material(&key_material)?,
            cookie,
            token: None,
            expires_at: session_expiry(response.cookie(TIMEOUT_COOKIE_NAME)),
        });
        self.state = AesState::Login;
        Ok(())
    }

    async fn login(&mut self, params: &LoginParams) -> Result<(), Error> {
        let mut params = params.0.clone();
        if let Some(obj) = params.as_object_mut() {
            obj.insert("request_time_milis".into(), json!(request_time_millis()));
        }
        let request = json!({"method": "login_device", "params": params});
        let response = self.passthrough(&request.to_string()).await?;

        let response: Value = serde_json::from_str(&response)?;
        check_error_code(&response, "login_device")?;
        let token = response
            .pointer("/result/token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("login response has no token".into()))?
            .to_string();

        if let Some(session) = self.session.as_mut() {
            session.token = Some(token);
        }
        self.state = AesState::Established;
        debug!(host = %self.endpoint.host, port = self.endpoint.port, "AES session established");
        Ok(())
    }

    fn login_candidates(&self) -> Vec<(&'static str, LoginParams)> {
        let explicit = self.login.clone().map(|params| ("configured", params));
        let default = |which: DefaultCredentials| {
            (
                which.label(),
                LoginParams::from_credentials(&which.credentials(), self.login_version),
            )
        };
        match self.login_order {
            LoginOrder::ExplicitThenTapo => explicit
                .into_iter()
                .chain(std::iter::once(default(DefaultCredentials::Tapo)))
                .collect(),
            LoginOrder::CameraDefaultFirst => {
                std::iter::once(default(DefaultCredentials::TapoCamera))
                    .chain(explicit)
                    .collect()
            }
        }
    }

    fn should_try_next(&self, err: &Error) -> bool {
        match (self.login_order, err) {
            (
                LoginOrder::ExplicitThenTapo,
                Error::AuthenticationFailed {
                    code: Some(SmartErrorCode::Login),
                    ..
                },
            ) => true,
            (LoginOrder::CameraDefaultFirst, Error::AuthenticationFailed { .. }) => true,
            _ => false,
        }
    }

    async fn establish(&mut self) -> Result<(), Error> {
        let candidates = self.login_candidates();
        let last = candidates.len().saturating_sub(1);

        for (index, (label, params)) in candidates.iter().enumerate() {
            self.key_exchange().await?;
            match self.login(params).await {
                Ok(()) => {
                    debug!(host = %self.endpoint.host, credentials = *label, "logged in");
                    return Ok(());
                }
                Err(err) if index < last && self.should_try_next(&err) => {
                    warn!(
                        host = %self.endpoint.host,
                        credentials = label,
                        error = %err,
                        "login rejected, trying next credentials"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::auth("no credentials to log in with"))
    }

    /// Encrypts `request`, posts it in a passthrough envelope, and returns the
    /// decrypted inner response.
    async fn passthrough(&mut self, request: &str) -> Result<String, Error> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Protocol("no AES session".into()))?;
        let envelope = json!({
            "method": "securePassthrough",
            "params": {"request": session.cipher.encrypt(request.as_bytes())},
        });
        let cookie = session.cookie.clone();
        let path = self.request_path();

        debug!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            bytes = request.len(),
            "sending AES request"
        );
        let response = self.post(&path, &envelope, cookie.as_deref()).await?;
        if response.status != 200 {
            self.reset();
            return Err(Error::Protocol(format!(
                "passthrough returned status {}",
                response.status
            )));
        }

        let body: Value = serde_json::from_slice(&response.body)?;
        if let Err(err) = check_error_code(&body, "securePassthrough") {
            if matches!(
                err,
                Error::AuthenticationFailed { .. } | Error::Retryable(_)
            ) {
                self.session = None;
                self.state = AesState::KeyExchange;
            }
            return Err(err);
        }

        let encoded = body
            .pointer("/result/response")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("passthrough response has no payload".into()))?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::Protocol("no AES session".into()))?;
        let plaintext = match session.cipher.decrypt(encoded) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.reset();
                return Err(err);
            }
        };
        String::from_utf8(plaintext)
            .map_err(|e| Error::Protocol(format!("response is not valid UTF-8: {e}")))
    }
}

/// Raises the envelope's `error_code`, with lockout counters for
/// authentication failures.
fn check_error_code(body: &Value, context: &str) -> Result<(), Error> {
    let code = body.get("error_code").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let code = SmartErrorCode::from_code(code as i32);
    match Error::from_smart_code(code, context) {
        Error::AuthenticationFailed { message, code, .. } => {
            let lockout = Lockout::from_json(body).unwrap_or_default();
            Err(Error::AuthenticationFailed {
                message,
                code,
                failed_attempts: lockout.failed_attempts,
                remaining_attempts: lockout.remaining_attempts,
            })
        }
        other => Err(other),
    }
}

#[async_trait]
impl Transport for AesTransport {
    async fn connect(&mut self) -> Result<(), Error> {
        if !self.has_live_session() {
            self.establish().await?;
        }
        Ok(())
    }

    async fn send(&mut self, request: &str) -> Result<String, Error> {
        self.connect().await?;
        self.passthrough(request).await
    }

    fn reset(&mut self) {
        self.session = None;
        self.state = AesState::KeyExchange;
    }

    async fn close(&mut self) {
        self.session = None;
        self.state = AesState::Closed;
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Aes
    }

    fn host(&self) -> &str {
        &self.endpoint.host
    }

    fn port(&self) -> u16 {
        self.endpoint.port
    }

    fn credentials_hash(&self) -> Option<String> {
        self.login.as_ref().map(LoginParams::to_hash)
    }
}

impl std::fmt::Debug for AesTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesTransport")
            .field("host", &self.endpoint.host)
            .field("port", &self.endpoint.port)
            .field("https", &self.endpoint.https)
            .field("state", &self.state)
            .field("session", &self.session.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::{DeviceConnectionParameters, DeviceFamily},
        testing::{AesDevice, echo_method, test_key_pair},
    };

    fn config(port: u16, credentials: Option<Credentials>) -> DeviceConfig {
        let mut config = DeviceConfig::new("127.0.0.1")
            .with_port(port)
            .with_timeout(Duration::from_secs(2))
            .with_connection_type(DeviceConnectionParameters::new(
                DeviceFamily::SmartTapoPlug,
                EncryptionType::Aes,
            ))
            .with_aes_keys(test_key_pair());
        config.credentials = credentials;
        config
    }

    const DEVICE_INFO: &str = r#"{"method":"get_device_info"}"#;

    fn user() -> Credentials {
        Credentials::new("user@example.com", "hunter2")
    }

    fn login_name(username: &str) -> String {
        STANDARD.encode(sha1_hex(username))
    }

    #[tokio::test]
    async fn test_key_exchange_login_and_request() {
        let device = AesDevice::start(vec![user()], echo_method).await;
        let mut transport = AesTransport::new(&config(device.port(), Some(user()))).unwrap();
        assert_eq!(transport.state(), AesState::Closed);

        for _ in 0..2 {
            let response = transport.send(DEVICE_INFO).await.unwrap();
            let response: Value = serde_json::from_str(&response).unwrap();
            assert_eq!(response["result"]["method"], "get_device_info");
        }
        assert_eq!(transport.state(), AesState::Established);
        assert_eq!(device.handshakes(), 1);
        assert_eq!(device.logins(), vec![login_name("user@example.com")]);
        // Login went out without a token; requests carried it.
        assert_eq!(device.untokened_passthroughs(), 1);
    }

    #[tokio::test]
    async fn test_login_error_retries_once_with_tapo_default() {
        let device =
            AesDevice::start(vec![DefaultCredentials::Tapo.credentials()], echo_method).await;
        let mut transport = AesTransport::new(&config(device.port(), Some(user()))).unwrap();

        transport.send(DEVICE_INFO).await.unwrap();
        assert_eq!(device.handshakes(), 2);
        assert_eq!(
            device.logins(),
            vec![
                login_name("user@example.com"),
                login_name("test@tp-link.net"),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_credentials_surface_lockout() {
        let device = AesDevice::start(vec![Credentials::new("someone", "else")], echo_method)
            .await
            .with_login_lockout(4, 6);
        let mut transport = AesTransport::new(&config(device.port(), Some(user()))).unwrap();

        let err = transport.send("{}").await.unwrap_err();
        match err {
            Error::AuthenticationFailed {
                failed_attempts,
                remaining_attempts,
                ..
            } => {
                assert_eq!(failed_attempts, Some(4));
                assert_eq!(remaining_attempts, Some(6));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Configured pair, then exactly one default.
        assert_eq!(device.logins().len(), 2);
        assert_ne!(transport.state(), AesState::Established);
    }

    #[tokio::test]
    async fn test_session_error_code_resets_to_key_exchange() {
        let device = AesDevice::start(vec![user()], echo_method).await;
        let mut transport = AesTransport::new(&config(device.port(), Some(user()))).unwrap();

        transport.send(r#"{"method":"a"}"#).await.unwrap();
        device.fail_next_passthrough(SmartErrorCode::SessionTimeout.code());
        let err = transport.send(r#"{"method":"b"}"#).await.unwrap_err();
        assert!(matches!(err, Error::Retryable(_)), "{err:?}");
        assert_eq!(transport.state(), AesState::KeyExchange);

        transport.send(r#"{"method":"c"}"#).await.unwrap();
        assert_eq!(device.handshakes(), 2);
    }

    #[tokio::test]
    async fn test_expired_session_renegotiates() {
        let device = AesDevice::start(vec![user()], echo_method)
            .await
            .with_session_timeout(0);
        let mut transport = AesTransport::new(&config(device.port(), Some(user()))).unwrap();

        transport.send(r#"{"method":"a"}"#).await.unwrap();
        transport.send(r#"{"method":"b"}"#).await.unwrap();
        assert_eq!(device.handshakes(), 2);
    }

    #[test]
    fn test_login_params_by_version() {
        let v1 = LoginParams::from_credentials(&user(), 1);
        assert_eq!(v1.0["password"], STANDARD.encode("hunter2"));
        assert!(v1.0.get("password2").is_none());

        let v2 = LoginParams::from_credentials(&user(), 2);
        assert_eq!(v2.0["password2"], STANDARD.encode(sha1_hex("hunter2")));
        assert_eq!(
            v2.0["username"],
            STANDARD.encode(sha1_hex("user@example.com"))
        );
    }

    #[test]
    fn test_credentials_hash_roundtrip() {
        let transport = AesTransport::new(&config(80, Some(user()))).unwrap();
        let hash = transport.credentials_hash().unwrap();

        let restored =
            AesTransport::new(&config(80, None).with_credentials_hash(hash.clone())).unwrap();
        assert_eq!(restored.credentials_hash(), Some(hash));

        let anonymous = AesTransport::new(&config(80, None)).unwrap();
        assert_eq!(anonymous.credentials_hash(), None);
    }
}

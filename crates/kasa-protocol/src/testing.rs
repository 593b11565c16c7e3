//! In-process device stubs for unit tests.
//!
//! Every stub binds to `127.0.0.1:0` and serves from a spawned task for the
//! lifetime of the test runtime. Counters are exposed so tests can assert how
//! many handshakes or requests actually went over the wire.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey, pkcs8::DecodePublicKey, rand_core::OsRng};
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};

use crate::{
    Credentials,
    crypto::{
        AesCipher, KeyPair, KeyPairPem, KlapEncryptionSession, KlapVersion,
        rsa::HANDSHAKE_KEY_BITS,
        xor::{decrypt, encrypt},
    },
};

type JsonHandler = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Returns a port nothing listens on.
pub(crate) async fn unused_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Replies `{"error_code":0,"result":{"method":<method>}}`.
pub(crate) fn echo_method(request: &Value) -> Value {
    json!({"error_code": 0, "result": {"method": request["method"]}})
}

/// A 1024-bit key pair shared by all tests.
pub(crate) fn test_key_pair() -> KeyPairPem {
    static PAIR: OnceLock<KeyPairPem> = OnceLock::new();
    PAIR.get_or_init(|| {
        KeyPair::generate(HANDSHAKE_KEY_BITS)
            .unwrap()
            .to_pem()
            .unwrap()
    })
    .clone()
}

// ---------------------------------------------------------------------------
// XOR over TCP
// ---------------------------------------------------------------------------

#[derive(Default)]
struct XorState {
    connections: AtomicUsize,
    requests: AtomicUsize,
    fragment: AtomicUsize,
    raw_length: Mutex<Option<u32>>,
    first_reply_delay: Mutex<Option<Duration>>,
}

/// Legacy device on a TCP port speaking length-prefixed XOR frames.
pub(crate) struct XorDevice {
    port: u16,
    state: Arc<XorState>,
}

impl XorDevice {
    pub async fn start(handler: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(XorState::default());
        let handler: JsonHandler = Arc::new(handler);

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_xor(stream, shared.clone(), handler.clone()));
            }
        });
        Self { port, state }
    }

    /// Writes every reply in `chunk`-byte segments.
    pub fn fragmented(self, chunk: usize) -> Self {
        self.state.fragment.store(chunk, Ordering::SeqCst);
        self
    }

    /// Announces `len` in the frame header regardless of the payload.
    pub fn with_raw_length(self, len: u32) -> Self {
        *self.state.raw_length.lock().unwrap() = Some(len);
        self
    }

    /// Holds back the first reply of the device's lifetime.
    pub fn with_first_reply_delay(self, delay: Duration) -> Self {
        *self.state.first_reply_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

async fn serve_xor(mut stream: TcpStream, state: Arc<XorState>, handler: JsonHandler) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        state.requests.fetch_add(1, Ordering::SeqCst);

        let request: Value = serde_json::from_slice(&decrypt(&payload)).unwrap_or(Value::Null);
        let mut frame = encrypt(handler(&request).to_string().as_bytes());
        if let Some(len) = *state.raw_length.lock().unwrap() {
            frame[..4].copy_from_slice(&len.to_be_bytes());
        }

        let delay = state.first_reply_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let chunk = state.fragment.load(Ordering::SeqCst);
        if chunk == 0 {
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        } else {
            for part in frame.chunks(chunk) {
                if stream.write_all(part).await.is_err() {
                    return;
                }
                let _ = stream.flush().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// A request as seen by an HTTP stub.
pub(crate) struct StubRequest {
    pub path: String,
    pub cookie: Option<String>,
    pub body: Vec<u8>,
}

impl StubRequest {
    /// Value of the session cookie, if sent.
    pub fn session_cookie(&self) -> Option<&str> {
        self.cookie.as_deref()?.split(';').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            (name.trim() == "TP_SESSIONID").then(|| value.trim())
        })
    }
}

pub(crate) struct StubReply {
    pub status: u16,
    pub body: Vec<u8>,
    pub cookies: Vec<String>,
}

impl StubReply {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            cookies: Vec::new(),
        }
    }

    pub fn json(body: &Value) -> Self {
        Self::ok(body.to_string().into_bytes())
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            cookies: Vec::new(),
        }
    }
}

/// Serves one request per connection, like the devices do.
pub(crate) async fn serve_http(
    handler: impl Fn(StubRequest) -> StubReply + Send + Sync + 'static,
) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let Some(request) = read_http_request(&mut stream).await else {
                    return;
                };
                let reply = handler(request);
                let mut head = format!(
                    "HTTP/1.1 {} STUB\r\nContent-Length: {}\r\n",
                    reply.status,
                    reply.body.len()
                );
                for cookie in &reply.cookies {
                    head.push_str(&format!("Set-Cookie: {cookie}\r\n"));
                }
                head.push_str("\r\n");
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&reply.body).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

async fn read_http_request(stream: &mut TcpStream) -> Option<StubRequest> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.lines();
    let path = lines.next()?.split_whitespace().nth(1)?.to_string();
    let mut content_length = 0;
    let mut cookie = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.trim().parse().ok()?,
            "cookie" => cookie = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);
    Some(StubRequest { path, cookie, body })
}

/// Terminates TLS 1.2 with a self-signed certificate and relays each request
/// to the plain HTTP stub on `backend`.
pub(crate) fn serve_https(backend: u16) -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = tls_server_config();
    std::thread::spawn(move || {
        for tcp in listener.incoming().flatten() {
            let config = config.clone();
            std::thread::spawn(move || relay_tls(config, tcp, backend));
        }
    });
    port
}

/// Accepts connections and never answers.
pub(crate) async fn serve_silent() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

fn tls_server_config() -> Arc<rustls::ServerConfig> {
    static CONFIG: OnceLock<Arc<rustls::ServerConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let rcgen::CertifiedKey { cert, key_pair } =
                rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let key = rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der());
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = rustls::ServerConfig::builder_with_provider(provider)
                .with_protocol_versions(&[&rustls::version::TLS12])
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(vec![cert.der().clone()], key.into())
                .unwrap();
            Arc::new(config)
        })
        .clone()
}

fn relay_tls(config: Arc<rustls::ServerConfig>, tcp: std::net::TcpStream, backend: u16) {
    use std::io::{Read, Write};

    let Ok(conn) = rustls::ServerConnection::new(config) else {
        return;
    };
    let mut tls = rustls::StreamOwned::new(conn, tcp);
    let Some(request) = read_raw_http_request(&mut tls) else {
        return;
    };
    let Ok(mut plain) = std::net::TcpStream::connect(("127.0.0.1", backend)) else {
        return;
    };
    let mut reply = Vec::new();
    if plain.write_all(&request).is_err() || plain.read_to_end(&mut reply).is_err() {
        return;
    }
    let _ = tls.write_all(&reply);
    let _ = tls.flush();
    tls.conn.send_close_notify();
    let _ = tls.conn.complete_io(&mut tls.sock);
}

/// Reads one request, headers and body, as raw bytes.
fn read_raw_http_request(stream: &mut impl std::io::Read) -> Option<Vec<u8>> {
    use std::io::Read;

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..pos]).to_ascii_lowercase();
            let content_length: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            if data.len() >= pos + 4 + content_length {
                return Some(data);
            }
        }
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
    }
}

// ---------------------------------------------------------------------------
// KLAP
// ---------------------------------------------------------------------------

struct KlapState {
    version: KlapVersion,
    auth_hash: Vec<u8>,
    handler: JsonHandler,
    next_cookie: usize,
    pending: Option<(String, [u8; 16], [u8; 16])>,
    session: Option<(String, KlapEncryptionSession)>,
    lockout: VecDeque<Value>,
    session_timeout: u64,
    reject_next: usize,
    corrupt_next: usize,
    handshake1_attempts: usize,
    handshakes: usize,
    requests: usize,
}

/// KLAP device accepting one credential pair.
pub(crate) struct KlapDevice {
    port: u16,
    state: Arc<Mutex<KlapState>>,
}

impl KlapDevice {
    pub async fn start(
        version: KlapVersion,
        credentials: Credentials,
        handler: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        let state = Arc::new(Mutex::new(KlapState {
            version,
            auth_hash: version.auth_hash(&credentials),
            handler: Arc::new(handler),
            next_cookie: 0,
            pending: None,
            session: None,
            lockout: VecDeque::new(),
            session_timeout: 86_400,
            reject_next: 0,
            corrupt_next: 0,
            handshake1_attempts: 0,
            handshakes: 0,
            requests: 0,
        }));
        let shared = state.clone();
        let port =
            serve_http(move |request| klap_reply(&mut shared.lock().unwrap(), request)).await;
        Self { port, state }
    }

    /// Answers the next handshake1 requests with these lockout bodies.
    pub fn with_lockout(self, bodies: Vec<Value>) -> Self {
        self.state.lock().unwrap().lockout = bodies.into();
        self
    }

    /// `TIMEOUT` cookie value, in seconds.
    pub fn with_session_timeout(self, seconds: u64) -> Self {
        self.state.lock().unwrap().session_timeout = seconds;
        self
    }

    /// Answers the next `n` requests with 403.
    pub fn reject_next_requests(&self, n: usize) {
        self.state.lock().unwrap().reject_next = n;
    }

    /// Flips a signature byte in the next `n` replies.
    pub fn corrupt_next_signatures(&self, n: usize) {
        self.state.lock().unwrap().corrupt_next = n;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handshake1_attempts(&self) -> usize {
        self.state.lock().unwrap().handshake1_attempts
    }

    /// Completed handshake2 exchanges.
    pub fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    pub fn requests(&self) -> usize {
        self.state.lock().unwrap().requests
    }
}

fn klap_reply(state: &mut KlapState, request: StubRequest) -> StubReply {
    if request.path == "/app/handshake1" {
        state.handshake1_attempts += 1;
        if let Some(body) = state.lockout.pop_front() {
            return StubReply {
                status: 403,
                body: body.to_string().into_bytes(),
                cookies: Vec::new(),
            };
        }
        let Ok(local_seed) = <[u8; 16]>::try_from(request.body.as_slice()) else {
            return StubReply::status(400);
        };
        let mut remote_seed = [0u8; 16];
        rand::rng().fill_bytes(&mut remote_seed);
        let proof = state
            .version
            .handshake1_proof(&local_seed, &remote_seed, &state.auth_hash);

        state.next_cookie += 1;
        let cookie = format!("KLAP{}", state.next_cookie);
        state.pending = Some((cookie.clone(), local_seed, remote_seed));

        let mut body = remote_seed.to_vec();
        body.extend_from_slice(&proof);
        return StubReply {
            status: 200,
            body,
            cookies: vec![
                format!("TP_SESSIONID={cookie};TIMEOUT={}", state.session_timeout),
            ],
        };
    }

    if request.path == "/app/handshake2" {
        let Some((cookie, local_seed, remote_seed)) = state.pending.take() else {
            return StubReply::status(400);
        };
        let expected = state
            .version
            .handshake2_payload(&local_seed, &remote_seed, &state.auth_hash);
        if request.session_cookie() != Some(cookie.as_str()) || request.body != expected {
            return StubReply::status(403);
        }
        state.handshakes += 1;
        state.session = Some((
            cookie,
            KlapEncryptionSession::new(&local_seed, &remote_seed, &state.auth_hash),
        ));
        return StubReply::status(200);
    }

    let Some(seq) = request
        .path
        .strip_prefix("/app/request?seq=")
        .and_then(|s| s.parse::<i32>().ok())
    else {
        return StubReply::status(404);
    };
    if state.reject_next > 0 {
        state.reject_next -= 1;
        state.session = None;
        return StubReply::status(403);
    }
    let Some((cookie, session)) = state.session.as_ref() else {
        return StubReply::status(403);
    };
    if request.session_cookie() != Some(cookie.as_str())
        || session.verify_signature(seq, &request.body).is_err()
    {
        return StubReply::status(403);
    }
    let Ok(plaintext) = session.decrypt_at(seq, &request.body) else {
        return StubReply::status(400);
    };
    state.requests += 1;

    let request: Value = serde_json::from_slice(&plaintext).unwrap_or(Value::Null);
    let response = (state.handler)(&request);
    let mut body = session.encrypt_at(seq, response.to_string().as_bytes());
    if state.corrupt_next > 0 {
        state.corrupt_next -= 1;
        body[0] ^= 0xff;
    }
    StubReply::ok(body)
}

// ---------------------------------------------------------------------------
// AES passthrough
// ---------------------------------------------------------------------------

struct AesState {
    accepted: Vec<Credentials>,
    handler: JsonHandler,
    cipher: Option<AesCipher>,
    cookie: Option<String>,
    token: Option<String>,
    next_id: usize,
    session_timeout: u64,
    login_lockout: Option<(u32, u32)>,
    fail_next: Option<i32>,
    handshakes: usize,
    logins: Vec<String>,
    untokened_passthroughs: usize,
}

/// AES passthrough device accepting any of the given credential pairs.
pub(crate) struct AesDevice {
    port: u16,
    state: Arc<Mutex<AesState>>,
}

impl AesDevice {
    pub async fn start(
        accepted: Vec<Credentials>,
        handler: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        let state = Arc::new(Mutex::new(AesState {
            accepted,
            handler: Arc::new(handler),
            cipher: None,
            cookie: None,
            token: None,
            next_id: 0,
            session_timeout: 86_400,
            login_lockout: None,
            fail_next: None,
            handshakes: 0,
            logins: Vec::new(),
            untokened_passthroughs: 0,
        }));
        let shared = state.clone();
        let port = serve_http(move |request| aes_reply(&mut shared.lock().unwrap(), request)).await;
        Self { port, state }
    }

    pub fn with_session_timeout(self, seconds: u64) -> Self {
        self.state.lock().unwrap().session_timeout = seconds;
        self
    }

    /// Rejected logins report these lockout counters.
    pub fn with_login_lockout(self, failed: u32, remaining: u32) -> Self {
        self.state.lock().unwrap().login_lockout = Some((failed, remaining));
        self
    }

    /// The next passthrough envelope carries `code` and ends the session.
    pub fn fail_next_passthrough(&self, code: i32) {
        self.state.lock().unwrap().fail_next = Some(code);
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    /// Hashed usernames of every login attempt, in order.
    pub fn logins(&self) -> Vec<String> {
        self.state.lock().unwrap().logins.clone()
    }

    /// Passthrough requests posted without a token.
    pub fn untokened_passthroughs(&self) -> usize {
        self.state.lock().unwrap().untokened_passthroughs
    }
}

fn b64_sha1_hex(value: &str) -> String {
    STANDARD.encode(hex::encode(Sha1::digest(value.as_bytes())))
}

fn aes_login_accepted(accepted: &[Credentials], params: &Value) -> bool {
    accepted.iter().any(|c| {
        params["username"] == b64_sha1_hex(&c.username)
            && (params["password"] == STANDARD.encode(c.expose_password())
                || params["password2"] == b64_sha1_hex(c.expose_password()))
    })
}

fn aes_reply(state: &mut AesState, request: StubRequest) -> StubReply {
    let Ok(envelope) = serde_json::from_slice::<Value>(&request.body) else {
        return StubReply::status(400);
    };

    if envelope["method"] == "handshake" {
        let Some(public_key) = envelope["params"]["key"]
            .as_str()
            .and_then(|pem| RsaPublicKey::from_public_key_pem(pem).ok())
        else {
            return StubReply::json(&json!({"error_code": -1010}));
        };
        let mut material = [0u8; 32];
        rand::rng().fill_bytes(&mut material);
        let encrypted = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &material)
            .unwrap();

        state.handshakes += 1;
        state.next_id += 1;
        let cookie = format!("AES{}", state.next_id);
        state.cipher = AesCipher::from_key_material(&material).ok();
        state.cookie = Some(cookie.clone());
        state.token = None;
        return StubReply {
            status: 200,
            body: json!({"error_code": 0, "result": {"key": STANDARD.encode(encrypted)}})
                .to_string()
                .into_bytes(),
            cookies: vec![format!(
                "TP_SESSIONID={cookie};TIMEOUT={}",
                state.session_timeout
            )],
        };
    }

    if envelope["method"] != "securePassthrough" {
        return StubReply::json(&json!({"error_code": -1002}));
    }
    if let Some(code) = state.fail_next.take() {
        state.cipher = None;
        return StubReply::json(&json!({"error_code": code}));
    }
    let (Some(cipher), Some(cookie)) = (state.cipher.clone(), state.cookie.clone()) else {
        return StubReply::json(&json!({"error_code": 9999}));
    };
    if request.session_cookie() != Some(cookie.as_str()) {
        return StubReply::json(&json!({"error_code": 9999}));
    }
    let Some(inner) = envelope["params"]["request"]
        .as_str()
        .and_then(|r| cipher.decrypt(r).ok())
        .and_then(|plain| serde_json::from_slice::<Value>(&plain).ok())
    else {
        return StubReply::json(&json!({"error_code": -1005}));
    };

    let token = request
        .path
        .split_once("?token=")
        .map(|(_, token)| token.to_string());
    let response = match token {
        None => {
            state.untokened_passthroughs += 1;
            if inner["method"] != "login_device" {
                return StubReply::json(&json!({"error_code": -1501}));
            }
            let params = &inner["params"];
            state
                .logins
                .push(params["username"].as_str().unwrap_or_default().to_string());
            if aes_login_accepted(&state.accepted, params) {
                state.next_id += 1;
                let token = format!("TOKEN{}", state.next_id);
                state.token = Some(token.clone());
                json!({"error_code": 0, "result": {"token": token}})
            } else {
                match state.login_lockout {
                    Some((failed, remaining)) => json!({
                        "error_code": -1501,
                        "result": {"data": {"failedAttempts": failed, "remainAttempts": remaining}},
                    }),
                    None => json!({"error_code": -1501}),
                }
            }
        }
        Some(token) if state.token.as_deref() == Some(token.as_str()) => (state.handler)(&inner),
        Some(_) => return StubReply::json(&json!({"error_code": 9999})),
    };

    StubReply::json(&json!({
        "error_code": 0,
        "result": {"response": cipher.encrypt(response.to_string().as_bytes())},
    }))
}

// ---------------------------------------------------------------------------
// SMART request handling
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SmartState {
    multi_disabled: bool,
    dropped: HashMap<String, usize>,
    errors: HashMap<String, i32>,
    children: Vec<Value>,
    page_size: usize,
    batches: Vec<usize>,
    singles: Vec<String>,
}

/// SMART device logic, pluggable into any transport stub.
#[derive(Clone, Default)]
pub(crate) struct SmartDevice {
    state: Arc<Mutex<SmartState>>,
}

impl SmartDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `multipleRequest` with an unknown method error.
    pub fn without_multi(self) -> Self {
        self.state.lock().unwrap().multi_disabled = true;
        self
    }

    /// Leaves `method` out of the next `times` batch responses.
    pub fn dropping(self, method: &str, times: usize) -> Self {
        self.state
            .lock()
            .unwrap()
            .dropped
            .insert(method.to_string(), times);
        self
    }

    /// Answers `method` with an error code.
    pub fn failing(self, method: &str, code: i32) -> Self {
        self.state
            .lock()
            .unwrap()
            .errors
            .insert(method.to_string(), code);
        self
    }

    /// Serves `count` children from `get_child_device_list`, `page_size` at a
    /// time.
    pub fn with_children(self, count: usize, page_size: usize) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.children = (0..count)
                .map(|i| json!({"device_id": format!("child-{i}")}))
                .collect();
            state.page_size = page_size;
        }
        self
    }

    /// Sizes of every `multipleRequest` received.
    pub fn batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Methods received outside of `multipleRequest`.
    pub fn singles(&self) -> Vec<String> {
        self.state.lock().unwrap().singles.clone()
    }

    pub fn handler(&self) -> impl Fn(&Value) -> Value + Send + Sync + 'static {
        let state = self.state.clone();
        move |request| smart_reply(&mut state.lock().unwrap(), request)
    }
}

fn smart_method_result(state: &SmartState, method: &str, params: &Value) -> Result<Value, i32> {
    if let Some(code) = state.errors.get(method) {
        return Err(*code);
    }
    if method == "get_child_device_list" && state.page_size > 0 {
        let start = params["start_index"].as_u64().unwrap_or(0) as usize;
        let page: Vec<Value> = state
            .children
            .iter()
            .skip(start)
            .take(state.page_size)
            .cloned()
            .collect();
        return Ok(json!({
            "child_device_list": page,
            "start_index": start,
            "sum": state.children.len(),
        }));
    }
    Ok(json!({"method": method, "params": params}))
}

fn smart_reply(state: &mut SmartState, request: &Value) -> Value {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    if method != "multipleRequest" {
        state.singles.push(method.clone());
        return match smart_method_result(state, &method, &request["params"]) {
            Ok(result) => json!({"error_code": 0, "result": result}),
            Err(code) => json!({"error_code": code}),
        };
    }
    if state.multi_disabled {
        return json!({"error_code": -1002});
    }

    let requests = request["params"]["requests"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    state.batches.push(requests.len());

    let mut responses = Vec::new();
    for entry in &requests {
        let method = entry["method"].as_str().unwrap_or_default();
        if let Some(times) = state.dropped.get_mut(method)
            && *times > 0
        {
            *times -= 1;
            continue;
        }
        responses.push(match smart_method_result(state, method, &entry["params"]) {
            Ok(result) => json!({"method": method, "error_code": 0, "result": result}),
            Err(code) => json!({"method": method, "error_code": code}),
        });
    }
    json!({"error_code": 0, "result": {"responses": responses}})
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// UDP responder; replies to each datagram with whatever `handler` returns.
pub(crate) struct UdpDevice {
    port: u16,
    probes: Arc<AtomicUsize>,
}

impl UdpDevice {
    pub async fn start(handler: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let probes = Arc::new(AtomicUsize::new(0));

        let counter = probes.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = handler(&buf[..n]) {
                    let _ = socket.send_to(&reply, peer).await;
                }
            }
        });
        Self { port, probes }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

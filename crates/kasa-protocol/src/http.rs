//! Minimal HTTP/1.1 client for device endpoints.
//!
//! TP-Link devices run a non-compliant HTTP server that rejects lowercase
//! header names, which every mainstream Rust HTTP client emits. Requests are
//! therefore written by hand with title-case headers over a plain tokio
//! `TcpStream`, or over a blocking rustls stream for HTTPS devices.
//!
//! One TCP connection is used per request. The session state lives in cookies
//! and in the transports, not in the connection.

use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Error;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub timeout: Duration,
}

/// A parsed HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// `Set-Cookie` name/value pairs, attributes stripped.
    pub cookies: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Cloneable handle shared by transports; owns the TLS configuration.
#[derive(Debug, Clone, Default)]
pub struct HttpClient {
    tls: Arc<OnceLock<Arc<rustls::ClientConfig>>>,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a POST request and returns the response, whatever its status.
    pub async fn post(
        &self,
        endpoint: &Endpoint,
        path: &str,
        content_type: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        let request = build_request(endpoint, path, content_type, body, cookie);
        debug!(
            host = %endpoint.host,
            port = endpoint.port,
            path,
            bytes = body.len(),
            https = endpoint.https,
            "http post"
        );

        if endpoint.https {
            let tls = match self.tls.get() {
                Some(tls) => tls.clone(),
                None => {
                    let tls = tls_config()?;
                    let _ = self.tls.set(tls.clone());
                    tls
                }
            };
            let endpoint = endpoint.clone();
            tokio::task::spawn_blocking(move || send_https(&endpoint, &request, tls))
                .await
                .map_err(|e| Error::ConnectionFailed(format!("TLS task failed: {e}")))?
        } else {
            timeout(endpoint.timeout, send_http(endpoint, &request))
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "{}:{}{path} timed out",
                        endpoint.host, endpoint.port
                    ))
                })?
        }
    }
}

fn build_request(
    endpoint: &Endpoint,
    path: &str,
    content_type: &str,
    body: &[u8],
    cookie: Option<&str>,
) -> Vec<u8> {
    let mut head = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Accept: */*\r\n\
         Connection: close\r\n",
        endpoint.host,
        endpoint.port,
        body.len()
    );
    if let Some(cookie) = cookie {
        head.push_str("Cookie: ");
        head.push_str(cookie);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut request = head.into_bytes();
    request.extend_from_slice(body);
    request
}

async fn send_http(endpoint: &Endpoint, request: &[u8]) -> Result<HttpResponse, Error> {
    let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    stream.write_all(request).await?;

    let mut response = Vec::with_capacity(1024);
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if is_complete(&response) {
            break;
        }
    }
    parse_response(&response)
}

fn send_https(
    endpoint: &Endpoint,
    request: &[u8],
    tls: Arc<rustls::ClientConfig>,
) -> Result<HttpResponse, Error> {
    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("cannot resolve {}", endpoint.host)))?;
    let mut tcp = std::net::TcpStream::connect_timeout(&addr, endpoint.timeout)?;
    tcp.set_read_timeout(Some(endpoint.timeout))?;
    tcp.set_write_timeout(Some(endpoint.timeout))?;

    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| Error::Config(format!("invalid server name {}", endpoint.host)))?;
    let mut conn = rustls::ClientConnection::new(tls, server_name)
        .map_err(|e| Error::ConnectionFailed(format!("TLS setup failed: {e}")))?;
    let mut stream = rustls::Stream::new(&mut conn, &mut tcp);

    stream.write_all(request).map_err(blocking_io_error)?;
    stream.flush().map_err(blocking_io_error)?;

    let mut response = Vec::with_capacity(4096);
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            // Devices often drop the socket without close_notify.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(blocking_io_error(e)),
        }
        if is_complete(&response) {
            break;
        }
    }
    parse_response(&response)
}

fn blocking_io_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            Error::Timeout(err.to_string())
        }
        _ => err.into(),
    }
}

/// TLS 1.2 only, any certificate accepted. Devices ship self-signed
/// certificates and do not negotiate TLS 1.3.
fn tls_config() -> Result<Arc<rustls::ClientConfig>, Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct AcceptAnyCertificate;

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
            ]
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| Error::Config(format!("TLS configuration failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_code(headers: &str) -> Option<u16> {
    headers
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn parse_content_length(headers: &str) -> Option<usize> {
    header_values(headers, "content-length").find_map(|v| v.parse().ok())
}

fn header_values<'a>(headers: &'a str, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers.lines().skip(1).filter_map(move |line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Standard `Set-Cookie` attributes; anything else in the header is a cookie.
const COOKIE_ATTRIBUTES: &[&str] = &["path", "domain", "expires", "max-age", "samesite"];

/// Devices pack several cookies into one header
/// (`TP_SESSIONID=...;TIMEOUT=86400`), so every `name=value` pair counts.
fn parse_cookies(headers: &str) -> Vec<(String, String)> {
    header_values(headers, "set-cookie")
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() || COOKIE_ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str()) {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Whether a buffer holds a full response. Without `Content-Length` the body
/// runs until the peer closes the connection.
fn is_complete(data: &[u8]) -> bool {
    let Some(header_end) = find_header_end(data) else {
        return false;
    };
    let headers = String::from_utf8_lossy(&data[..header_end]);
    match parse_content_length(&headers) {
        Some(len) => data.len() >= header_end + 4 + len,
        None => false,
    }
}

fn parse_response(data: &[u8]) -> Result<HttpResponse, Error> {
    let header_end = find_header_end(data)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no header end".into()))?;
    let headers = String::from_utf8_lossy(&data[..header_end]);
    let status = parse_status_code(&headers)
        .ok_or_else(|| Error::Protocol("invalid HTTP response: no status code".into()))?;

    let body_start = header_end + 4;
    let mut body = data[body_start..].to_vec();
    if let Some(len) = parse_content_length(&headers) {
        body.truncate(len);
    }

    Ok(HttpResponse {
        status,
        body,
        cookies: parse_cookies(&headers),
    })
}

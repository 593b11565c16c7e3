//! Legacy XOR transport for older TP-Link Kasa devices.
//!
//! - TCP on port 9999
//! - 4-byte big-endian length header, then the XOR-obfuscated JSON
//! - no authentication
//!
//! The connection is kept open between requests. Very old firmware closes the
//! socket after every reply; [`XorTransport::single_shot`] opens a fresh
//! connection per request for those.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::{
    config::{DeviceConfig, EncryptionType},
    crypto::xor::{XorCipher, encrypt},
    error::Error,
    transport::Transport,
};

/// Default port for legacy TP-Link Smart Home Protocol.
pub const DEFAULT_PORT: u16 = 9999;

/// Frames larger than this are rejected.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Transport using the legacy XOR protocol over TCP.
///
/// # Example
///
/// ```no_run
/// use kasa_protocol::transport::{Transport, XorTransport};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut transport = XorTransport::new("192.168.1.100", 9999, Duration::from_secs(10));
///     let response = transport.send(r#"{"system":{"get_sysinfo":{}}}"#).await?;
///     println!("{}", response);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct XorTransport {
    host: String,
    port: u16,
    timeout: Duration,
    single_shot: bool,
    stream: Option<TcpStream>,
}

impl XorTransport {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            single_shot: false,
            stream: None,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(
            config.host.clone(),
            config.port_override.unwrap_or(DEFAULT_PORT),
            config.timeout,
        )
    }

    /// Opens a new connection for every request.
    ///
    /// Not reachable from [`DeviceConfig`]; construct the transport directly
    /// for firmware that closes the socket after each reply.
    pub fn single_shot(mut self) -> Self {
        self.single_shot = true;
        self
    }

    async fn open(&self) -> Result<TcpStream, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!(addr = %addr, "connecting");
        let stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("connection to {addr} timed out")))??;
        Ok(stream)
    }

    /// Sends one frame and reads its reply. The stream is owned by the caller
    /// for the duration, so a cancelled exchange drops the socket along with
    /// the unread reply.
    async fn exchange(&self, stream: &mut TcpStream, request: &str) -> Result<String, Error> {
        let io_timeout = self.timeout;
        let frame = encrypt(request.as_bytes());

        debug!(bytes = frame.len(), "sending request");
        timeout(io_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| Error::Timeout("write timed out".into()))??;

        let mut len_buf = [0u8; 4];
        timeout(io_timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| Error::Timeout("read timed out".into()))??;

        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "response too large: {payload_len} bytes"
            )));
        }

        // Firmware may split one frame across several segments.
        let mut cipher = XorCipher::new();
        let mut payload = Vec::with_capacity(payload_len);
        let mut buf = [0u8; 4096];
        while payload.len() < payload_len {
            let want = (payload_len - payload.len()).min(buf.len());
            let n = timeout(io_timeout, stream.read(&mut buf[..want]))
                .await
                .map_err(|_| Error::Timeout("read timed out".into()))??;
            if n == 0 {
                return Err(Error::ConnectionFailed(format!(
                    "connection closed after {} of {payload_len} bytes",
                    payload.len()
                )));
            }
            cipher.decrypt_in_place(&mut buf[..n]);
            payload.extend_from_slice(&buf[..n]);
        }

        debug!(bytes = payload_len, "received response");
        String::from_utf8(payload)
            .map_err(|e| Error::Protocol(format!("response is not valid UTF-8: {e}")))
    }
}

#[async_trait]
impl Transport for XorTransport {
    async fn connect(&mut self) -> Result<(), Error> {
        if !self.single_shot && self.stream.is_none() {
            self.stream = Some(self.open().await?);
        }
        Ok(())
    }

    async fn send(&mut self, request: &str) -> Result<String, Error> {
        // Out of `self` while in flight; only a clean exchange puts it back.
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.open().await?,
        };
        let response = self.exchange(&mut stream, request).await?;
        if !self.single_shot {
            self.stream = Some(stream);
        }
        Ok(response)
    }

    fn reset(&mut self) {
        self.stream = None;
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Xor
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn credentials_hash(&self) -> Option<String> {
        None
    }
}

//! AES passthrough over HTTPS, used by Tapo cameras and hubs.
//!
//! The message flow is the one of [`AesTransport`]. Two things differ: the
//! channel is TLS 1.2 on port 443 (self-signed certificates accepted), and
//! the camera default credentials are tried before the configured ones.

use async_trait::async_trait;

use crate::{
    config::{DeviceConfig, EncryptionType},
    error::Error,
    transport::{
        Transport,
        aes::{AesState, AesTransport, LoginOrder},
    },
};

/// Default HTTPS port.
pub const DEFAULT_PORT: u16 = 443;

#[derive(Debug)]
pub struct SslAesTransport {
    inner: AesTransport,
}

impl SslAesTransport {
    pub fn new(config: &DeviceConfig) -> Result<Self, Error> {
        let port = config
            .port_override
            .or(config.connection_type.http_port)
            .unwrap_or(DEFAULT_PORT);
        let inner =
            AesTransport::with_options(config, port, true, LoginOrder::CameraDefaultFirst)?;
        Ok(Self { inner })
    }

    pub fn state(&self) -> AesState {
        self.inner.state()
    }

    /// Speaks plain HTTP so tests can use an in-process device.
    #[cfg(test)]
    fn without_tls(mut self) -> Self {
        self.inner.set_endpoint_https(false);
        self
    }
}

#[async_trait]
impl Transport for SslAesTransport {
    async fn connect(&mut self) -> Result<(), Error> {
        self.inner.connect().await
    }

    async fn send(&mut self, request: &str) -> Result<String, Error> {
        self.inner.send(request).await
    }

    fn reset(&mut self) {
        self.inner.reset()
    }

    async fn close(&mut self) {
        self.inner.close().await
    }

    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Aes
    }

    fn host(&self) -> &str {
        self.inner.host()
    }

    fn port(&self) -> u16 {
        self.inner.port()
    }

    fn credentials_hash(&self) -> Option<String> {
        self.inner.credentials_hash()
    }
}

// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client helpers for dialing croupier tiers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::frame::{BiStream, Frame, FrameError, FramedStream};

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("read error: {0}")]
    Read(#[from] quinn::ReadExactError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("no connection established")]
    NotConnected,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),
}

impl ClientError {
    /// Transport-level failures are safe to retry; anything carrying an
    /// application response is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection(_)
            | ClientError::Connect(_)
            | ClientError::Write(_)
            | ClientError::Read(_)
            | ClientError::Io(_)
            | ClientError::ClosedStream(_)
            | ClientError::NotConnected
            | ClientError::Timeout(_) => true,
            ClientError::Frame(FrameError::ConnectionClosed) => true,
            ClientError::Frame(_) | ClientError::Tls(_) => false,
        }
    }
}

/// Client-side deadline and retry behavior for unary calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Per-call deadline.
    pub call_timeout: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// First backoff; doubles per attempt.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct CroupierClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Server name for TLS verification (use "localhost" for local dev)
    pub server_name: String,
    /// Skip certificate verification (for development only!)
    pub dangerous_skip_cert_verification: bool,
    /// CA bundle (PEM) used to verify the server instead of the system roots
    pub ca_pem: Vec<u8>,
    /// Client certificate chain (PEM) presented for mTLS, empty to disable
    pub cert_pem: Vec<u8>,
    /// Client private key (PEM), required when `cert_pem` is set
    pub key_pem: Vec<u8>,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for CroupierClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7101".parse().unwrap(),
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            ca_pem: Vec::new(),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 600_000, // 10 minutes, matches long-lived tunnel dials
            connect_timeout_ms: 10_000,
        }
    }
}

/// QUIC client for talking to a croupier tier.
///
/// Holds at most one connection and reuses it across requests; each request
/// opens its own bidirectional stream.
pub struct CroupierClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: CroupierClientConfig,
}

impl CroupierClient {
    /// Create a new client with the given configuration
    pub fn new(config: CroupierClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    /// Create a client with default configuration for local development
    pub fn localhost(server_addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(CroupierClientConfig {
            server_addr,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    fn build_client_config(config: &CroupierClientConfig) -> Result<ClientConfig, ClientError> {
        let builder = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        } else if !config.ca_pem.is_empty() {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut config.ca_pem.as_slice()) {
                let cert = cert.map_err(|e| ClientError::Tls(format!("bad CA bundle: {}", e)))?;
                roots
                    .add(cert)
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
            }
            rustls::ClientConfig::builder().with_root_certificates(roots)
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let crypto = if config.cert_pem.is_empty() {
            builder.with_no_client_auth()
        } else {
            let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ClientError::Tls(format!("bad client certificate: {}", e)))?;
            let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
                .map_err(|e| ClientError::Tls(format!("bad client key: {}", e)))?
                .ok_or_else(|| ClientError::Tls("no client private key found".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(e.to_string()))?
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?,
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Connect to the server, reusing an existing healthy connection
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard
            && conn.close_reason().is_none()
        {
            debug!("reusing existing connection");
            return Ok(());
        }

        info!(addr = %self.config.server_addr, "dialing");

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        debug!("connected");
        *conn_guard = Some(connection);
        Ok(())
    }

    /// Get the current connection, connecting if necessary
    async fn get_connection(&self) -> Result<Connection, ClientError> {
        self.connect().await?;
        let conn_guard = self.connection.lock().await;
        conn_guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Open a new bidirectional stream for a request/response
    pub async fn open_stream(&self) -> Result<FramedStream<BiStream>, ClientError> {
        let conn = self.get_connection().await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(FramedStream::new(BiStream::new(send, recv)))
    }

    /// Open a raw bidirectional stream, for the tunnel and for job event
    /// streams.
    pub async fn open_raw_stream(
        &self,
    ) -> Result<(quinn::SendStream, quinn::RecvStream), ClientError> {
        let conn = self.get_connection().await?;
        Ok(conn.open_bi().await?)
    }

    /// Send a request and receive a response using a new stream
    #[instrument(skip(self, request))]
    pub async fn request<Req: prost::Message, Resp: prost::Message + Default>(
        &self,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let conn = self.get_connection().await?;
        let (mut send, mut recv) = conn.open_bi().await?;

        let frame = Frame::request(request)?;
        crate::frame::write_frame(&mut send, &frame).await?;
        send.finish()?;

        let response_frame = crate::frame::read_frame(&mut recv).await?;
        Ok(response_frame.decode()?)
    }

    /// Send a request under a deadline, retrying transport failures with
    /// exponential backoff.
    ///
    /// Application-level errors (an `RpcResponse` carrying an error variant)
    /// decode fine and are never retried here.
    pub async fn request_with_retry<Req: prost::Message, Resp: prost::Message + Default>(
        &self,
        request: &Req,
        policy: &RetryPolicy,
    ) -> Result<Resp, ClientError> {
        let attempts = policy.max_attempts.max(1);
        let mut backoff = policy.base_backoff;
        let mut last_err = ClientError::NotConnected;

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(policy.call_timeout, self.request(request)).await;
            let err = match result {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(e)) => e,
                Err(_) => ClientError::Timeout(policy.call_timeout.as_millis() as u64),
            };

            if !err.is_retryable() || attempt == attempts {
                return Err(err);
            }

            warn!(attempt, error = %err, "transport failure, retrying");
            last_err = err;
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        Err(last_err)
    }

    /// Close the connection gracefully
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }

    /// Check if the client is currently connected
    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        if let Some(ref conn) = *conn_guard {
            conn.close_reason().is_none()
        } else {
            false
        }
    }

    /// Remote address this client dials.
    pub fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }
}

impl Drop for CroupierClient {
    fn drop(&mut self) {
        // Close connection on drop (non-async, best effort)
        if let Ok(mut guard) = self.connection.try_lock()
            && let Some(conn) = guard.take()
        {
            conn.close(0u32.into(), b"client dropped");
        }
    }
}

/// Certificate verifier that skips all verification (for development only!)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CroupierClientConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:7101".parse().unwrap());
        assert_eq!(config.server_name, "localhost");
        assert!(!config.dangerous_skip_cert_verification);
        assert!(config.ca_pem.is_empty());
        assert!(config.cert_pem.is_empty());
        assert_eq!(config.keep_alive_interval_ms, 10_000);
        assert_eq!(config.idle_timeout_ms, 600_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.call_timeout, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::NotConnected.is_retryable());
        assert!(ClientError::Timeout(5000).is_retryable());
        assert!(ClientError::Frame(FrameError::ConnectionClosed).is_retryable());
        assert!(!ClientError::Frame(FrameError::InvalidMessageType(9)).is_retryable());
        assert!(!ClientError::Tls("bad cert".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = CroupierClient::localhost("127.0.0.1:7101".parse().unwrap());
        assert!(client.is_ok(), "failed to create client: {:?}", client.err());
    }

    #[tokio::test]
    async fn test_client_initial_not_connected() {
        let client = CroupierClient::localhost("127.0.0.1:7101".parse().unwrap()).unwrap();
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_client_connect_timeout() {
        let config = CroupierClientConfig {
            server_addr: "127.0.0.1:59998".parse().unwrap(),
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 100,
            ..Default::default()
        };
        let client = CroupierClient::new(config).unwrap();
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_client_close_without_connection() {
        let client = CroupierClient::localhost("127.0.0.1:7101".parse().unwrap()).unwrap();
        client.close().await;
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_request_with_retry_exhausts_attempts() {
        let config = CroupierClientConfig {
            server_addr: "127.0.0.1:59997".parse().unwrap(),
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 50,
            ..Default::default()
        };
        let client = CroupierClient::new(config).unwrap();
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(200),
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        };
        let result: Result<crate::control::HeartbeatResponse, _> = client
            .request_with_retry(
                &crate::control::HeartbeatRequest {
                    agent_id: "a".to_string(),
                    session_id: "s".to_string(),
                },
                &policy,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_stream_framed_round_trip() {
        use crate::control::{HeartbeatRequest, HeartbeatResponse};
        use crate::frame::MessageType;
        use crate::server::CroupierServer;

        let server = CroupierServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server
                .run(|conn| async move {
                    conn.run(|mut stream| async move {
                        if stream.read_frame().await.is_ok() {
                            let frame = Frame::response(&HeartbeatResponse {}).unwrap();
                            let _ = stream.write_frame(&frame).await;
                        }
                    })
                    .await;
                })
                .await;
        });

        let client = CroupierClient::localhost(addr).unwrap();
        let mut stream = client.open_stream().await.unwrap();
        let request = HeartbeatRequest {
            agent_id: "agent-1".to_string(),
            session_id: "s-1".to_string(),
        };
        stream
            .write_frame(&Frame::request(&request).unwrap())
            .await
            .unwrap();

        let frame = stream.read_frame().await.unwrap();
        assert_eq!(frame.message_type, MessageType::Response);
        frame.decode::<HeartbeatResponse>().unwrap();
    }

    #[test]
    fn test_build_client_config_with_verification() {
        let config = CroupierClientConfig::default();
        assert!(CroupierClient::build_client_config(&config).is_ok());
    }

    #[test]
    fn test_build_client_config_skip_verification() {
        let config = CroupierClientConfig {
            dangerous_skip_cert_verification: true,
            ..Default::default()
        };
        assert!(CroupierClient::build_client_config(&config).is_ok());
    }

    #[test]
    fn test_build_client_config_with_ca_bundle() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = CroupierClientConfig {
            ca_pem: cert.cert.pem().into_bytes(),
            ..Default::default()
        };
        assert!(CroupierClient::build_client_config(&config).is_ok());
    }

    #[test]
    fn test_build_client_config_with_client_cert() {
        let cert = rcgen::generate_simple_self_signed(vec!["agent-1".to_string()]).unwrap();
        let config = CroupierClientConfig {
            dangerous_skip_cert_verification: true,
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..Default::default()
        };
        assert!(CroupierClient::build_client_config(&config).is_ok());
    }

    #[test]
    fn test_build_client_config_cert_without_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["agent-1".to_string()]).unwrap();
        let config = CroupierClientConfig {
            dangerous_skip_cert_verification: true,
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: Vec::new(),
            ..Default::default()
        };
        assert!(CroupierClient::build_client_config(&config).is_err());
    }
}

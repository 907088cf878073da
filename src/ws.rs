//! QRC socket: the WebSocket layer under the core client.
//!
//! QRC is JSON-RPC over text frames — one document per frame, nothing
//! else meaningful on the wire. This module reduces the WebSocket to
//! exactly that: [`CoreRx::next`] yields JSON documents, keep-alive
//! pings that need answering, or a single terminal `Gone` event folding
//! close frames, read errors, and EOF into one reason string. Binary
//! and pong traffic never reaches the client.
//!
//! # TLS
//!
//! Q-SYS cores ship with self-signed certificates and most installs
//! never replace them. [`connect`] therefore installs a certificate
//! verifier that accepts any server certificate while still verifying
//! the TLS handshake signatures. Plain `ws://` URLs skip TLS entirely
//! (used by the in-process mock core in tests).

// Rust guideline compliant 2026-02

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{tungstenite, Connector};

/// Concrete stream type behind the split halves.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// What the read half hands to the session loop.
#[derive(Debug)]
pub enum SocketEvent {
    /// One JSON document from the core.
    Json(String),
    /// Keep-alive ping; answer it with [`CoreTx::pong`] or the core
    /// drops the session.
    Ping(Vec<u8>),
    /// The link is gone — close frame, read error, or EOF. Terminal:
    /// no further events follow.
    Gone(String),
}

/// Write half of the QRC socket.
#[derive(Debug)]
pub struct CoreTx {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl CoreTx {
    /// Put one JSON document on the wire as a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the link is down or the OS write fails;
    /// the session loop treats either as link loss.
    pub async fn send_json(&mut self, doc: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(doc.to_string()))
            .await
            .context("write to core failed")
    }

    /// Answer a keep-alive ping.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(payload))
            .await
            .context("pong write failed")
    }

    /// Announce a clean shutdown and flush the sink.
    ///
    /// Best-effort: a core that already dropped the link makes this
    /// fail, which the shutdown path ignores.
    ///
    /// # Errors
    ///
    /// Returns an error when the close handshake cannot be written.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("close frame write failed")?;
        self.sink.close().await.context("sink close failed")
    }
}

/// Read half of the QRC socket.
#[derive(Debug)]
pub struct CoreRx {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl CoreRx {
    /// Wait for the next event worth acting on.
    ///
    /// Pong and binary frames are keep-alive noise on a QRC link;
    /// they are swallowed here so the session loop only ever sees
    /// documents, pings, and the end of the link.
    pub async fn next(&mut self) -> SocketEvent {
        while let Some(frame) = self.stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return SocketEvent::Gone(format!("read error: {e}")),
            };
            match frame {
                tungstenite::Message::Text(doc) => {
                    return SocketEvent::Json(doc.to_string());
                }
                tungstenite::Message::Ping(payload) => {
                    return SocketEvent::Ping(payload.to_vec());
                }
                tungstenite::Message::Close(close) => {
                    let reason = match close {
                        Some(frame) => format!(
                            "core closed the session ({}): {}",
                            u16::from(frame.code),
                            frame.reason
                        ),
                        None => "core closed the session".to_string(),
                    };
                    return SocketEvent::Gone(reason);
                }
                tungstenite::Message::Pong(_)
                | tungstenite::Message::Binary(_)
                | tungstenite::Message::Frame(_) => {}
            }
        }
        SocketEvent::Gone("stream ended".to_string())
    }
}

/// Open the QRC socket and split it for use in a `tokio::select!` loop.
///
/// `wss://` URLs negotiate TLS through the self-signed-tolerant
/// verifier; `ws://` URLs go out in the clear.
///
/// # Errors
///
/// Returns an error if the URL is invalid, TCP connect fails, or the
/// WebSocket handshake is rejected.
pub async fn connect(url: &str) -> Result<(CoreTx, CoreRx)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let connector = Connector::Rustls(Arc::new(self_signed_tolerant_tls_config()));

    let (ws_stream, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, true, Some(connector))
            .await
            .with_context(|| format!("WebSocket connect failed: {url}"))?;

    let (sink, stream) = ws_stream.split();

    Ok((CoreTx { sink }, CoreRx { stream }))
}

/// Build a rustls client config whose certificate verifier accepts any
/// server certificate.
///
/// Handshake signatures are still verified against the presented
/// certificate, so the link is encrypted and tamper-proof; only the
/// chain-of-trust check is waived.
fn self_signed_tolerant_tls_config() -> rustls::ClientConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptSelfSigned { provider }))
        .with_no_client_auth()
}

/// Certificate verifier that waives the chain-of-trust check.
#[derive(Debug)]
struct AcceptSelfSigned {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptSelfSigned {
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
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

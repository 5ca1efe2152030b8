//! TLS Tests for the secured transport
//!
//! A `tokio-rustls` acceptor with a freshly generated self-signed
//! certificate plays the paired device.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use d2d_core::frame::{self, FrameLimits};
use d2d_core::{
    ConnectionConfig, ConnectionEvent, D2dMessage, D2dService, Header, TlsConfig, TlsTrust,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

struct TestPeer {
    port: u16,
    cert: CertificateDer<'static>,
    cert_pem: String,
    /// Resolves to the first message the peer received, if the handshake
    /// succeeded
    handle: JoinHandle<Option<D2dMessage>>,
}

fn acceptor() -> (TlsAcceptor, rcgen::CertifiedKey) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        generated.key_pair.serialize_der(),
    ));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![generated.cert.der().clone()], key)
        .unwrap();
    (TlsAcceptor::from(Arc::new(config)), generated)
}

/// Start a TLS peer that reads one message and answers with one message
async fn start_peer() -> TestPeer {
    let (acceptor, generated) = acceptor();
    let cert = generated.cert.der().clone();
    let cert_pem = generated.cert.pem();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.ok()?;
        let mut stream = acceptor.accept(tcp).await.ok()?;

        let request = frame::read_message(&mut stream, &FrameLimits::default())
            .await
            .ok()?;

        let mut reply = D2dMessage::new(Header::new(), "secure-pong");
        reply.add_header("fileLength", "11");
        frame::write_message(&mut stream, &reply).await.ok()?;
        Some(request)
    });

    TestPeer {
        port,
        cert,
        cert_pem,
        handle,
    }
}

fn secured_config(port: u16, tls: TlsConfig) -> ConnectionConfig {
    ConnectionConfig::socket("127.0.0.1", port, "tls-key")
        .with_secured(true)
        .with_tls(tls)
        .with_watchdog_interval(Duration::from_millis(500))
}

fn cert_file(cert: &CertificateDer<'_>) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(cert).unwrap();
    file
}

async fn next_event(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("event channel closed")
}

async fn exchange(service: &D2dService) -> D2dMessage {
    let mut message = D2dMessage::new(Header::new(), "secure-ping");
    message.add_header("fileName", "ping.txt");
    service.send(message).await.unwrap();
    service.receive().await.unwrap()
}

// =============================================================================
// Handshake Tests
// =============================================================================

#[tokio::test]
async fn test_trust_on_first_use_round_trip() {
    let peer = start_peer().await;
    let (service, mut events) =
        D2dService::new(secured_config(peer.port, TlsConfig::default())).unwrap();

    service.open().unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);

    let reply = exchange(&service).await;
    assert_eq!(&reply.body()[..], b"secure-pong");

    let request = peer.handle.await.unwrap().expect("peer saw no message");
    assert_eq!(request.header_value("secKey"), Some("tls-key"));
    assert_eq!(request.header_value("fileLength"), Some("11"));
    assert_eq!(&request.body()[..], b"secure-ping");
}

#[tokio::test]
async fn test_pinned_certificate_accepts_matching_peer() {
    let peer = start_peer().await;
    let pinned = cert_file(&peer.cert);
    let tls = TlsConfig {
        trust: TlsTrust::PinnedCertificate,
        certificate: Some(pinned.path().to_path_buf()),
    };

    let (service, mut events) = D2dService::new(secured_config(peer.port, tls)).unwrap();
    service.open().unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);

    let reply = exchange(&service).await;
    assert_eq!(&reply.body()[..], b"secure-pong");
}

#[tokio::test]
async fn test_pinned_certificate_rejects_other_peer() {
    let peer = start_peer().await;
    let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let pinned = cert_file(other.cert.der());
    let tls = TlsConfig {
        trust: TlsTrust::PinnedCertificate,
        certificate: Some(pinned.path().to_path_buf()),
    };

    let (service, mut events) = D2dService::new(secured_config(peer.port, tls)).unwrap();
    service.open().unwrap();

    assert_eq!(next_event(&mut events).await, ConnectionEvent::ConnectFailed);
    assert!(!service.is_open());

    let peer_result = tokio::time::timeout(Duration::from_secs(5), peer.handle)
        .await
        .expect("peer task hung")
        .unwrap();
    assert!(peer_result.is_none());
}

#[tokio::test]
async fn test_pem_bundle_is_accepted() {
    let peer = start_peer().await;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(peer.cert_pem.as_bytes()).unwrap();

    let tls = TlsConfig {
        trust: TlsTrust::PinnedCertificate,
        certificate: Some(file.path().to_path_buf()),
    };
    let (service, mut events) = D2dService::new(secured_config(peer.port, tls)).unwrap();
    service.open().unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[tokio::test]
async fn test_close_sends_close_notify() {
    let (acceptor, _cert) = acceptor();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut stream = acceptor.accept(tcp).await.unwrap();
        let request = frame::read_message(&mut stream, &FrameLimits::default())
            .await
            .unwrap();

        let mut rest = Vec::new();
        let end = stream.read_to_end(&mut rest).await;
        (request, end)
    });

    let (service, mut events) =
        D2dService::new(secured_config(port, TlsConfig::default())).unwrap();
    service.open().unwrap();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);

    let mut message = D2dMessage::new(Header::new(), "bye");
    message.add_header("fileName", "bye.txt");
    service.send(message).await.unwrap();
    service.close();

    let (request, end) = tokio::time::timeout(Duration::from_secs(5), peer)
        .await
        .expect("peer never saw the close")
        .unwrap();
    assert_eq!(&request.body()[..], b"bye");
    assert_eq!(end.unwrap(), 0);
}

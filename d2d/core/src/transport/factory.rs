//! Transport Factory
//!
//! Selects the plain or secure messenger from configuration.

use std::sync::Arc;

use super::config::{ConnectionConfig, ConnectionKind};
use super::secure::TlsConnector;
use super::socket::{EventSender, MessengerOptions, SocketMessenger, TcpConnector};
use super::traits::{Connector, Messenger, TransportError};

/// Builds messengers for a connection configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketMessengerFactory;

impl SocketMessengerFactory {
    /// Create a messenger for the configuration
    ///
    /// Both variants share the endpoint, tunables and event channel; they
    /// differ only in the connector. `ConnectionKind::Samba` is accepted and
    /// served by the socket transport.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Tls` if the secured variant is requested and
    /// its certificate settings are unusable.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let config = ConnectionConfig::socket("192.168.1.20", 5001, "secret");
    /// let messenger = SocketMessengerFactory::create(&config, Some(events_tx))?;
    /// messenger.open()?;
    /// ```
    pub fn create(
        config: &ConnectionConfig,
        events: Option<EventSender>,
    ) -> Result<Box<dyn Messenger>, TransportError> {
        Ok(Box::new(Self::create_socket(config, events)?))
    }

    /// Like [`create`](Self::create), returning the concrete type
    pub fn create_socket(
        config: &ConnectionConfig,
        events: Option<EventSender>,
    ) -> Result<SocketMessenger, TransportError> {
        if config.kind == ConnectionKind::Samba {
            tracing::warn!("Samba transport is not implemented, using socket transport");
        }

        let connector: Arc<dyn Connector> = if config.is_secured() {
            Arc::new(TlsConnector::new(&config.tls)?)
        } else {
            Arc::new(TcpConnector)
        };

        Ok(SocketMessenger::with_connector(
            config.endpoint(),
            connector,
            MessengerOptions::from_config(config),
            events,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::config::{TlsConfig, TlsTrust};
    use crate::transport::traits::StreamStatus;

    #[test]
    fn test_create_plain_messenger() {
        let config = ConnectionConfig::socket("127.0.0.1", 5001, "k");
        let messenger = SocketMessengerFactory::create_socket(&config, None).unwrap();

        assert_eq!(messenger.connector_name(), "plain");
        assert_eq!(messenger.endpoint().port, 5001);
        assert_eq!(messenger.input_status(), StreamStatus::NotOpen);
    }

    #[test]
    fn test_create_secure_messenger() {
        let config = ConnectionConfig::socket("127.0.0.1", 5001, "k").with_secured(true);
        let messenger = SocketMessengerFactory::create_socket(&config, None).unwrap();
        assert_eq!(messenger.connector_name(), "tls");
    }

    #[test]
    fn test_samba_falls_back_to_socket() {
        let config = ConnectionConfig::socket("127.0.0.1", 445, "k").with_kind(ConnectionKind::Samba);
        let messenger = SocketMessengerFactory::create_socket(&config, None).unwrap();
        assert_eq!(messenger.connector_name(), "plain");
    }

    #[test]
    fn test_secure_messenger_with_missing_pin_fails() {
        let config = ConnectionConfig::socket("127.0.0.1", 5001, "k")
            .with_secured(true)
            .with_tls(TlsConfig {
                trust: TlsTrust::PinnedCertificate,
                certificate: None,
            });

        match SocketMessengerFactory::create(&config, None) {
            Err(TransportError::Tls(msg)) => assert!(msg.contains("certificate")),
            Err(other) => panic!("Expected Tls error, got: {other}"),
            Ok(_) => panic!("Expected error for pinned trust without certificate"),
        }
    }
}

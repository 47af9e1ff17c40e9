//! Port Allocator
//!
//! Picks the local port the test SOCKS inbound listens on.

use crate::document::ConfigDocument;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Port allocation errors
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("No local port available: {0}")]
    NoPortAvailable(#[from] std::io::Error),
}

/// A port chosen for the test listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedPort {
    /// Port number
    pub port: u16,
    /// Taken from an existing socks inbound (nothing was bound)
    pub reused: bool,
}

/// Choose the test listener port for a config
///
/// A socks inbound that already declares `listen_port` wins. Otherwise the OS
/// hands out an ephemeral loopback port, which is released right away so the
/// engine can bind it.
pub fn allocate(doc: &ConfigDocument) -> Result<AllocatedPort, PortError> {
    if let Some(port) = doc.socks_listen_port() {
        return Ok(AllocatedPort { port, reused: true });
    }

    let port = ephemeral_port()?;
    Ok(AllocatedPort { port, reused: false })
}

/// Bind port 0 on loopback and return what the OS picked
pub fn ephemeral_port() -> Result<u16, PortError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);

    debug!("Allocated ephemeral port {}", port);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuses_declared_port() {
        let doc = ConfigDocument::parse(
            r#"{"inbounds":[{"type":"socks","listen_port":9999}],"outbounds":[]}"#,
        )
        .unwrap();

        let allocated = allocate(&doc).unwrap();
        assert_eq!(allocated, AllocatedPort { port: 9999, reused: true });
    }

    #[test]
    fn test_ignores_socks_without_port() {
        let doc = ConfigDocument::parse(
            r#"{"inbounds":[{"type":"socks"},{"type":"http","listen_port":8080}],"outbounds":[]}"#,
        )
        .unwrap();

        let allocated = allocate(&doc).unwrap();
        assert!(!allocated.reused);
        assert_ne!(allocated.port, 8080);
    }

    #[test]
    fn test_ephemeral_port_is_free() {
        let doc = ConfigDocument::parse(r#"{"outbounds":[]}"#).unwrap();

        let allocated = allocate(&doc).unwrap();
        assert!(!allocated.reused);
        assert!(allocated.port > 0);

        // Released again, so it can be bound
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, allocated.port));
        assert!(listener.is_ok());
    }
}

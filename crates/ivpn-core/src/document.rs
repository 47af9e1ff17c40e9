//! Engine Configuration Document
//!
//! The engine config stays an untyped JSON object: the core only edits the
//! few fields it owns and passes everything else through in its original key
//! order.
//!
//! # Edits
//!
//! | Flow | Edit |
//! |------|------|
//! | Live | `file_descriptor` set on every `tun` inbound |
//! | Test | `socks-in` inbound on 127.0.0.1, `log.level` forced to `error` |

use serde_json::{Map, Value, json};
use tracing::debug;

/// Inbound type that receives the OS tunnel descriptor
pub const TUN_INBOUND: &str = "tun";

/// Inbound type used by test flows
pub const SOCKS_INBOUND: &str = "socks";

/// Tag of the synthesized test inbound
pub const SOCKS_TAG: &str = "socks-in";

/// Listen address of the synthesized test inbound
pub const SOCKS_LISTEN: &str = "127.0.0.1";

/// Log level forced during test runs
const TEST_LOG_LEVEL: &str = "error";

/// Document errors
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config root is not a JSON object")]
    NotAnObject,

    #[error("Config has no outbounds")]
    MissingOutbounds,
}

/// A parsed engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    root: Map<String, Value>,
}

impl ConfigDocument {
    /// Parse config text into a document
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(DocumentError::NotAnObject),
        }
    }

    /// Does the config route traffic anywhere?
    pub fn has_outbounds(&self) -> bool {
        self.root.contains_key("outbounds")
    }

    /// Inbound descriptors, in config order
    pub fn inbounds(&self) -> &[Value] {
        self.root
            .get("inbounds")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Port of the first socks inbound that declares one
    pub fn socks_listen_port(&self) -> Option<u16> {
        self.inbounds()
            .iter()
            .filter(|inbound| inbound_type(inbound) == Some(SOCKS_INBOUND))
            .find_map(|inbound| {
                inbound
                    .get("listen_port")
                    .and_then(Value::as_u64)
                    .and_then(|port| u16::try_from(port).ok())
                    .filter(|port| *port != 0)
            })
    }

    /// Make the config reachable through a local SOCKS listener
    ///
    /// An existing socks inbound with a port is kept as-is and its port is
    /// returned. Otherwise the `inbounds` array is replaced by a single
    /// `socks-in` listener on `port`. Fails without touching the document
    /// when there are no outbounds to route the probe through.
    pub fn prepare_test_inbound(&mut self, port: u16) -> Result<u16, DocumentError> {
        if !self.has_outbounds() {
            return Err(DocumentError::MissingOutbounds);
        }

        let port = match self.socks_listen_port() {
            Some(existing) => {
                debug!("Reusing socks inbound on port {}", existing);
                existing
            }
            None => {
                let inbound = json!({
                    "type": SOCKS_INBOUND,
                    "tag": SOCKS_TAG,
                    "listen": SOCKS_LISTEN,
                    "listen_port": port,
                });
                self.root.insert("inbounds".to_string(), Value::Array(vec![inbound]));
                debug!("Synthesized socks inbound on port {}", port);
                port
            }
        };

        self.quiet_logs();
        Ok(port)
    }

    /// Force `log.level` to `error` when a log object is present
    pub fn quiet_logs(&mut self) {
        if let Some(Value::Object(log)) = self.root.get_mut("log") {
            log.insert("level".to_string(), Value::from(TEST_LOG_LEVEL));
        }
    }

    /// Hand the tunnel descriptor to every `tun` inbound
    ///
    /// Returns how many inbounds received it.
    pub fn inject_tun_descriptor(&mut self, fd: i32) -> usize {
        let Some(Value::Array(inbounds)) = self.root.get_mut("inbounds") else {
            return 0;
        };

        let mut injected = 0;
        for inbound in inbounds.iter_mut() {
            if inbound_type(inbound) != Some(TUN_INBOUND) {
                continue;
            }
            if let Value::Object(fields) = inbound {
                fields.insert("file_descriptor".to_string(), Value::from(fd));
                injected += 1;
            }
        }
        injected
    }

    /// Serialize for the engine
    pub fn to_json(&self) -> String {
        Value::Object(self.root.clone()).to_string()
    }

    /// Raw access to the root object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.root
    }
}

fn inbound_type(inbound: &Value) -> Option<&str> {
    inbound.get("type").and_then(Value::as_str)
}

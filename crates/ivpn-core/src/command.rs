//! UI Method Channel
//!
//! Commands arrive as `{"method": "...", "config": "..."}` objects and are
//! answered with a [`Reply`]: `null`, an integer, or an error object.

use crate::manager::VpnManager;
use crate::tunnel::TunnelError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Error code for a missing or unusable argument
pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";

/// Error code for an unknown method
pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";

/// Error code for a start rejected by a running session
pub const BUSY: &str = "BUSY";

/// Raw method call as sent by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl Call {
    pub fn new(method: impl Into<String>, config: Option<&str>) -> Self {
        Self {
            method: method.into(),
            config: config.map(str::to_string),
        }
    }
}

/// Decoded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartVpn { config: String },
    StopVpn,
    TestConfig { config: String },
    StartTestProxy { config: String },
    StopTestProxy,
}

impl TryFrom<Call> for Command {
    type Error = Reply;

    fn try_from(call: Call) -> Result<Self, Reply> {
        let config = || {
            call.config
                .clone()
                .ok_or_else(|| Reply::error(INVALID_ARGUMENT, "Config is null"))
        };

        match call.method.as_str() {
            "startVpn" => Ok(Command::StartVpn { config: config()? }),
            "stopVpn" => Ok(Command::StopVpn),
            "testConfig" => Ok(Command::TestConfig { config: config()? }),
            "startTestProxy" => Ok(Command::StartTestProxy { config: config()? }),
            "stopTestProxy" => Ok(Command::StopTestProxy),
            other => Err(Reply::error(
                NOT_IMPLEMENTED,
                format!("Unknown method: {}", other),
            )),
        }
    }
}

/// Answer to a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Error { code: String, message: String },
    Value(Option<i64>),
}

impl Reply {
    /// Success without a value
    pub fn done() -> Self {
        Reply::Value(None)
    }

    pub fn value(value: i64) -> Self {
        Reply::Value(Some(value))
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Reply::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}

/// Execute one call against the manager
///
/// `startVpn` replies as soon as the start is accepted; its outcome follows
/// on the status stream.
pub async fn dispatch(manager: &VpnManager, call: Call) -> Reply {
    debug!("Call: {}", call.method);

    let command = match Command::try_from(call) {
        Ok(command) => command,
        Err(reply) => {
            warn!("Rejected call: {:?}", reply);
            return reply;
        }
    };

    match command {
        Command::StartVpn { config } => match manager.start(&config) {
            Ok(_task) => Reply::done(),
            Err(TunnelError::Busy(busy)) => Reply::error(BUSY, busy.to_string()),
            Err(e) => Reply::error(INVALID_ARGUMENT, e.to_string()),
        },
        Command::StopVpn => {
            manager.stop().await;
            Reply::done()
        }
        Command::TestConfig { config } => Reply::value(manager.test_config(&config).await),
        Command::StartTestProxy { config } => {
            Reply::value(i64::from(manager.start_test_proxy(&config).await))
        }
        Command::StopTestProxy => {
            manager.stop_test_proxy().await;
            Reply::done()
        }
    }
}

//! Service Configuration
//!
//! Host-side settings for the session core: where configs are persisted,
//! the tunnel interface parameters, test-flow timings and the engine
//! binary. Loaded from TOML or JSON; every key has a default.

use crate::platform::{ForegroundNotice, TunOptions};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported config format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Invalid prefix length /{0}")]
    InvalidPrefix(u8),

    #[error("MTU {0} is too small (minimum 576)")]
    MtuTooSmall(u32),

    #[error("No DNS servers configured")]
    NoDns,

    #[error("Probe URL is empty")]
    EmptyProbeUrl,

    #[error("Timeouts must be non-zero")]
    ZeroTimeout,
}

/// Tunnel interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunSettings {
    /// Session label shown by the OS
    pub session: String,
    /// Interface address
    pub address: IpAddr,
    /// Prefix length of the interface address
    pub prefix: u8,
    /// Routes in CIDR notation
    pub routes: Vec<String>,
    /// Interface MTU
    pub mtu: u32,
    /// DNS servers
    pub dns: Vec<IpAddr>,
    /// Descriptor of an interface the host already established
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            session: "iVPN Connection".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(172, 19, 0, 1)),
            prefix: 28,
            routes: vec!["0.0.0.0/0".to_string()],
            mtu: 1500,
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), // Google
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), // Cloudflare
            ],
            fd: None,
        }
    }
}

impl TunSettings {
    /// Interface options for the tunnel provider
    pub fn to_options(&self) -> Result<TunOptions, ConfigError> {
        check_prefix(self.address, self.prefix)?;

        let routes = self
            .routes
            .iter()
            .map(|route| parse_cidr(route).ok_or_else(|| ConfigError::InvalidRoute(route.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TunOptions {
            session: self.session.clone(),
            address: (self.address, self.prefix),
            routes,
            mtu: self.mtu,
            dns: self.dns.clone(),
        })
    }
}

/// Test-flow timings and probe target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Wait after starting a test proxy (ms)
    pub proxy_settle_ms: u64,
    /// Wait after starting a ping run (ms)
    pub ping_settle_ms: u64,
    /// Endpoint the latency probe sends HEAD to
    pub probe_url: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            proxy_settle_ms: 200,
            ping_settle_ms: 500,
            probe_url: "https://www.google.com/generate_204".to_string(),
            connect_timeout_secs: 3,
            read_timeout_secs: 3,
        }
    }
}

impl TestSettings {
    pub fn proxy_settle(&self) -> Duration {
        Duration::from_millis(self.proxy_settle_ms)
    }

    pub fn ping_settle(&self) -> Duration {
        Duration::from_millis(self.ping_settle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Engine binary settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engine executable
    pub binary: PathBuf,
    /// Working directory (defaults to `data_dir`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("sing-box"),
            work_dir: None,
        }
    }
}

/// Foreground notification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForegroundSettings {
    pub channel_id: String,
    pub title: String,
    pub text: String,
}

impl Default for ForegroundSettings {
    fn default() -> Self {
        Self {
            channel_id: "ivpn_service_channel".to_string(),
            title: "iVPN is Connected".to_string(),
            text: "Your traffic is secure".to_string(),
        }
    }
}

impl ForegroundSettings {
    pub fn notice(&self) -> ForegroundNotice {
        ForegroundNotice {
            channel_id: self.channel_id.clone(),
            title: self.title.clone(),
            text: self.text.clone(),
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory for the live config
    pub data_dir: PathBuf,
    /// Directory for test configs
    pub cache_dir: PathBuf,
    pub tun: TunSettings,
    pub test: TestSettings,
    pub engine: EngineSettings,
    pub foreground: ForegroundSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            cache_dir: PathBuf::from("cache"),
            tun: TunSettings::default(),
            test: TestSettings::default(),
            engine: EngineSettings::default(),
            foreground: ForegroundSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Engine working directory
    pub fn engine_work_dir(&self) -> PathBuf {
        self.engine
            .work_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tun.to_options()?;
        if self.tun.mtu < 576 {
            return Err(ConfigError::MtuTooSmall(self.tun.mtu));
        }
        if self.tun.dns.is_empty() {
            return Err(ConfigError::NoDns);
        }
        if self.test.probe_url.trim().is_empty() {
            return Err(ConfigError::EmptyProbeUrl);
        }
        if self.test.connect_timeout_secs == 0 || self.test.read_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Parse CIDR notation (e.g., "0.0.0.0/0")
fn parse_cidr(cidr: &str) -> Option<(IpAddr, u8)> {
    let (ip, prefix) = cidr.split_once('/')?;
    let ip: IpAddr = ip.trim().parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok()?;
    check_prefix(ip, prefix).ok()?;
    Some((ip, prefix))
}

fn check_prefix(ip: IpAddr, prefix: u8) -> Result<(), ConfigError> {
    let max = if ip.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(ConfigError::InvalidPrefix(prefix));
    }
    Ok(())
}

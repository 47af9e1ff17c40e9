//! iVPN Core - Session Control for a Bundled Tunnel Engine
//!
//! Owns the VPN session lifecycle around an embedded tunneling engine and an
//! ephemeral test proxy for probing candidate configs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          UI Layer                            │
//! │        commands ──▶ dispatch        status ◀── stream        │
//! └──────────────────────────│──────────────────────▲────────────┘
//!                            ▼                      │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         VpnManager                           │
//! │                                                              │
//! │  ┌────────────────┐   ┌─────────────┐   ┌─────────────────┐  │
//! │  │ TunnelController│──▶│ SessionGate │◀──│ TestProxyControl│  │
//! │  │  (live tunnel) │   │ live | test  │   │  (SOCKS + ping) │  │
//! │  └───────┬────────┘   └─────────────┘   └────────┬────────┘  │
//! │          │                                       │           │
//! │          └──────────────▶ EngineHandle ◀─────────┘           │
//! └─────────────────────────────│────────────────────────────────┘
//!                               ▼
//!                      ┌─────────────────┐
//!                      │  Tunnel Engine  │
//!                      │   (singleton)   │
//!                      └─────────────────┘
//! ```
//!
//! # Features
//!
//! - **Config Resolution**: inline JSON or a path to a config file
//! - **Session Gate**: one live and one test session at most; live preempts test
//! - **Test Proxy**: loopback SOCKS inbound synthesized into any config
//! - **Latency Probe**: HEAD through the test proxy with fixed timeouts
//! - **Status Stream**: late subscribers see the current state first

mod command;
mod config;
mod document;
mod engine;
mod gate;
mod manager;
mod platform;
mod port;
mod probe;
mod resolver;
mod status;
mod store;
mod tester;
mod tunnel;

pub use command::{BUSY, Call, Command, INVALID_ARGUMENT, NOT_IMPLEMENTED, Reply, dispatch};
pub use config::{
    ConfigError, EngineSettings, ForegroundSettings, ServiceConfig, TestSettings, TunSettings,
};
pub use document::{ConfigDocument, DocumentError, SOCKS_LISTEN, SOCKS_TAG};
pub use engine::{EngineError, EngineHandle, ProcessEngine, SessionKind, TEARDOWN, TunnelEngine};
pub use gate::{Busy, LivePermit, SessionGate, TestPermit};
pub use manager::{PING_FAILED, VpnManager};
pub use platform::{
    ForegroundGuard, ForegroundNotice, HeadlessHost, HostTunProvider, NO_FD, PlatformError,
    PlatformInterface, ProtectFn, ServiceHost, ServicePlatform, StubPlatform, TunDescriptor,
    TunOptions, TunProvider, foreground,
};
pub use port::{AllocatedPort, PortError, allocate, ephemeral_port};
pub use probe::{ProbeConfig, ProbeError, ProbeResult, SocksProbe};
pub use resolver::{ResolveError, is_path_like, resolve};
pub use status::{StatusEmitter, VpnStatus};
pub use store::{ConfigStore, StoreError};
pub use tester::{TestError, TestProxyController};
pub use tunnel::{TunnelController, TunnelError, TunnelState};

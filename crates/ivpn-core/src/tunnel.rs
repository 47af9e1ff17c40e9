//! Tunnel Lifecycle
//!
//! Drives the live VPN session:
//!
//! ```text
//! Idle ──start──▶ Starting ──▶ Connected ──stop──▶ Stopping ──▶ Idle
//!                    │
//!                    └──failure──▶ Error ──▶ Idle
//! ```
//!
//! A start that fails at any step emits `ERROR`, undoes whatever it had
//! acquired (foreground presence, tunnel interface, engine session, gate)
//! and returns to `Idle` on its own. A stop that arrives while `Starting` is
//! remembered: the start then tears down and ends `DISCONNECTED` instead of
//! `CONNECTED`.

use crate::config::{ConfigError, ServiceConfig};
use crate::document::{ConfigDocument, DocumentError};
use crate::engine::{EngineError, EngineHandle, SessionKind, run_blocking};
use crate::gate::{Busy, SessionGate};
use crate::platform::{
    ForegroundGuard, ForegroundNotice, PlatformError, PlatformInterface, ServiceHost,
    TunDescriptor, TunOptions, TunProvider, foreground,
};
use crate::resolver::{self, ResolveError};
use crate::status::{StatusEmitter, VpnStatus};
use crate::store::{ConfigStore, StoreError};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Live session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No session
    Idle,
    /// Start sequence in progress
    Starting,
    /// Engine running with the tunnel interface
    Connected,
    /// Teardown in progress
    Stopping,
    /// Start failed, cleanup in progress
    Error,
}

impl TunnelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TunnelState::Idle)
    }
}

/// Live session errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Busy(#[from] Busy),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Invalid tunnel settings: {0}")]
    Settings(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Resources held while the session is up
#[derive(Debug)]
struct Active {
    state: TunnelState,
    /// Stop arrived while `Starting`
    stop_requested: bool,
    descriptor: Option<TunDescriptor>,
    foreground: Option<ForegroundGuard>,
}

/// Everything a start acquired so far
#[derive(Default)]
struct Acquired {
    descriptor: Option<TunDescriptor>,
    foreground: Option<ForegroundGuard>,
}

/// Live VPN session controller
pub struct TunnelController {
    gate: Arc<SessionGate>,
    engine: Arc<EngineHandle>,
    status: Arc<StatusEmitter>,
    tun: Arc<dyn TunProvider>,
    host: Arc<dyn ServiceHost>,
    platform: Arc<dyn PlatformInterface>,
    store: ConfigStore,
    tun_options: Result<TunOptions, ConfigError>,
    notice: ForegroundNotice,
    active: Mutex<Active>,
}

impl TunnelController {
    pub fn new(
        config: &ServiceConfig,
        gate: Arc<SessionGate>,
        engine: Arc<EngineHandle>,
        status: Arc<StatusEmitter>,
        tun: Arc<dyn TunProvider>,
        host: Arc<dyn ServiceHost>,
        platform: Arc<dyn PlatformInterface>,
    ) -> Self {
        Self {
            gate,
            engine,
            status,
            tun,
            host,
            platform,
            store: ConfigStore::new(&config.data_dir, &config.cache_dir),
            tun_options: config.tun.to_options(),
            notice: config.foreground.notice(),
            active: Mutex::new(Active {
                state: TunnelState::Idle,
                stop_requested: false,
                descriptor: None,
                foreground: None,
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        self.lock().state
    }

    /// Run the start sequence to completion
    ///
    /// Outcomes are reported on the status stream; the returned error is for
    /// the caller's logs. A second start while a session runs is rejected
    /// with `Busy::Live` and emits nothing.
    pub async fn start(&self, raw_config: &str) -> Result<(), TunnelError> {
        self.reserve()?;
        self.run(raw_config).await
    }

    /// Claim the controller for a start: `Idle` becomes `Starting`
    ///
    /// From here on a `stop` is honoured even though the start sequence
    /// itself has not run yet.
    pub(crate) fn reserve(&self) -> Result<(), TunnelError> {
        let mut active = self.lock();
        if active.state != TunnelState::Idle {
            info!("Start ignored in state {:?}", active.state);
            return Err(Busy::Live.into());
        }
        active.state = TunnelState::Starting;
        active.stop_requested = false;
        Ok(())
    }

    /// Start sequence after a successful [`reserve`](Self::reserve)
    pub(crate) async fn run(&self, raw_config: &str) -> Result<(), TunnelError> {
        let permit = match self.gate.try_start_live() {
            Ok(permit) => permit,
            Err(busy) => {
                info!("Start ignored: {}", busy);
                self.set_state(TunnelState::Idle);
                return Err(busy.into());
            }
        };

        info!("Starting VPN session");

        if permit.preempts_test() {
            self.preempt_test().await;
        }

        let mut acquired = Acquired::default();
        match self.connect(raw_config, &mut acquired).await {
            Ok(()) => {
                let cancelled = {
                    let mut active = self.lock();
                    if active.stop_requested {
                        active.state = TunnelState::Stopping;
                        true
                    } else {
                        active.state = TunnelState::Connected;
                        active.descriptor = acquired.descriptor.take();
                        active.foreground = acquired.foreground.take();
                        false
                    }
                };

                if cancelled {
                    info!("VPN stopped while starting");
                    self.release(acquired).await;
                    drop(permit);
                    self.set_state(TunnelState::Idle);
                    self.status.emit(VpnStatus::Disconnected);
                    return Ok(());
                }

                permit.hold();
                info!("VPN session connected");
                self.status.emit(VpnStatus::Connected);
                Ok(())
            }
            Err(e) => {
                error!("VPN start failed: {}", e);
                self.set_state(TunnelState::Error);
                self.release(acquired).await;
                drop(permit);
                self.set_state(TunnelState::Idle);
                self.status.emit(VpnStatus::error(&e));
                Err(e)
            }
        }
    }

    async fn connect(&self, raw_config: &str, acquired: &mut Acquired) -> Result<(), TunnelError> {
        let text = resolver::resolve(raw_config).await?;
        let mut doc = ConfigDocument::parse(&text)?;

        acquired.foreground = Some(foreground(self.host.clone(), &self.notice));

        let options = self.tun_options.clone()?;
        let descriptor = self
            .tun
            .establish(&options)
            .ok_or(PlatformError::InterfaceEstablishFailed)?;
        acquired.descriptor = Some(descriptor);

        let injected = doc.inject_tun_descriptor(descriptor.fd);
        if injected == 0 {
            warn!("Config has no tun inbound; descriptor {} not injected", descriptor.fd);
        } else {
            debug!("Injected descriptor {} into {} tun inbound(s)", descriptor.fd, injected);
        }

        let path = self.store.write_live(&doc).await?;
        let config_arg = path.to_string_lossy().into_owned();

        let engine = self.engine.clone();
        let platform = self.platform.clone();
        run_blocking(move || engine.launch(SessionKind::Live, &config_arg, platform, || true))
            .await?;

        Ok(())
    }

    /// Stop the live session
    ///
    /// Returns `false` (and does nothing) unless a session is starting or
    /// connected. A start in progress finishes by tearing down instead of
    /// connecting. Teardown failures are logged; the session always ends
    /// `Idle`.
    pub async fn stop(&self) -> bool {
        let (descriptor, foreground) = {
            let mut active = self.lock();
            match active.state {
                TunnelState::Connected => {}
                TunnelState::Starting => {
                    info!("Stop requested while starting");
                    active.stop_requested = true;
                    return true;
                }
                state => {
                    debug!("Stop ignored in state {:?}", state);
                    return false;
                }
            }
            active.state = TunnelState::Stopping;
            (active.descriptor.take(), active.foreground.take())
        };

        info!("Stopping VPN session");
        self.release(Acquired {
            descriptor,
            foreground,
        })
        .await;

        self.gate.stop_live();
        self.set_state(TunnelState::Idle);
        info!("VPN session stopped");
        self.status.emit(VpnStatus::Disconnected);
        true
    }

    /// Recover after the start task died without finishing
    pub async fn abort(&self) {
        warn!("Aborting VPN session");
        let acquired = {
            let mut active = self.lock();
            active.state = TunnelState::Error;
            Acquired {
                descriptor: active.descriptor.take(),
                foreground: active.foreground.take(),
            }
        };
        self.release(acquired).await;
        self.gate.stop_live();
        self.set_state(TunnelState::Idle);
        self.status.emit(VpnStatus::Error(None));
    }

    /// Undo acquired resources; never fails
    async fn release(&self, acquired: Acquired) {
        let engine = self.engine.clone();
        if let Err(e) = run_blocking(move || Ok(engine.teardown(SessionKind::Live))).await {
            warn!("Engine teardown task failed: {}", e);
        }

        if let Some(descriptor) = acquired.descriptor {
            self.tun.release(descriptor);
        }
        drop(acquired.foreground);
    }

    async fn preempt_test(&self) {
        info!("Stopping running test before VPN start");
        let engine = self.engine.clone();
        if let Err(e) = run_blocking(move || Ok(engine.teardown(SessionKind::Test))).await {
            warn!("Test teardown task failed: {}", e);
        }
        self.gate.stop_test();
    }

    fn set_state(&self, state: TunnelState) {
        self.lock().state = state;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

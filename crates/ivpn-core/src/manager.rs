//! VPN Manager
//!
//! Single entry point for the host: wires the gate, the engine slot and the
//! status stream into the two controllers and exposes the UI operations.

use crate::config::ServiceConfig;
use crate::engine::{EngineHandle, TunnelEngine};
use crate::gate::SessionGate;
use crate::platform::{ServiceHost, ServicePlatform, TunProvider};
use crate::resolver::ResolveError;
use crate::status::{StatusEmitter, VpnStatus};
use crate::tester::TestProxyController;
use crate::tunnel::{TunnelController, TunnelError, TunnelState};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Result code of a failed `test_config`
pub const PING_FAILED: i64 = -1;

/// VPN manager
pub struct VpnManager {
    gate: Arc<SessionGate>,
    status: Arc<StatusEmitter>,
    tunnel: Arc<TunnelController>,
    tester: TestProxyController,
}

impl VpnManager {
    /// Create a manager around an engine and the host's tunnel provider
    pub fn new(
        config: &ServiceConfig,
        engine: Arc<dyn TunnelEngine>,
        tun: Arc<dyn TunProvider>,
        host: Arc<dyn ServiceHost>,
    ) -> Self {
        let gate = Arc::new(SessionGate::new());
        let status = Arc::new(StatusEmitter::new());
        let engine = Arc::new(EngineHandle::new(engine));
        let platform = Arc::new(ServicePlatform::new(tun.clone()));

        let tunnel = TunnelController::new(
            config,
            gate.clone(),
            engine.clone(),
            status.clone(),
            tun,
            host,
            platform,
        );
        let tester = TestProxyController::new(config, gate.clone(), engine);

        Self {
            gate,
            status,
            tunnel: Arc::new(tunnel),
            tester,
        }
    }

    /// Start the VPN in the background
    ///
    /// Blank input and a running session are rejected here, before anything
    /// is emitted. Every other outcome arrives on the status stream. The
    /// session counts as starting once this returns, so an immediate
    /// [`stop`](Self::stop) cancels it. Must be called from within a tokio
    /// runtime.
    ///
    /// A panic in the start sequence is caught through the task's
    /// `JoinError` and turned into `ERROR` plus a full cleanup. That only
    /// holds with unwinding panics: under `panic = "abort"` (the workspace
    /// release profile) the process ends instead and the host restarts it.
    pub fn start(&self, raw_config: &str) -> Result<JoinHandle<()>, TunnelError> {
        if raw_config.trim().is_empty() {
            return Err(ResolveError::EmptyInput.into());
        }
        self.tunnel.reserve()?;

        let tunnel = self.tunnel.clone();
        let raw_config = raw_config.to_string();

        Ok(tokio::spawn(async move {
            let task = tokio::spawn({
                let tunnel = tunnel.clone();
                async move {
                    // Failures were already reported on the status stream
                    let _ = tunnel.run(&raw_config).await;
                }
            });

            if let Err(e) = task.await {
                error!("VPN start task died: {}", e);
                tunnel.abort().await;
            }
        }))
    }

    /// Stop the VPN; no-op unless connected
    pub async fn stop(&self) -> bool {
        self.tunnel.stop().await
    }

    /// Measure latency of a config, `-1` on any failure
    pub async fn test_config(&self, raw_config: &str) -> i64 {
        match self.tester.measure_ping(raw_config).await {
            Ok(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
            Err(_) => PING_FAILED,
        }
    }

    /// Start a test proxy; the port on success, a negative code otherwise
    pub async fn start_test_proxy(&self, raw_config: &str) -> i32 {
        match self.tester.start_test_proxy(raw_config).await {
            Ok(port) => i32::from(port),
            Err(e) => {
                info!("Test proxy not started: {}", e);
                e.code()
            }
        }
    }

    /// Stop the test proxy; no-op when none is running
    pub async fn stop_test_proxy(&self) {
        self.tester.stop_test_proxy().await;
    }

    /// Attach the UI status sink
    pub fn subscribe(&self) -> Receiver<VpnStatus> {
        self.status.subscribe()
    }

    /// Detach the UI status sink
    pub fn unsubscribe(&self) {
        self.status.unsubscribe();
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.tunnel.state()
    }

    pub fn is_live(&self) -> bool {
        self.gate.is_live()
    }

    pub fn is_testing(&self) -> bool {
        self.gate.is_testing()
    }
}

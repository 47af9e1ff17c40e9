//! Ephemeral Test Proxy
//!
//! Runs a candidate config behind a loopback SOCKS listener without touching
//! the OS tunnel. Two flows share the single test slot of the gate:
//!
//! - `start_test_proxy` keeps the session up until `stop_test_proxy`
//! - `measure_ping` probes once through the listener and tears down on its own
//!
//! # Result codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | `-1` | VPN session is live |
//! | `-2` | Another test is running |
//! | `-3` | Config has no outbounds |
//! | `-4` | Any other failure |

use crate::config::{ServiceConfig, TestSettings};
use crate::document::{ConfigDocument, DocumentError};
use crate::engine::{EngineError, EngineHandle, SessionKind, run_blocking};
use crate::gate::{Busy, SessionGate, TestPermit};
use crate::platform::StubPlatform;
use crate::port::{self, PortError};
use crate::probe::{ProbeConfig, ProbeError, SocksProbe};
use crate::resolver::{self, ResolveError};
use crate::store::{ConfigStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Test flow errors
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error(transparent)]
    Busy(#[from] Busy),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),
}

impl TestError {
    /// Negative result code reported to the UI
    pub fn code(&self) -> i32 {
        match self {
            TestError::Busy(Busy::Live) => -1,
            TestError::Busy(Busy::Test) => -2,
            TestError::Document(DocumentError::MissingOutbounds) => -3,
            _ => -4,
        }
    }
}

/// Test session controller
pub struct TestProxyController {
    gate: Arc<SessionGate>,
    engine: Arc<EngineHandle>,
    store: ConfigStore,
    settings: TestSettings,
    probe: SocksProbe,
}

impl TestProxyController {
    pub fn new(config: &ServiceConfig, gate: Arc<SessionGate>, engine: Arc<EngineHandle>) -> Self {
        Self {
            gate,
            engine,
            store: ConfigStore::new(&config.data_dir, &config.cache_dir),
            settings: config.test.clone(),
            probe: SocksProbe::new(ProbeConfig::from(&config.test)),
        }
    }

    /// Start a persistent test proxy and return its SOCKS port
    pub async fn start_test_proxy(&self, raw_config: &str) -> Result<u16, TestError> {
        let (permit, port) = self.launch(raw_config, self.settings.proxy_settle()).await?;
        permit.hold();
        info!("Test proxy listening on 127.0.0.1:{}", port);
        Ok(port)
    }

    /// Stop the test proxy
    ///
    /// Returns `false` when no test was running. The slot is released even
    /// if the engine teardown fails.
    pub async fn stop_test_proxy(&self) -> bool {
        if !self.gate.is_testing() {
            debug!("No test running");
            return false;
        }

        info!("Stopping test proxy");
        self.teardown().await;
        self.gate.stop_test();
        true
    }

    /// One-shot latency measurement in milliseconds
    pub async fn measure_ping(&self, raw_config: &str) -> Result<u64, TestError> {
        let (permit, port) = self.launch(raw_config, self.settings.ping_settle()).await?;

        let result = self.probe.head(port).await;
        self.teardown().await;
        drop(permit);

        match result {
            Ok(probe) => {
                info!("Ping {} ms ({})", probe.millis(), probe.status);
                Ok(probe.millis())
            }
            Err(e) => {
                warn!("Ping failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Admit, configure and start a test session, then wait for it to settle
    async fn launch(
        &self,
        raw_config: &str,
        settle: Duration,
    ) -> Result<(TestPermit<'_>, u16), TestError> {
        let permit = self.gate.try_start_test().inspect_err(|busy| {
            info!("Test rejected: {}", busy);
        })?;

        match self.start_session(raw_config, settle, &permit).await {
            Ok(port) => Ok((permit, port)),
            Err(e) => {
                warn!("Test start failed: {}", e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn start_session(
        &self,
        raw_config: &str,
        settle: Duration,
        permit: &TestPermit<'_>,
    ) -> Result<u16, TestError> {
        let text = resolver::resolve(raw_config).await?;
        let mut doc = ConfigDocument::parse(&text)?;

        let allocated = port::allocate(&doc)?;
        let port = doc.prepare_test_inbound(allocated.port)?;
        let path = self.store.write_test(&doc).await?;
        let config_arg = path.to_string_lossy().into_owned();

        let engine = self.engine.clone();
        let gate = self.gate.clone();
        run_blocking(move || {
            engine.launch(SessionKind::Test, &config_arg, Arc::new(StubPlatform), || {
                !gate.is_live()
            })
        })
        .await?;

        tokio::time::sleep(settle).await;

        // A live start may have taken the engine while we waited
        if !permit.is_current() {
            return Err(EngineError::Preempted.into());
        }
        Ok(port)
    }

    async fn teardown(&self) {
        let engine = self.engine.clone();
        if let Err(e) = run_blocking(move || Ok(engine.teardown(SessionKind::Test))).await {
            warn!("Test teardown task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::RecordingEngine;
    use crate::probe::testing::spawn_fake_socks;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(0);

    const VALID: &str = r#"{"log":{"level":"info"},"inbounds":[{"type":"tun"}],"outbounds":[{"type":"direct"}]}"#;
    const NO_OUTBOUNDS: &str = r#"{"inbounds":[]}"#;

    struct Fixture {
        root: PathBuf,
        gate: Arc<SessionGate>,
        engine: Arc<RecordingEngine>,
        handle: Arc<EngineHandle>,
        tester: TestProxyController,
    }

    fn fixture() -> Fixture {
        let root = std::env::temp_dir().join(format!(
            "ivpn-tester-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let mut config = ServiceConfig {
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
            ..ServiceConfig::default()
        };
        config.test.proxy_settle_ms = 0;
        config.test.ping_settle_ms = 0;
        config.test.probe_url = "http://probe.test/generate_204".to_string();

        let gate = Arc::new(SessionGate::new());
        let engine = Arc::new(RecordingEngine::default());
        let handle = Arc::new(EngineHandle::new(engine.clone()));
        let tester = TestProxyController::new(&config, gate.clone(), handle.clone());

        Fixture {
            root,
            gate,
            engine,
            handle,
            tester,
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn code<T>(result: Result<T, TestError>) -> i32 {
        match result {
            Ok(_) => panic!("expected failure"),
            Err(e) => e.code(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_outbounds_frees_gate() {
        let f = fixture();

        assert_eq!(code(f.tester.start_test_proxy(NO_OUTBOUNDS).await), -3);
        assert!(!f.gate.is_testing());

        // Not busy on retry
        assert_eq!(code(f.tester.start_test_proxy(NO_OUTBOUNDS).await), -3);
        assert_eq!(f.engine.starts(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_proxy_is_busy() {
        let f = fixture();

        let port = f.tester.start_test_proxy(VALID).await.unwrap();
        assert!(port > 0);
        assert!(f.gate.is_testing());
        assert_eq!(f.handle.hot(), Some(SessionKind::Test));

        assert_eq!(code(f.tester.start_test_proxy(VALID).await), -2);
        assert_eq!(f.engine.starts(), 1);

        assert!(f.tester.stop_test_proxy().await);
        assert!(!f.gate.is_testing());
        assert_eq!(f.engine.teardowns(), 1);

        assert!(f.tester.start_test_proxy(VALID).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_busy_while_live() {
        let f = fixture();
        f.gate.try_start_live().unwrap().hold();

        assert_eq!(code(f.tester.start_test_proxy(VALID).await), -1);
        assert_eq!(code(f.tester.measure_ping(VALID).await), -1);
        assert!(f.engine.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_synthesized_config_on_disk() {
        let f = fixture();
        let port = f.tester.start_test_proxy(VALID).await.unwrap();

        let path = f.root.join("cache").join("test_config.json");
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        let inbounds = written["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0]["type"], "socks");
        assert_eq!(inbounds[0]["listen"], "127.0.0.1");
        assert_eq!(inbounds[0]["listen_port"], port);
        assert_eq!(written["log"]["level"], "error");
        assert_eq!(f.engine.calls(), vec![path.to_string_lossy().into_owned()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_declared_socks_port_is_kept() {
        let f = fixture();
        let config = r#"{"inbounds":[{"type":"socks","listen_port":9999}],"outbounds":[{"type":"direct"}]}"#;

        assert_eq!(f.tester.start_test_proxy(config).await.unwrap(), 9999);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_other_failures() {
        let f = fixture();

        assert_eq!(code(f.tester.start_test_proxy("   ").await), -4);
        assert_eq!(code(f.tester.start_test_proxy("/no/such/file.json").await), -4);
        assert_eq!(code(f.tester.start_test_proxy("not json").await), -4);
        assert!(!f.gate.is_testing());

        f.engine.fail_start.store(true, Ordering::SeqCst);
        assert_eq!(code(f.tester.start_test_proxy(VALID).await), -4);
        assert!(!f.gate.is_testing());
        assert_eq!(f.handle.hot(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_when_idle() {
        let f = fixture();
        assert!(!f.tester.stop_test_proxy().await);
        assert!(f.engine.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_does_not_touch_live() {
        let f = fixture();
        f.tester.start_test_proxy(VALID).await.unwrap();

        // Live start preempted the test and took the engine
        f.gate.try_start_live().unwrap().hold();
        f.handle
            .launch(SessionKind::Live, "live.json", Arc::new(StubPlatform), || true)
            .unwrap();
        f.gate.stop_test();

        assert!(!f.tester.stop_test_proxy().await);
        assert_eq!(f.handle.hot(), Some(SessionKind::Live));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_measure_ping() {
        let f = fixture();
        let socks = spawn_fake_socks(0x00, "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n").await;
        let config = format!(
            r#"{{"inbounds":[{{"type":"socks","listen_port":{}}}],"outbounds":[{{"type":"direct"}}]}}"#,
            socks
        );

        let ms = f.tester.measure_ping(&config).await.unwrap();

        assert!(ms < 3000);
        assert!(!f.gate.is_testing());
        assert_eq!(f.handle.hot(), None);
        assert_eq!(f.engine.starts(), 1);
        assert_eq!(f.engine.teardowns(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_measure_ping_failure_tears_down() {
        let f = fixture();
        let socks = spawn_fake_socks(
            0x00,
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let config = format!(
            r#"{{"inbounds":[{{"type":"socks","listen_port":{}}}],"outbounds":[{{"type":"direct"}}]}}"#,
            socks
        );

        let result = f.tester.measure_ping(&config).await;

        assert!(matches!(result, Err(TestError::Probe(ProbeError::Status(_)))));
        assert!(!f.gate.is_testing());
        assert_eq!(f.engine.teardowns(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ping_shares_test_slot() {
        let f = fixture();
        f.tester.start_test_proxy(VALID).await.unwrap();

        assert_eq!(code(f.tester.measure_ping(VALID).await), -2);
        assert_eq!(f.handle.hot(), Some(SessionKind::Test));
    }
}

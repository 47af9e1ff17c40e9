//! Tunnel Engine
//!
//! The engine is a process-wide singleton: one forwarding session at a time,
//! started by invoking it with a config and torn down by invoking it with
//! the empty string.
//!
//! [`EngineHandle`] owns the engine on behalf of both controllers. It records
//! which kind of session is hot so that a late test teardown can never take
//! the live tunnel down with it. Engine calls block; callers run them on the
//! blocking pool.

use crate::platform::PlatformInterface;
use std::fmt;
use std::path::{Path, PathBuf};
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Config argument that tears the current session down
pub const TEARDOWN: &str = "";

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Session was preempted before the engine started")]
    Preempted,

    #[error("Engine task failed: {0}")]
    Task(String),
}

/// The bundled networking engine
pub trait TunnelEngine: Send + Sync {
    /// Start a session from `config` (path or JSON text), or tear the current
    /// one down when `config` is [`TEARDOWN`].
    fn invoke(&self, config: &str, platform: Arc<dyn PlatformInterface>) -> Result<(), EngineError>;
}

/// Who started the hot engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Live,
    Test,
}

struct HotSession {
    kind: SessionKind,
    platform: Arc<dyn PlatformInterface>,
}

/// Owned access to the engine singleton
pub struct EngineHandle {
    engine: Arc<dyn TunnelEngine>,
    hot: Mutex<Option<HotSession>>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self {
            engine,
            hot: Mutex::new(None),
        }
    }

    /// Kind of the running session, if any
    pub fn hot(&self) -> Option<SessionKind> {
        self.lock().as_ref().map(|session| session.kind)
    }

    /// Start a session
    ///
    /// `admit` is checked while holding the engine slot; returning `false`
    /// aborts with [`EngineError::Preempted`] before the engine is touched.
    /// A session still hot from a previous owner is torn down first. When the
    /// engine fails to start, a teardown is attempted so no half-started
    /// session is left behind.
    pub fn launch(
        &self,
        kind: SessionKind,
        config: &str,
        platform: Arc<dyn PlatformInterface>,
        admit: impl FnOnce() -> bool,
    ) -> Result<(), EngineError> {
        let mut hot = self.lock();

        if !admit() {
            return Err(EngineError::Preempted);
        }

        if let Some(previous) = hot.take() {
            warn!("Engine still running a {:?} session, tearing it down", previous.kind);
            self.invoke_teardown(previous.platform);
        }

        debug!("Engine: starting {:?} session", kind);
        match self.engine.invoke(config, platform.clone()) {
            Ok(()) => {
                *hot = Some(HotSession { kind, platform });
                info!("Engine: {:?} session started", kind);
                Ok(())
            }
            Err(e) => {
                self.invoke_teardown(platform);
                Err(e)
            }
        }
    }

    /// Tear down the session if `kind` owns it
    ///
    /// Returns whether a session was torn down. Engine failures are logged,
    /// and the slot is cleared either way.
    pub fn teardown(&self, kind: SessionKind) -> bool {
        let mut hot = self.lock();

        match hot.as_ref() {
            Some(session) if session.kind == kind => {}
            _ => return false,
        }

        if let Some(session) = hot.take() {
            self.invoke_teardown(session.platform);
            info!("Engine: {:?} session stopped", kind);
        }
        true
    }

    fn invoke_teardown(&self, platform: Arc<dyn PlatformInterface>) {
        if let Err(e) = self.engine.invoke(TEARDOWN, platform) {
            warn!("Engine teardown failed: {}", e);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<HotSession>> {
        self.hot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").field("hot", &self.hot()).finish()
    }
}

/// Run a blocking engine call off the async workers
pub async fn run_blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
}

/// Engine run as a child process
///
/// Runs `<binary> run -c <config> -D <work dir>`. The config argument must be
/// a path to a persisted config file. A teardown kills and reaps the child.
pub struct ProcessEngine {
    binary: PathBuf,
    work_dir: PathBuf,
    /// Grace period in which an immediate exit counts as a failed start
    startup_check: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessEngine {
    pub fn new(binary: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            startup_check: Duration::from_millis(100),
            child: Mutex::new(None),
        }
    }

    /// Is a child process currently running?
    pub fn is_running(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn spawn(
        &self,
        config: &Path,
        platform: Arc<dyn PlatformInterface>,
    ) -> Result<Child, EngineError> {
        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(config)
            .arg("-D")
            .arg(&self.work_dir)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::InvocationFailed(format!("{}: {}", self.binary.display(), e))
            })?;

        if let Some(stderr) = child.stderr.take() {
            forward_log(stderr, platform);
        }

        std::thread::sleep(self.startup_check);
        match child.try_wait() {
            Ok(None) => Ok(child),
            Ok(Some(status)) => Err(EngineError::InvocationFailed(format!(
                "engine exited during startup ({})",
                status
            ))),
            Err(e) => Err(EngineError::InvocationFailed(e.to_string())),
        }
    }

    fn stop_child(child: &mut Child) {
        if let Err(e) = child.kill() {
            debug!("Engine process already gone: {}", e);
        }
        match child.wait() {
            Ok(status) => debug!("Engine process exited ({})", status),
            Err(e) => warn!("Failed to reap engine process: {}", e),
        }
    }
}

/// Hand every line the engine writes to stderr to the platform log
fn forward_log(stderr: ChildStderr, platform: Arc<dyn PlatformInterface>) {
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => platform.write_log(&line),
                Err(e) => {
                    debug!("Engine log closed: {}", e);
                    break;
                }
            }
        }
    });
}

impl TunnelEngine for ProcessEngine {
    fn invoke(&self, config: &str, platform: Arc<dyn PlatformInterface>) -> Result<(), EngineError> {
        let mut current = self.child.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(mut child) = current.take() {
            Self::stop_child(&mut child);
        }

        if config == TEARDOWN {
            return Ok(());
        }

        let path = Path::new(config);
        if !path.is_file() {
            return Err(EngineError::InvocationFailed(
                "process engine needs a config file path".to_string(),
            ));
        }

        let child = self.spawn(path, platform)?;
        info!("Engine process started (pid {})", child.id());
        *current = Some(child);
        Ok(())
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(mut child) = child.take() {
            Self::stop_child(&mut child);
        }
    }
}

impl fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("binary", &self.binary)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

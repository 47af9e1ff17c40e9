//! Status Event Emitter
//!
//! One UI subscriber at a time. A new subscriber first receives the current
//! connection state, then every transition after it.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Lifecycle status as shown to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnStatus {
    Connected,
    Disconnected,
    /// Failure, with a reason when one is known
    Error(Option<String>),
}

impl VpnStatus {
    /// Error status carrying a reason
    pub fn error(reason: impl fmt::Display) -> Self {
        VpnStatus::Error(Some(reason.to_string()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, VpnStatus::Error(_))
    }
}

impl fmt::Display for VpnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnStatus::Connected => write!(f, "CONNECTED"),
            VpnStatus::Disconnected => write!(f, "DISCONNECTED"),
            VpnStatus::Error(None) => write!(f, "ERROR"),
            VpnStatus::Error(Some(reason)) => write!(f, "ERROR: {}", reason),
        }
    }
}

/// Single-sink status broadcaster
#[derive(Debug, Default)]
pub struct StatusEmitter {
    sink: Mutex<Option<Sender<VpnStatus>>>,
    connected: AtomicBool,
}

impl StatusEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the UI, replacing any previous subscriber
    ///
    /// The receiver starts with the current state.
    pub fn subscribe(&self) -> Receiver<VpnStatus> {
        let (tx, rx) = unbounded();
        let mut sink = self.lock();

        let current = if self.is_connected() {
            VpnStatus::Connected
        } else {
            VpnStatus::Disconnected
        };
        // Cannot fail, we hold the receiver
        let _ = tx.send(current);

        *sink = Some(tx);
        debug!("Status subscriber attached");
        rx
    }

    /// Detach the UI
    pub fn unsubscribe(&self) {
        *self.lock() = None;
        debug!("Status subscriber detached");
    }

    /// Publish a transition
    pub fn emit(&self, status: VpnStatus) {
        let mut sink = self.lock();

        // Record the state even when nobody listens, for the next subscriber
        self.connected
            .store(status == VpnStatus::Connected, Ordering::SeqCst);

        let Some(tx) = sink.as_ref() else {
            return;
        };
        debug!("Status: {}", status);
        if tx.send(status).is_err() {
            // Receiver dropped without unsubscribing
            *sink = None;
        }
    }

    /// Last emitted state was `CONNECTED`
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Sender<VpnStatus>>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Platform Capabilities
//!
//! Everything the core needs from the operating system, behind traits:
//!
//! - [`PlatformInterface`]: callbacks the engine makes into the host while it
//!   runs (socket protection and logging)
//! - [`TunProvider`]: creation and release of the virtual network interface
//! - [`ServiceHost`]: the foreground-service presence that keeps the process
//!   alive while the tunnel is up
//!
//! Test sessions run with [`StubPlatform`]; the live session runs with
//! [`ServicePlatform`], which forwards socket protection to the tunnel
//! provider.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// No descriptor available
pub const NO_FD: i32 = -1;

/// Platform errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    #[error("Failed to protect socket {0}")]
    ProtectFailed(i32),

    #[error("Tunnel interface could not be established")]
    InterfaceEstablishFailed,
}

/// Callbacks the engine makes into the host
///
/// Both have defaults, so an implementation only overrides what its
/// platform actually provides.
pub trait PlatformInterface: Send + Sync {
    /// Keep an engine socket out of the tunnel
    fn auto_detect_interface_control(&self, _fd: i32) -> Result<(), PlatformError> {
        Ok(())
    }

    /// Engine log line
    fn write_log(&self, message: &str) {
        debug!(target: "engine", "{}", message);
    }
}

/// Capabilities for sessions that never touch the OS (test proxies)
#[derive(Debug, Clone, Copy, Default)]
pub struct StubPlatform;

impl PlatformInterface for StubPlatform {}

/// Capabilities of the live VPN service
pub struct ServicePlatform {
    tun: Arc<dyn TunProvider>,
}

impl ServicePlatform {
    pub fn new(tun: Arc<dyn TunProvider>) -> Self {
        Self { tun }
    }
}

impl PlatformInterface for ServicePlatform {
    // Without this the tunnel comes up but engine traffic loops back into it
    fn auto_detect_interface_control(&self, fd: i32) -> Result<(), PlatformError> {
        if self.tun.protect(fd) {
            Ok(())
        } else {
            Err(PlatformError::ProtectFailed(fd))
        }
    }
}

impl fmt::Debug for ServicePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePlatform").finish_non_exhaustive()
    }
}

/// Virtual interface parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunOptions {
    /// Session label shown by the OS
    pub session: String,
    /// Interface address and prefix length
    pub address: (IpAddr, u8),
    /// Routed prefixes
    pub routes: Vec<(IpAddr, u8)>,
    /// Interface MTU
    pub mtu: u32,
    /// DNS servers
    pub dns: Vec<IpAddr>,
}

/// An established tunnel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunDescriptor {
    pub fd: i32,
}

/// Creates and releases the OS tunnel interface
pub trait TunProvider: Send + Sync {
    /// Establish the interface; `None` when the OS refuses
    fn establish(&self, options: &TunOptions) -> Option<TunDescriptor>;

    /// Release an interface returned by `establish`
    fn release(&self, descriptor: TunDescriptor);

    /// Exclude a socket from the tunnel
    fn protect(&self, fd: i32) -> bool;
}

/// Socket protection callback installed by the host
pub type ProtectFn = Box<dyn Fn(i32) -> bool + Send + Sync>;

/// Tunnel provider fed by the embedding host
///
/// The host (the Android `VpnService`) builds the interface itself and hands
/// the descriptor over; socket protection calls back into the host. The
/// interface belongs to the host, so the descriptor stays usable across
/// sessions until the host revokes it.
pub struct HostTunProvider {
    fd: AtomicI32,
    protect: Mutex<Option<ProtectFn>>,
}

impl HostTunProvider {
    /// Provider with no descriptor yet
    pub fn new() -> Self {
        Self {
            fd: AtomicI32::new(NO_FD),
            protect: Mutex::new(None),
        }
    }

    /// Provider with a descriptor established up front
    pub fn with_fd(fd: i32) -> Self {
        let provider = Self::new();
        provider.set_fd(fd);
        provider
    }

    /// Hand over the descriptor of an established interface
    pub fn set_fd(&self, fd: i32) {
        info!("Host tunnel descriptor set to {}", fd);
        self.fd.store(fd, Ordering::SeqCst);
    }

    /// Current descriptor, or `NO_FD`
    pub fn fd(&self) -> i32 {
        self.fd.load(Ordering::SeqCst)
    }

    /// Forget the descriptor once the host has closed the interface
    pub fn revoke(&self) -> i32 {
        let fd = self.fd.swap(NO_FD, Ordering::SeqCst);
        info!("Host tunnel descriptor {} revoked", fd);
        fd
    }

    /// Install the host's socket protection
    pub fn set_protect(&self, protect: ProtectFn) {
        *self.protect.lock().unwrap_or_else(|e| e.into_inner()) = Some(protect);
    }
}

impl Default for HostTunProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TunProvider for HostTunProvider {
    fn establish(&self, options: &TunOptions) -> Option<TunDescriptor> {
        let fd = self.fd();
        if fd < 0 {
            warn!("No tunnel descriptor from host for session '{}'", options.session);
            return None;
        }

        debug!(
            "Using host tunnel fd {} ({}/{}, mtu {})",
            fd, options.address.0, options.address.1, options.mtu
        );
        Some(TunDescriptor { fd })
    }

    fn release(&self, descriptor: TunDescriptor) {
        // Closing is up to the host; the next session reuses the interface
        debug!("Session done with host tunnel fd {}", descriptor.fd);
    }

    fn protect(&self, fd: i32) -> bool {
        match self.protect.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(protect) => protect(fd),
            None => {
                debug!("No protect callback installed, socket {} left as-is", fd);
                true
            }
        }
    }
}

impl fmt::Debug for HostTunProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTunProvider").field("fd", &self.fd()).finish()
    }
}

/// Notification shown while the service runs in the foreground
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundNotice {
    pub channel_id: String,
    pub title: String,
    pub text: String,
}

/// Foreground-service presence
pub trait ServiceHost: Send + Sync {
    fn enter_foreground(&self, notice: &ForegroundNotice);
    fn exit_foreground(&self);
}

/// Acquire the foreground presence until the guard drops
pub fn foreground(host: Arc<dyn ServiceHost>, notice: &ForegroundNotice) -> ForegroundGuard {
    host.enter_foreground(notice);
    ForegroundGuard { host }
}

/// Keeps the service in the foreground
#[must_use = "dropping the guard leaves the foreground"]
pub struct ForegroundGuard {
    host: Arc<dyn ServiceHost>,
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        self.host.exit_foreground();
    }
}

impl fmt::Debug for ForegroundGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForegroundGuard").finish_non_exhaustive()
    }
}

/// Host without a notification surface; only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessHost;

impl ServiceHost for HeadlessHost {
    fn enter_foreground(&self, notice: &ForegroundNotice) {
        info!("Foreground: {} - {} [{}]", notice.title, notice.text, notice.channel_id);
    }

    fn exit_foreground(&self) {
        info!("Foreground released");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Host double counting foreground transitions
    #[derive(Default)]
    pub struct CountingHost {
        pub entered: AtomicUsize,
        pub exited: AtomicUsize,
    }

    impl ServiceHost for CountingHost {
        fn enter_foreground(&self, _notice: &ForegroundNotice) {
            self.entered.fetch_add(1, Ordering::SeqCst);
        }

        fn exit_foreground(&self) {
            self.exited.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingHost;
    use super::*;
    use std::net::Ipv4Addr;

    fn options() -> TunOptions {
        TunOptions {
            session: "test".to_string(),
            address: (IpAddr::V4(Ipv4Addr::new(172, 19, 0, 1)), 28),
            routes: vec![(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)],
            mtu: 1500,
            dns: vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))],
        }
    }

    #[test]
    fn test_stub_defaults() {
        let stub = StubPlatform;
        assert!(stub.auto_detect_interface_control(5).is_ok());
        stub.write_log("engine ready");
    }

    #[test]
    fn test_host_provider_without_fd() {
        let provider = HostTunProvider::new();
        assert_eq!(provider.establish(&options()), None);
    }

    #[test]
    fn test_host_provider_survives_release() {
        let provider = HostTunProvider::with_fd(12);
        let descriptor = provider.establish(&options()).unwrap();
        assert_eq!(descriptor.fd, 12);

        provider.release(descriptor);
        assert_eq!(provider.fd(), 12);
        assert_eq!(provider.establish(&options()), Some(TunDescriptor { fd: 12 }));
    }

    #[test]
    fn test_host_provider_revoke() {
        let provider = HostTunProvider::with_fd(12);
        assert_eq!(provider.revoke(), 12);
        assert_eq!(provider.fd(), NO_FD);
        assert_eq!(provider.establish(&options()), None);

        provider.set_fd(14);
        assert_eq!(provider.establish(&options()), Some(TunDescriptor { fd: 14 }));
    }

    #[test]
    fn test_service_platform_protects() {
        let provider = Arc::new(HostTunProvider::new());
        provider.set_protect(Box::new(|fd| fd != 13));

        let platform = ServicePlatform::new(provider);
        assert!(platform.auto_detect_interface_control(10).is_ok());
        assert!(matches!(
            platform.auto_detect_interface_control(13),
            Err(PlatformError::ProtectFailed(13))
        ));
    }

    #[test]
    fn test_foreground_guard() {
        let host = Arc::new(CountingHost::default());
        let notice = ForegroundNotice {
            channel_id: "c".to_string(),
            title: "t".to_string(),
            text: "x".to_string(),
        };

        let guard = foreground(host.clone(), &notice);
        assert_eq!(host.entered.load(Ordering::SeqCst), 1);
        assert_eq!(host.exited.load(Ordering::SeqCst), 0);

        drop(guard);
        assert_eq!(host.exited.load(Ordering::SeqCst), 1);
    }
}

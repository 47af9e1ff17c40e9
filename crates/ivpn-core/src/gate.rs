//! Session Gate
//!
//! Serializes session starts over the single engine instance.
//!
//! # Rules
//!
//! - At most one live session and at most one test session
//! - A live session rejects new tests
//! - A running test does not reject a live start; the live session preempts it
//!
//! Admission hands out a permit. Dropping the permit releases the flag, so
//! every early return and `?` on a start path gives the gate back. A start
//! path that succeeds calls `hold()` and the flag stays set until the
//! matching `stop_*` call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// No test holds the gate
const NO_TEST: u64 = 0;

/// Which kind of session blocked an admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Busy {
    #[error("VPN session is running")]
    Live,

    #[error("A connectivity test is already running")]
    Test,
}

/// Live/test mutual exclusion
///
/// The test slot stores a ticket instead of a bare flag, so a test that was
/// preempted and finishes late cannot release a newer test's slot.
#[derive(Debug, Default)]
pub struct SessionGate {
    /// Live session active
    running: AtomicBool,
    /// Ticket of the test holding the slot, or `NO_TEST`
    test: AtomicU64,
    /// Ticket source
    next_ticket: AtomicU64,
}

impl SessionGate {
    /// Create an idle gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Is a live session running (or starting)?
    pub fn is_live(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Is a test session running (or starting)?
    pub fn is_testing(&self) -> bool {
        self.test.load(Ordering::SeqCst) != NO_TEST
    }

    /// Admit a test session
    pub fn try_start_test(&self) -> Result<TestPermit<'_>, Busy> {
        if self.is_live() {
            return Err(Busy::Live);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .test
            .compare_exchange(NO_TEST, ticket, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Busy::Test);
        }

        // A live start may have slipped in between the two checks
        if self.is_live() {
            self.release_test(ticket);
            return Err(Busy::Live);
        }

        debug!("Gate: test {} admitted", ticket);
        Ok(TestPermit {
            gate: self,
            ticket,
            armed: true,
        })
    }

    /// Admit a live session
    ///
    /// Fails only when a live session is already running. When a test holds
    /// the slot the permit reports it; the caller tears the test engine down
    /// and then calls [`SessionGate::stop_test`].
    pub fn try_start_live(&self) -> Result<LivePermit<'_>, Busy> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Busy::Live);
        }

        let preempts_test = self.is_testing();
        debug!("Gate: live admitted (preempts test: {})", preempts_test);

        Ok(LivePermit {
            gate: self,
            preempts_test,
            armed: true,
        })
    }

    /// Release the live flag; returns whether it was set
    pub fn stop_live(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    /// Release the test slot; returns whether a test held it
    pub fn stop_test(&self) -> bool {
        self.test.swap(NO_TEST, Ordering::SeqCst) != NO_TEST
    }

    fn release_test(&self, ticket: u64) {
        let _ = self
            .test
            .compare_exchange(ticket, NO_TEST, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Admission of a test session
#[must_use = "dropping the permit releases the test slot"]
#[derive(Debug)]
pub struct TestPermit<'a> {
    gate: &'a SessionGate,
    ticket: u64,
    armed: bool,
}

impl TestPermit<'_> {
    /// Keep the slot after the permit goes away (persistent test proxy)
    pub fn hold(mut self) {
        self.armed = false;
    }

    /// Still owns the slot (not preempted or stopped)?
    pub fn is_current(&self) -> bool {
        self.gate.test.load(Ordering::SeqCst) == self.ticket
    }
}

impl Drop for TestPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.release_test(self.ticket);
        }
    }
}

/// Admission of a live session
#[must_use = "dropping the permit releases the live flag"]
#[derive(Debug)]
pub struct LivePermit<'a> {
    gate: &'a SessionGate,
    preempts_test: bool,
    armed: bool,
}

impl LivePermit<'_> {
    /// A test held the slot when the live session was admitted
    pub fn preempts_test(&self) -> bool {
        self.preempts_test
    }

    /// Keep the live flag set until `stop_live`
    pub fn hold(mut self) {
        self.armed = false;
    }
}

impl Drop for LivePermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.stop_live();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_idle_gate() {
        let gate = SessionGate::new();
        assert!(!gate.is_live());
        assert!(!gate.is_testing());
        assert!(!gate.stop_live());
        assert!(!gate.stop_test());
    }

    #[test]
    fn test_permit_drop_releases() {
        let gate = SessionGate::new();
        {
            let _permit = gate.try_start_test().unwrap();
            assert!(gate.is_testing());
        }
        assert!(!gate.is_testing());

        {
            let _permit = gate.try_start_live().unwrap();
            assert!(gate.is_live());
        }
        assert!(!gate.is_live());
    }

    #[test]
    fn test_hold_keeps_flags() {
        let gate = SessionGate::new();
        gate.try_start_test().unwrap().hold();
        assert!(gate.is_testing());
        assert_eq!(gate.try_start_test().unwrap_err(), Busy::Test);

        assert!(gate.stop_test());
        assert!(!gate.is_testing());
        assert!(!gate.stop_test());
    }

    #[test]
    fn test_live_blocks_test() {
        let gate = SessionGate::new();
        gate.try_start_live().unwrap().hold();

        assert_eq!(gate.try_start_test().unwrap_err(), Busy::Live);
        assert_eq!(gate.try_start_live().unwrap_err(), Busy::Live);

        assert!(gate.stop_live());
        assert!(gate.try_start_test().is_ok());
    }

    #[test]
    fn test_live_preempts_test() {
        let gate = SessionGate::new();
        gate.try_start_test().unwrap().hold();

        let live = gate.try_start_live().unwrap();
        assert!(live.preempts_test());
        live.hold();

        assert!(gate.stop_test());
        assert!(gate.is_live());
        assert!(!gate.is_testing());
    }

    #[test]
    fn test_stale_permit_keeps_newer_test() {
        let gate = SessionGate::new();
        let stale = gate.try_start_test().unwrap();

        // Preempted by a live session that then stops
        gate.try_start_live().unwrap().hold();
        gate.stop_test();
        gate.stop_live();
        assert!(!stale.is_current());

        gate.try_start_test().unwrap().hold();
        drop(stale);

        assert!(gate.is_testing());
    }

    #[test]
    fn test_concurrent_test_admission() {
        let gate = Arc::new(SessionGate::new());
        let barrier = Arc::new(Barrier::new(16));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                let admitted = admitted.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if let Ok(permit) = gate.try_start_test() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        permit.hold();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_live_and_test() {
        for _ in 0..200 {
            let gate = Arc::new(SessionGate::new());
            let barrier = Arc::new(Barrier::new(2));

            let test_gate = gate.clone();
            let test_barrier = barrier.clone();
            let tester = thread::spawn(move || {
                test_barrier.wait();
                test_gate.try_start_test().map(|permit| permit.hold()).is_ok()
            });

            barrier.wait();
            let live = gate.try_start_live().unwrap();
            let preempts = live.preempts_test();
            live.hold();

            let test_admitted = tester.join().unwrap();

            // Either the test lost, or the live session saw it and must preempt
            if test_admitted {
                assert!(preempts);
                assert!(gate.stop_test());
            }
            assert!(gate.is_live());
            assert!(!gate.is_testing());
        }
    }
}

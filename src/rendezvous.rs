//! Configuration rendezvous: a single-slot synchronous request/response
//! matcher used by `GetConfigurationData`/`SetConfigurationData`.
//!
//! Grounded on the `m_configEvent`/`m_configResult` pairing in
//! `original_source/kromek_driver/src/D3DataProcessor.cpp`'s
//! `SendConfigMessage`: a caller thread posts a request, blocks on a
//! manual-reset event with a fixed timeout, and the worker thread (on seeing
//! a configuration-report packet come back) fills in the result and signals
//! the event. Only one request may be in flight at a time, matching the
//! original's single `m_configEvent` field.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Timeout for a configuration round-trip.
pub const CONFIGURATION_QUERY_TIMEOUT_MS: u64 = 3000;

/// A manual-reset event, modeling `kmk::Event` (set once, stays set until
/// explicitly reset). Built on a `Condvar` rather than anything OS-specific,
/// matching the `std::sync` concurrency style used throughout this crate.
#[derive(Default)]
pub struct ManualResetEvent {
    inner: Mutex<bool>,
    cv: Condvar,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut signaled = self.inner.lock().unwrap();
        *signaled = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap() = false;
    }

    /// Blocks until set or `timeout` elapses. Returns `true` if set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap();
        *guard
    }
}

/// Outcome of a completed configuration round-trip.
#[derive(Clone)]
pub enum RendezvousOutcome {
    /// The device replied with a configuration packet; payload is its raw
    /// content bytes.
    Reply(Vec<u8>),
    /// The device reported an internal error instead of a reply.
    DeviceError { code: i32, message: String },
}

struct Slot {
    /// `report_id` the rendezvous is waiting for a reply to; `None` when
    /// idle.
    expected_report_id: Option<u8>,
    outcome: Option<RendezvousOutcome>,
}

/// Single-slot request/response matcher, shared between the caller thread
/// (via [`Rendezvous::request`]) and the worker thread (via
/// [`Rendezvous::complete`]/[`Rendezvous::fail`]).
pub struct Rendezvous {
    slot: Mutex<Slot>,
    event: ManualResetEvent,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                expected_report_id: None,
                outcome: None,
            }),
            event: ManualResetEvent::new(),
        }
    }

    /// True if a request is currently in flight (only one configuration
    /// request may be outstanding at a time).
    pub fn is_busy(&self) -> bool {
        self.slot.lock().unwrap().expected_report_id.is_some()
    }

    /// Registers `expected_report_id` as the reply this rendezvous is
    /// waiting for. Returns `false` without effect if already busy.
    pub fn begin(&self, expected_report_id: u8) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.expected_report_id.is_some() {
            return false;
        }
        slot.expected_report_id = Some(expected_report_id);
        slot.outcome = None;
        self.event.reset();
        true
    }

    /// Called from the worker thread when a configuration-report packet for
    /// `report_id` arrives. No-op if nothing is waiting on this ID.
    pub fn complete(&self, report_id: u8, payload: &[u8]) {
        let mut slot = self.slot.lock().unwrap();
        if slot.expected_report_id != Some(report_id) {
            return;
        }
        slot.outcome = Some(RendezvousOutcome::Reply(payload.to_vec()));
        drop(slot);
        self.event.set();
    }

    /// Called from the worker thread when the device reports an internal
    /// error while a configuration request is outstanding.
    pub fn fail(&self, code: i32, message: String) {
        let mut slot = self.slot.lock().unwrap();
        if slot.expected_report_id.is_none() {
            return;
        }
        slot.outcome = Some(RendezvousOutcome::DeviceError { code, message });
        drop(slot);
        self.event.set();
    }

    /// Blocks the caller until a matching reply/error arrives or
    /// [`CONFIGURATION_QUERY_TIMEOUT_MS`] elapses, then clears the slot.
    pub fn wait(&self) -> Option<RendezvousOutcome> {
        self.wait_timeout(Duration::from_millis(CONFIGURATION_QUERY_TIMEOUT_MS))
    }

    /// Like [`Rendezvous::wait`], but with an overridable timeout (crate-level
    /// tunable, see `AcquisitionCore::builder`).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RendezvousOutcome> {
        let signaled = self.event.wait_timeout(timeout);
        let mut slot = self.slot.lock().unwrap();
        let outcome = if signaled { slot.outcome.take() } else { None };
        slot.expected_report_id = None;
        slot.outcome = None;
        outcome
    }
}

/// Shared handle convenience, since the acquisition core and the worker
/// thread each need their own `Arc` to the same rendezvous.
pub type SharedRendezvous = Arc<Rendezvous>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn begin_rejects_concurrent_request() {
        let r = Rendezvous::new();
        assert!(r.begin(0x82));
        assert!(!r.begin(0x86));
    }

    #[test]
    fn complete_wakes_matching_waiter() {
        let r = Arc::new(Rendezvous::new());
        assert!(r.begin(0x82));
        let r2 = r.clone();
        let handle = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(10));
            r2.complete(0x82, &[1, 2, 3]);
        });
        let outcome = r.wait();
        handle.join().unwrap();
        match outcome {
            Some(RendezvousOutcome::Reply(payload)) => assert_eq!(payload, vec![1, 2, 3]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn complete_with_wrong_report_id_is_ignored() {
        let r = Arc::new(Rendezvous::new());
        assert!(r.begin(0x82));
        r.complete(0x86, &[9]);
        assert!(r.is_busy());
    }

    #[test]
    fn fail_delivers_device_error() {
        let r = Arc::new(Rendezvous::new());
        assert!(r.begin(0x82));
        r.fail(102, "boom".to_string());
        match r.wait() {
            Some(RendezvousOutcome::DeviceError { code, message }) => {
                assert_eq!(code, 102);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn wait_clears_slot_so_next_request_can_begin() {
        let r = Rendezvous::new();
        assert!(r.begin(0x82));
        r.complete(0x82, &[]);
        r.wait();
        assert!(!r.is_busy());
        assert!(r.begin(0x86));
    }
}

impl std::fmt::Debug for RendezvousOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RendezvousOutcome::Reply(payload) => {
                write!(f, "Reply({} bytes)", payload.len())
            }
            RendezvousOutcome::DeviceError { code, message } => {
                write!(f, "DeviceError({code}, {message:?})")
            }
        }
    }
}

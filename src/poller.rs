//! Spectrum poller: periodically asks the device for its current spectrum,
//! auto-detecting whether it replies with `Spectrum16` or `RadiometricsV1`
//! reports.
//!
//! Grounded on the polling loop in `original_source/kromek_driver/src/
//! D3DataProcessor.cpp`'s `ProcessThreadProc`, which issues a
//! `SendSpectrumRequest` on a fixed cadence and probes with a
//! `RadiometricsV1` request first: if the device answers before the next
//! tick, that's the format it speaks; if nothing comes back, the device is
//! assumed to only understand the older `Spectrum16` format.

use crate::packet::report_id;

/// Polling cadence ("roughly every 100ms").
pub const QUERY_SPECTRUM_RATE_MS: i64 = 100;

/// What kind of spectrum report the device has been observed to send, or is
/// currently being probed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Not yet probed.
    Unknown,
    /// The `RadiometricsV1` probe was just sent; the next tick decides
    /// whether the device answered it.
    Determining,
    Spectrum16,
    RadiometricsV1,
}

impl ReportKind {
    fn request_report_id(self) -> u8 {
        match self {
            ReportKind::RadiometricsV1 => report_id::RADIOMETRICS_V1,
            _ => report_id::SPECTRUM_16,
        }
    }
}

/// Drives the "should I send a spectrum request now" decision and tracks
/// which report type the device has settled on.
pub struct SpectrumPoller {
    kind: ReportKind,
    next_query_time_ms: i64,
    /// Set whenever a spectrum-shaped reply arrives since the last request
    /// was sent; read (and reset) the next time a request is built, to
    /// decide whether the `Determining` probe got an answer.
    waiter_signaled: bool,
    rate_ms: i64,
}

impl Default for SpectrumPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumPoller {
    pub fn new() -> Self {
        Self::with_rate(QUERY_SPECTRUM_RATE_MS)
    }

    /// Builds a poller with a non-default query cadence (crate-level
    /// tunable, see `AcquisitionCore::builder`).
    pub fn with_rate(rate_ms: i64) -> Self {
        Self {
            kind: ReportKind::Unknown,
            next_query_time_ms: 0,
            waiter_signaled: false,
            rate_ms,
        }
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    /// Resets the poller to its just-started state, scheduling the first
    /// query for `now_ms`. `supports_radiometrics_v1` is the device-family
    /// hint passed into the core's config: when set, discovery is skipped
    /// entirely and the poller commits to `RadiometricsV1` from the start.
    pub fn start(&mut self, now_ms: i64, supports_radiometrics_v1: bool) {
        self.kind = if supports_radiometrics_v1 {
            ReportKind::RadiometricsV1
        } else {
            ReportKind::Unknown
        };
        self.next_query_time_ms = now_ms;
        self.waiter_signaled = false;
    }

    /// Whether a spectrum request should be sent at `now_ms`.
    pub fn should_query(&self, now_ms: i64) -> bool {
        now_ms >= self.next_query_time_ms
    }

    /// Advances the discovery state machine one step and returns the report
    /// ID to request with. Resets the spectrum-query waiter immediately
    /// before sending, matching the original's `SendSpectrumRequest`.
    pub fn select_report_id(&mut self) -> u8 {
        let id = match self.kind {
            ReportKind::Unknown => {
                self.kind = ReportKind::Determining;
                report_id::RADIOMETRICS_V1
            }
            ReportKind::Determining => {
                self.kind = if self.waiter_signaled {
                    ReportKind::RadiometricsV1
                } else {
                    ReportKind::Spectrum16
                };
                self.kind.request_report_id()
            }
            ReportKind::RadiometricsV1 | ReportKind::Spectrum16 => self.kind.request_report_id(),
        };
        self.waiter_signaled = false;
        id
    }

    /// Records that a request was just sent at `now_ms`, scheduling the
    /// next one.
    pub fn mark_requested(&mut self, now_ms: i64) {
        self.next_query_time_ms = now_ms + self.rate_ms;
    }

    pub fn next_query_time_ms(&self) -> i64 {
        self.next_query_time_ms
    }

    /// Called when any spectrum-shaped report arrives, signalling the
    /// discovery path that the last probe got an answer.
    pub fn observe_reply(&mut self) {
        self.waiter_signaled = true;
    }

    /// Locks in `kind` directly, bypassing the next `select_report_id`
    /// decision. Used when an `InternalError(WarmingUp)` reply arrives
    /// while `Determining` (spec: that reply means the device is a
    /// `RadiometricsV1` device that just hasn't finished booting yet).
    pub fn lock_in(&mut self, kind: ReportKind) {
        self.kind = kind;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_query_before_scheduled_time() {
        let mut poller = SpectrumPoller::new();
        poller.start(1_000, false);
        assert!(poller.should_query(1_000));
        poller.mark_requested(1_000);
        assert!(!poller.should_query(1_050));
        assert!(poller.should_query(1_100));
    }

    #[test]
    fn probes_radiometrics_v1_first_by_default() {
        let mut poller = SpectrumPoller::new();
        poller.start(0, false);
        assert_eq!(poller.select_report_id(), report_id::RADIOMETRICS_V1);
        assert_eq!(poller.kind(), ReportKind::Determining);
    }

    #[test]
    fn determining_locks_in_radiometrics_v1_when_answered() {
        let mut poller = SpectrumPoller::new();
        poller.start(0, false);
        poller.select_report_id();
        poller.observe_reply();
        assert_eq!(poller.select_report_id(), report_id::RADIOMETRICS_V1);
        assert_eq!(poller.kind(), ReportKind::RadiometricsV1);
        // Stays locked on subsequent ticks.
        assert_eq!(poller.select_report_id(), report_id::RADIOMETRICS_V1);
    }

    #[test]
    fn determining_falls_back_to_spectrum16_when_unanswered() {
        let mut poller = SpectrumPoller::new();
        poller.start(0, false);
        poller.select_report_id();
        // No observe_reply() call: the probe went unanswered.
        assert_eq!(poller.select_report_id(), report_id::SPECTRUM_16);
        assert_eq!(poller.kind(), ReportKind::Spectrum16);
        assert_eq!(poller.select_report_id(), report_id::SPECTRUM_16);
    }

    #[test]
    fn supports_radiometrics_v1_hint_skips_discovery() {
        let mut poller = SpectrumPoller::new();
        poller.start(0, true);
        assert_eq!(poller.kind(), ReportKind::RadiometricsV1);
        assert_eq!(poller.select_report_id(), report_id::RADIOMETRICS_V1);
    }

    #[test]
    fn lock_in_overrides_kind_directly() {
        let mut poller = SpectrumPoller::new();
        poller.start(0, false);
        poller.select_report_id();
        poller.lock_in(ReportKind::RadiometricsV1);
        assert_eq!(poller.kind(), ReportKind::RadiometricsV1);
    }
}

//! Acquisition state machine and worker thread.
//!
//! Grounded on `D3DataProcessor`'s `ProcessThreadProc` main loop and its
//! `StartProcessing`/`StopProcessing`/`TransitionExecutionState` trio
//! (`original_source/kromek_driver/src/D3DataProcessor.cpp`). Two mutexes
//! are kept disjoint, as in that original: `state` (execution/desired state,
//! the poller, accumulators) and `registry` (per-component status, sinks,
//! properties) — a callback is only ever invoked after both are released.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{code, Result};
use crate::events::ComponentEvent;
use crate::heatshrink;
use crate::packet::{
    component_id, internal_error_id, report_id, MessageHeader, CONFIG_MASK_USE_PARENT,
    MAX_REPORT_SIZE, SPECTRUM_SIZE,
};
use crate::poller::{ReportKind, SpectrumPoller, QUERY_SPECTRUM_RATE_MS};
use crate::registry::{ComponentKind, ComponentRegistry, ComponentStatus, PropertyKey};
use crate::rendezvous::{Rendezvous, RendezvousOutcome, CONFIGURATION_QUERY_TIMEOUT_MS};
use crate::streamer::PacketStreamer;
use crate::transport::Transport;

/// How long a full spectrum report takes to traverse the wire, used to give
/// the device time to finish sending before the transport is torn down
const SPECTRUM_TRANSMISSION_TIME_MS: i64 = 100;

const HEATSHRINK_WINDOW_BITS: u8 = 9;
const HEATSHRINK_LOOKAHEAD_BITS: u8 = 8;

/// Coarse-grained thread/transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running,
    Finishing,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DesiredState {
    Run,
    Finish,
    Stop,
}

/// Tunables a caller may override from their defaults.
pub struct CoreConfig {
    pub supports_radiometrics_v1: bool,
    pub neutron_is_gamma: bool,
    pub spectrum_transmission_time_ms: i64,
    pub query_spectrum_rate_ms: i64,
    pub configuration_query_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            supports_radiometrics_v1: false,
            neutron_is_gamma: false,
            spectrum_transmission_time_ms: SPECTRUM_TRANSMISSION_TIME_MS,
            query_spectrum_rate_ms: QUERY_SPECTRUM_RATE_MS,
            configuration_query_timeout_ms: CONFIGURATION_QUERY_TIMEOUT_MS,
        }
    }
}

/// Builds an [`AcquisitionCore`] from a transport, a streamer and an
/// optional set of [`CoreConfig`] overrides.
pub struct CoreConfigBuilder {
    config: CoreConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            clock: None,
        }
    }

    pub fn supports_radiometrics_v1(mut self, value: bool) -> Self {
        self.config.supports_radiometrics_v1 = value;
        self
    }

    pub fn neutron_is_gamma(mut self, value: bool) -> Self {
        self.config.neutron_is_gamma = value;
        self
    }

    pub fn spectrum_transmission_time_ms(mut self, value: i64) -> Self {
        self.config.spectrum_transmission_time_ms = value;
        self
    }

    pub fn query_spectrum_rate_ms(mut self, value: i64) -> Self {
        self.config.query_spectrum_rate_ms = value;
        self
    }

    pub fn configuration_query_timeout_ms(mut self, value: u64) -> Self {
        self.config.configuration_query_timeout_ms = value;
        self
    }

    /// Overrides the monotonic clock; intended for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build<T, S>(self, transport: T, streamer: S) -> AcquisitionCore<T, S>
    where
        T: Transport + 'static,
        S: PacketStreamer + 'static,
    {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        AcquisitionCore::with_clock(transport, streamer, self.config, clock)
    }
}

impl Default for CoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct State {
    execution: ExecutionState,
    desired: DesiredState,
    ignore_first_spectrum: bool,
    start_acquisition_ts_ms: i64,
    accumulated_real_time_ms: i64,
    last_spectrum_request_ms: i64,
    poller: SpectrumPoller,
}

struct Inner<T, S> {
    transport: Mutex<T>,
    streamer: Mutex<S>,
    registry: Mutex<ComponentRegistry>,
    rendezvous: Rendezvous,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    wake: crate::rendezvous::ManualResetEvent,
    errors: Mutex<Vec<(i32, String)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: CoreConfig,
}

/// Drives a single transport through packet reassembly, decompression,
/// component dispatch and the configuration rendezvous.
///
/// `T` and `S` are fixed for the lifetime of a core: one transport, one
/// streamer variant, matching the original's one-`IDataInterface`-per-
/// `D3DataProcessor` shape.
pub struct AcquisitionCore<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for AcquisitionCore<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, S> AcquisitionCore<T, S>
where
    T: Transport + 'static,
    S: PacketStreamer + 'static,
{
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    pub fn new(transport: T, streamer: S, config: CoreConfig) -> Self {
        Self::with_clock(transport, streamer, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(transport: T, streamer: S, config: CoreConfig, clock: Arc<dyn Clock>) -> Self {
        let poller = SpectrumPoller::with_rate(config.query_spectrum_rate_ms);
        let inner = Arc::new(Inner {
            transport: Mutex::new(transport),
            streamer: Mutex::new(streamer),
            registry: Mutex::new(ComponentRegistry::new()),
            rendezvous: Rendezvous::new(),
            clock,
            state: Mutex::new(State {
                execution: ExecutionState::Idle,
                desired: DesiredState::Stop,
                ignore_first_spectrum: true,
                start_acquisition_ts_ms: 0,
                accumulated_real_time_ms: 0,
                last_spectrum_request_ms: 0,
                poller,
            }),
            wake: crate::rendezvous::ManualResetEvent::new(),
            errors: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            config,
        });

        let data_ready_inner = inner.clone();
        let error_inner = inner.clone();
        {
            let mut transport = inner.transport.lock().unwrap();
            transport.set_data_ready_callback(Box::new(move |data: &[u8]| {
                data_ready_inner.on_data_ready(data);
            }));
            transport.set_error_callback(Box::new(move |code: i32, message: String| {
                error_inner.push_error(code, message);
                error_inner.wake.set();
            }));
        }

        Self { inner }
    }

    /// Registers a sink for `component_id`. Unknown IDs are ignored.
    pub fn add_component(&self, component_id: u8, sink: Box<dyn crate::events::ComponentSink>) {
        self.inner
            .registry
            .lock()
            .unwrap()
            .add_component(component_id, sink);
    }

    pub fn remove_component(&self, component_id: u8) {
        self.inner.registry.lock().unwrap().remove_component(component_id);
    }

    pub fn get_component_property(&self, component_id: u8, key: PropertyKey) -> f32 {
        self.inner.registry.lock().unwrap().get_property(component_id, key)
    }

    /// Milliseconds of real (acquisition) time accumulated by `component_id`
    /// since its last start/reset. `0` for an unknown ID.
    pub fn get_real_time(&self, component_id: u8) -> i64 {
        match ComponentKind::from_id(component_id) {
            Some(kind) => self.inner.registry.lock().unwrap().slot(kind).accumulated_real_time_ms,
            None => 0,
        }
    }

    /// Zeroes `component_id`'s accumulated real-time counter without
    /// otherwise touching its status or start timestamp.
    pub fn reset_real_time(&self, component_id: u8) {
        if let Some(kind) = ComponentKind::from_id(component_id) {
            self.inner.registry.lock().unwrap().slot_mut(kind).accumulated_real_time_ms = 0;
        }
    }

    /// The timestamp (ms, same monotonic epoch as [`Clock::now_ms`]) at which
    /// `component_id` last started or stopped. `0` for an unknown ID.
    pub fn get_start_time(&self, component_id: u8) -> i64 {
        match ComponentKind::from_id(component_id) {
            Some(kind) => self.inner.registry.lock().unwrap().slot(kind).start_stop_ts_ms,
            None => 0,
        }
    }

    /// Overrides `component_id`'s start/stop timestamp, e.g. to rebase the
    /// delivery-decision window (see [`Inner::decide_deliveries`]) without a
    /// full stop/start cycle.
    pub fn set_start_time(&self, component_id: u8, value: i64) {
        if let Some(kind) = ComponentKind::from_id(component_id) {
            self.inner.registry.lock().unwrap().slot_mut(kind).start_stop_ts_ms = value;
        }
    }

    /// Begins (or resumes) acquisition for `component_id`. The
    /// `Configuration` pseudo-component just ensures the worker is running,
    /// without touching the registry.
    pub fn start_processing(&self, component_id: u8) -> bool {
        self.inner.start_processing(component_id)
    }

    /// Ends acquisition for `component_id`. If `force`, the component is
    /// stopped immediately and its `Finished` event is raised synchronously;
    /// otherwise it keeps receiving data until the device's next report
    /// crosses its stop timestamp.
    pub fn stop_processing(&self, component_id: u8, force: bool) -> bool {
        self.inner.stop_processing(component_id, force)
    }

    /// Clears accumulated acquisition state and the streamer's buffer.
    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.inner.state.lock().unwrap().execution
    }

    pub fn get_configuration_data(
        &self,
        component_id: u8,
        configuration_ids: u16,
        out: &mut [u8],
    ) -> (bool, usize) {
        self.inner.get_configuration_data(component_id, configuration_ids, out)
    }

    pub fn set_configuration_data(&self, component_id: u8, configuration_ids: u16, data: &[u8]) -> bool {
        self.inner.set_configuration_data(component_id, configuration_ids, data)
    }
}

impl<T, S> Inner<T, S>
where
    T: Transport + 'static,
    S: PacketStreamer + 'static,
{
    fn on_data_ready(self: &Arc<Self>, data: &[u8]) {
        let result = self.streamer.lock().unwrap().add_incoming_data(data);
        if let Err(e) = result {
            self.push_error(e.code(), e.to_string());
        }
        self.wake.set();
    }

    fn push_error(&self, code: i32, message: String) {
        self.errors.lock().unwrap().push((code, message));
    }

    /// Multicasts every pending error to each non-stopped component's sink.
    /// Called only from the worker thread: errors are drained and
    /// delivered there, never from the transport's own callback thread.
    fn drain_errors(&self) {
        let pending = std::mem::take(&mut *self.errors.lock().unwrap());
        if pending.is_empty() {
            return;
        }
        let handles: Vec<_> = {
            let registry = self.registry.lock().unwrap();
            [ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose]
                .into_iter()
                .filter(|kind| registry.slot(*kind).status != ComponentStatus::Stopped)
                .filter_map(|kind| registry.sink_handle(kind))
                .collect()
        };
        for (code, message) in pending {
            for sink in &handles {
                sink.lock().unwrap().handle(ComponentEvent::Error {
                    code,
                    message: message.clone(),
                });
            }
        }
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn start_processing(self: &Arc<Self>, component_id: u8) -> bool {
        let thread_is_exiting = {
            let state = self.state.lock().unwrap();
            matches!(state.execution, ExecutionState::Finishing | ExecutionState::Stopping)
        };
        if thread_is_exiting {
            self.join_worker();
        }

        if component_id == component_id::CONFIGURATION {
            // The configuration pseudo-component has no registry slot; it
            // only needs the worker running to see the reply come back.
        } else {
            let kind = match ComponentKind::from_id(component_id) {
                Some(kind) => kind,
                None => return false,
            };
            let mut registry = self.registry.lock().unwrap();
            let slot = registry.slot_mut(kind);
            if slot.status == ComponentStatus::Running {
                return true;
            }
            slot.status = ComponentStatus::Running;
            slot.start_stop_ts_ms = self.clock.now_ms();
            slot.accumulated_real_time_ms = 0;
        }

        self.request_execution_state(DesiredState::Run);
        true
    }

    fn stop_processing(self: &Arc<Self>, component_id: u8, force: bool) -> bool {
        let stop_reading = {
            if component_id == component_id::CONFIGURATION {
                // No registry slot to update, but a configuration-only caller
                // still needs the shared worker torn down once nothing else
                // is acquiring, or it would run forever after every call.
                let registry = self.registry.lock().unwrap();
                let all_stopped = [ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose]
                    .into_iter()
                    .all(|k| registry.slot(k).status != ComponentStatus::Running);
                all_stopped && !self.rendezvous.is_busy()
            } else {
                let kind = match ComponentKind::from_id(component_id) {
                    Some(kind) => kind,
                    None => return false,
                };
                let mut registry = self.registry.lock().unwrap();
                let slot = registry.slot_mut(kind);
                if slot.status == ComponentStatus::Stopped {
                    return true;
                }
                slot.status = if force {
                    ComponentStatus::Stopped
                } else {
                    ComponentStatus::Finishing
                };
                slot.start_stop_ts_ms = self.clock.now_ms();

                let all_stopped = [ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose]
                    .into_iter()
                    .all(|k| registry.slot(k).status != ComponentStatus::Running);
                all_stopped && !self.rendezvous.is_busy()
            }
        };

        if stop_reading {
            let last_request = self.state.lock().unwrap().last_spectrum_request_ms;
            let wait_ms = (self.config.spectrum_transmission_time_ms
                - (self.clock.now_ms() - last_request))
                .max(0);
            if wait_ms > 0 {
                std::thread::sleep(Duration::from_millis(wait_ms as u64));
            }
            self.request_execution_state(if force { DesiredState::Stop } else { DesiredState::Finish });
            self.wake.set();
            if force {
                self.join_worker();
            }
        }

        if force && component_id != component_id::CONFIGURATION {
            if let Some(kind) = ComponentKind::from_id(component_id) {
                let sink = self.registry.lock().unwrap().sink_handle(kind);
                if let Some(sink) = sink {
                    sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced: true });
                }
            }
        }

        true
    }

    fn reset(&self) {
        self.state.lock().unwrap().accumulated_real_time_ms = 0;
        self.streamer.lock().unwrap().clear();
    }

    fn request_execution_state(self: &Arc<Self>, request: DesiredState) {
        {
            let mut state = self.state.lock().unwrap();
            if state.desired == request {
                return;
            }
            state.desired = request;
        }
        self.transition_execution_state();
    }

    fn transition_execution_state(self: &Arc<Self>) {
        let execution = self.state.lock().unwrap().execution;
        match execution {
            ExecutionState::Idle => {
                let desired = self.state.lock().unwrap().desired;
                match desired {
                    DesiredState::Run => {
                        if !self.start_processing_thread() {
                            {
                                let mut registry = self.registry.lock().unwrap();
                                for (_, slot) in registry.iter_mut() {
                                    slot.status = ComponentStatus::Stopped;
                                }
                            }
                            self.state.lock().unwrap().desired = DesiredState::Stop;
                            self.set_execution_state(ExecutionState::Idle);
                            self.push_error(0, "Unable to start processing thread".to_string());
                            self.wake.set();
                        }
                    }
                    DesiredState::Finish => {
                        self.state.lock().unwrap().desired = DesiredState::Stop;
                    }
                    DesiredState::Stop => {}
                }
            }
            ExecutionState::Running => {
                let desired = self.state.lock().unwrap().desired;
                match desired {
                    DesiredState::Finish | DesiredState::Stop => {
                        self.transport.lock().unwrap().stop_reading();
                        self.set_execution_state(if desired == DesiredState::Finish {
                            ExecutionState::Finishing
                        } else {
                            ExecutionState::Stopping
                        });
                    }
                    DesiredState::Run => {}
                }
            }
            ExecutionState::Finishing => {
                if self.state.lock().unwrap().desired == DesiredState::Stop {
                    self.set_execution_state(ExecutionState::Stopping);
                }
            }
            ExecutionState::Stopping => {}
        }
    }

    fn set_execution_state(self: &Arc<Self>, execution: ExecutionState) {
        self.state.lock().unwrap().execution = execution;
        debug!("acquisition execution state = {execution:?}");
        self.transition_execution_state();
    }

    fn start_processing_thread(self: &Arc<Self>) -> bool {
        self.join_worker();
        self.reset();
        self.transport.lock().unwrap().begin_reading();

        {
            let mut state = self.state.lock().unwrap();
            state.ignore_first_spectrum = true;
            state.accumulated_real_time_ms = 0;
        }

        let worker_inner = self.clone();
        let handle = std::thread::spawn(move || worker_inner.worker_loop());
        *self.worker.lock().unwrap() = Some(handle);
        self.state.lock().unwrap().execution = ExecutionState::Running;
        true
    }

    fn worker_loop(self: Arc<Self>) {
        self.send_set_compression(false);
        {
            let mut state = self.state.lock().unwrap();
            let now = self.clock.now_ms();
            state.poller.start(now, self.config.supports_radiometrics_v1);
        }

        let mut forced_stop = true;

        loop {
            let now = self.clock.now_ms();
            let should_query = self.state.lock().unwrap().poller.should_query(now);
            if should_query {
                self.send_spectrum_request();
                let mut state = self.state.lock().unwrap();
                let now = self.clock.now_ms();
                state.last_spectrum_request_ms = now;
                state.poller.mark_requested(now);
            }

            match self.streamer.lock().unwrap().read_packet() {
                Ok(Some(bytes)) => {
                    self.process_report(&bytes);
                }
                Ok(None) => {
                    let finishing = self.state.lock().unwrap().execution == ExecutionState::Finishing;
                    if finishing {
                        forced_stop = false;
                        break;
                    }
                    self.wake.reset();
                    let wait_ms = {
                        let state = self.state.lock().unwrap();
                        (state.poller.next_query_time_ms() - self.clock.now_ms()).max(1)
                    };
                    self.wake.wait_timeout(Duration::from_millis(wait_ms as u64));
                }
                Err(e) => {
                    trace!("corrupt stream: {e}");
                    self.push_error(e.code(), e.to_string());
                }
            }

            self.drain_errors();

            let keep_running = {
                let execution = self.state.lock().unwrap().execution;
                matches!(execution, ExecutionState::Running | ExecutionState::Finishing)
            };
            if !keep_running {
                break;
            }
        }

        self.flush_finished(forced_stop);
        self.set_execution_state(ExecutionState::Idle);
    }

    /// Raises `Finished` for every component not already stopped, matching
    /// `ProcessThreadProc`'s end-of-loop flush.
    fn flush_finished(&self, was_forced: bool) {
        let handles: Vec<_> = {
            let mut registry = self.registry.lock().unwrap();
            [ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose]
                .into_iter()
                .filter_map(|kind| {
                    let slot = registry.slot_mut(kind);
                    if slot.sink.is_some() && slot.status != ComponentStatus::Stopped {
                        slot.status = ComponentStatus::Stopped;
                        slot.sink.clone()
                    } else {
                        None
                    }
                })
                .collect()
        };
        for sink in handles {
            sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced });
        }
    }

    fn send_set_compression(&self, enabled: bool) {
        // REPORT_ID_SET_COMPRESSION request body: direction(u8)=0,
        // lookAheadSize(u8), windowSize(u8), enabled(u8).
        let mut message = MessageHeader {
            message_size: (MessageHeader::SIZE + 4 + 2) as u16,
            mode: 0,
            component_id: component_id::INTERFACE_BOARD,
            report_id: report_id::SET_COMPRESSION,
        };
        let mut body = header_bytes(&mut message);
        body.push(0); // direction
        body.push(HEATSHRINK_LOOKAHEAD_BITS);
        body.push(HEATSHRINK_WINDOW_BITS);
        body.push(enabled as u8);
        append_crc(&mut body);
        let prepared = self.streamer.lock().unwrap().prepare_for_send(&body);
        self.transport.lock().unwrap().set_configuration_setting(&prepared);
    }

    fn send_spectrum_request(&self) {
        let config_only = {
            let registry = self.registry.lock().unwrap();
            [ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose]
                .into_iter()
                .all(|k| registry.slot(k).status != ComponentStatus::Running)
        };
        if config_only {
            return;
        }
        let report_id = self.state.lock().unwrap().poller.select_report_id();
        let mut message = MessageHeader {
            message_size: (MessageHeader::SIZE + 2) as u16,
            mode: 0,
            component_id: component_id::INTERFACE_BOARD,
            report_id,
        };
        let mut body = header_bytes(&mut message);
        append_crc(&mut body);
        let prepared = self.streamer.lock().unwrap().prepare_for_send(&body);
        self.transport.lock().unwrap().set_configuration_setting(&prepared);
    }

    fn decompress(&self, raw: &[u8], header: &MessageHeader) -> Result<Vec<u8>> {
        let message_size = header.message_size as usize;
        if message_size < MessageHeader::SIZE + 2 || raw.len() < message_size {
            return Err(crate::error::Error::DecompressionFailed);
        }
        let input = &raw[MessageHeader::SIZE - 2..message_size - 2];
        let mut buf = vec![0u8; MAX_REPORT_SIZE];
        let written = heatshrink::expand(input, HEATSHRINK_WINDOW_BITS, HEATSHRINK_LOOKAHEAD_BITS, &mut buf)
            .map_err(|_| crate::error::Error::DecompressionFailed)?;
        if written < 2 {
            return Err(crate::error::Error::DecompressionFailed);
        }
        let mut out = Vec::with_capacity(MessageHeader::SIZE + written);
        let total_size = (written + MessageHeader::SIZE) as u16;
        out.extend_from_slice(&total_size.to_le_bytes());
        out.push(header.mode & !0x1);
        out.extend_from_slice(&buf[..written]);
        out.extend_from_slice(&[0, 0]);
        Ok(out)
    }

    fn process_report(&self, raw: &[u8]) {
        let header = match MessageHeader::from_bytes(raw) {
            Some(h) => h,
            None => return,
        };

        let owned;
        let (header, body): (MessageHeader, &[u8]) = if header.is_compressed() {
            match self.decompress(raw, &header) {
                Ok(bytes) => {
                    owned = bytes;
                    let inner_header = match MessageHeader::from_bytes(&owned) {
                        Some(h) => h,
                        None => return,
                    };
                    (inner_header, owned.as_slice())
                }
                Err(e) => {
                    self.push_error(e.code(), e.to_string());
                    return;
                }
            }
        } else {
            (header, raw)
        };

        let view = match crate::packet::PacketView::parse(body) {
            Some(v) => v,
            None => return,
        };

        match header.report_id {
            report_id::START_RESPONSE => {}
            report_id::SPECTRUM_16 => self.process_spectrum16(view.payload()),
            report_id::RADIOMETRICS_V1 => self.process_radiometrics_v1(view.payload()),
            report_id::INTERNAL_ERROR => self.process_internal_error(view.payload()),
            id if report_id::is_configuration_get(id) => {
                self.rendezvous.complete(id, view.payload());
            }
            _ => {}
        }
    }

    fn process_internal_error(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let error_id = payload[0];
        if error_id == internal_error_id::WARMING_UP {
            let mut state = self.state.lock().unwrap();
            if state.poller.kind() == ReportKind::Determining {
                state.poller.lock_in(ReportKind::RadiometricsV1);
            }
            return;
        }
        if error_id == internal_error_id::NOT_IMPLEMENTED {
            // Used by callers to probe capabilities; not a real error.
            return;
        }
        let text_bytes = &payload[1.min(payload.len())..];
        let capped = &text_bytes[..text_bytes.len().min(50)];
        let end = capped.iter().position(|&b| b == 0).unwrap_or(capped.len());
        let message = String::from_utf8_lossy(&capped[..end]).into_owned();
        if self.rendezvous.is_busy() {
            self.rendezvous.fail(code::INTERNAL_DEVICE, message.clone());
        }
        self.push_error(code::INTERNAL_DEVICE, message);
    }

    /// Shared delivery decision for the gamma/neutron/dose slots against a
    /// spectrum-shaped report's timestamp, per `ProcessSpectrum16Report`/
    /// `ProcessRadiometricsV1Report`.
    fn decide_deliveries(&self, timestamp_ms: i64, real_time_ms: i64) -> [Delivery; 3] {
        let mut registry = self.registry.lock().unwrap();
        [ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose].map(|kind| {
            let slot = registry.slot_mut(kind);
            let deliver =
                slot.status == ComponentStatus::Running && slot.start_stop_ts_ms <= timestamp_ms;
            let finish =
                slot.status == ComponentStatus::Finishing && slot.start_stop_ts_ms < timestamp_ms;
            if deliver {
                slot.accumulated_real_time_ms += real_time_ms;
                Delivery::Deliver(registry_sink(&registry, kind))
            } else if finish {
                slot.status = ComponentStatus::Stopped;
                Delivery::Finished(registry_sink(&registry, kind))
            } else {
                Delivery::None
            }
        })
    }

    fn advance_timestamp(&self, real_time_ms: i64) -> Option<i64> {
        let mut state = self.state.lock().unwrap();
        if state.ignore_first_spectrum {
            state.ignore_first_spectrum = false;
            state.start_acquisition_ts_ms = self.clock.now_ms();
            return None;
        }
        state.accumulated_real_time_ms += real_time_ms;
        let mut timestamp = state.start_acquisition_ts_ms + state.accumulated_real_time_ms;
        let now = self.clock.now_ms();
        if timestamp > now {
            state.accumulated_real_time_ms = now - state.start_acquisition_ts_ms;
            timestamp = now;
        }
        Some(timestamp)
    }

    fn process_spectrum16(&self, payload: &[u8]) {
        self.state.lock().unwrap().poller.observe_reply();
        if payload.len() < 6 + SPECTRUM_SIZE * 2 {
            return;
        }
        let mut cursor = Cursor::new(payload);
        let real_time_ms = cursor.read_u32::<LittleEndian>().unwrap_or(0) as i64;
        let neutron_counts = cursor.read_u16::<LittleEndian>().unwrap_or(0) as u32;
        let spectrum = &payload[6..6 + SPECTRUM_SIZE * 2];

        let timestamp = match self.advance_timestamp(real_time_ms) {
            Some(ts) => ts,
            None => return,
        };

        let [gamma, neutron, dose] = self.decide_deliveries(timestamp, real_time_ms);

        match gamma {
            Delivery::Deliver(Some(sink)) => {
                let mut sink = sink.lock().unwrap();
                for channel in 0..SPECTRUM_SIZE {
                    let count = u16::from_le_bytes([spectrum[channel * 2], spectrum[channel * 2 + 1]]);
                    if count > 0 {
                        sink.handle(ComponentEvent::Count {
                            timestamp_ms: timestamp,
                            channel: channel as u16,
                            count: count as u32,
                        });
                    }
                }
            }
            Delivery::Finished(Some(sink)) => {
                sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced: false });
            }
            _ => {}
        }

        match neutron {
            Delivery::Deliver(Some(sink)) => {
                if neutron_counts > 0 {
                    sink.lock().unwrap().handle(ComponentEvent::Count {
                        timestamp_ms: timestamp,
                        channel: 0,
                        count: neutron_counts,
                    });
                }
            }
            Delivery::Finished(Some(sink)) => {
                sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced: false });
            }
            _ => {}
        }

        if let Delivery::Finished(Some(sink)) = dose {
            sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced: false });
        }
    }

    fn process_radiometrics_v1(&self, payload: &[u8]) {
        self.state.lock().unwrap().poller.observe_reply();
        if payload.len() < 54 + SPECTRUM_SIZE * 2 {
            return;
        }
        let mut cursor = Cursor::new(payload);
        let _status = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let real_time_ms = cursor.read_u32::<LittleEndian>().unwrap_or(0) as i64;
        let _real_time_offset_ms = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let dose = cursor.read_f32::<LittleEndian>().unwrap_or(0.0);
        let dose_rate = cursor.read_f32::<LittleEndian>().unwrap_or(0.0);
        let _dose_reserved = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let neutron_live_time = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let neutron_counts = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let neutron_temperature = cursor.read_i16::<LittleEndian>().unwrap_or(0);
        let _neutron_bias = cursor.read_f32::<LittleEndian>().unwrap_or(0.0);
        let gamma_live_time = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let _gamma_counts = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let gamma_temperature = cursor.read_i16::<LittleEndian>().unwrap_or(0);
        let _gamma_bias = cursor.read_f32::<LittleEndian>().unwrap_or(0.0);
        let _spectrum_bits_size = cursor.read_u8().unwrap_or(0);
        let _spectrum_reserved = cursor.read_u8().unwrap_or(0);
        let spectrum_offset = cursor.position() as usize;
        let spectrum = &payload[spectrum_offset..spectrum_offset + SPECTRUM_SIZE * 2];

        let timestamp = match self.advance_timestamp(real_time_ms) {
            Some(ts) => ts,
            None => return,
        };

        let [gamma, neutron, dose_delivery] = self.decide_deliveries(timestamp, real_time_ms);

        if let Delivery::Deliver(Some(sink)) = &gamma {
            let mut registry = self.registry.lock().unwrap();
            let slot = registry.slot_mut(ComponentKind::Gamma);
            slot.set_property(PropertyKey::Temperature, gamma_temperature as f32 / 100.0);
            let live_time = slot.get_property(PropertyKey::LiveTime);
            slot.set_property(PropertyKey::LiveTime, live_time + gamma_live_time as f32 / 100.0);
            drop(registry);
            let mut sink = sink.lock().unwrap();
            for channel in 0..SPECTRUM_SIZE {
                let count = u16::from_le_bytes([spectrum[channel * 2], spectrum[channel * 2 + 1]]);
                if count > 0 {
                    sink.handle(ComponentEvent::Count {
                        timestamp_ms: timestamp,
                        channel: channel as u16,
                        count: count as u32,
                    });
                }
            }
        } else if let Delivery::Finished(Some(sink)) = gamma {
            sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced: false });
        }

        match neutron {
            Delivery::Deliver(Some(sink)) => {
                {
                    let mut registry = self.registry.lock().unwrap();
                    let slot = registry.slot_mut(ComponentKind::Neutron);
                    slot.set_property(PropertyKey::Temperature, neutron_temperature as f32 / 100.0);
                    let live_time = slot.get_property(PropertyKey::LiveTime);
                    slot.set_property(PropertyKey::LiveTime, live_time + neutron_live_time as f32 / 100.0);
                }
                if neutron_counts > 0 {
                    sink.lock().unwrap().handle(ComponentEvent::Count {
                        timestamp_ms: timestamp,
                        channel: 0,
                        count: neutron_counts,
                    });
                }
            }
            Delivery::Finished(Some(sink)) => {
                sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced: false });
            }
            _ => {}
        }

        match dose_delivery {
            Delivery::Deliver(Some(sink)) => {
                sink.lock().unwrap().handle(ComponentEvent::Dose {
                    timestamp_ms: timestamp,
                    dose_usv: dose * 1_000_000.0,
                    rate_usv_per_h: dose_rate * 1_000_000.0,
                    accumulated_usv: 0.0,
                });
            }
            Delivery::Finished(Some(sink)) => {
                sink.lock().unwrap().handle(ComponentEvent::Finished { was_forced: false });
            }
            _ => {}
        }
    }

    fn get_configuration_data(
        self: &Arc<Self>,
        component_id: u8,
        configuration_ids: u16,
        out: &mut [u8],
    ) -> (bool, usize) {
        let configuration_id = (configuration_ids & 0xFF) as u8;
        let mut request_component_id = component_id;
        if configuration_ids & CONFIG_MASK_USE_PARENT != 0
            || configuration_id == report_id::GET_STATUS
            || configuration_id == report_id::GET_DEVICE_INFO
            || configuration_id == report_id::GET_SERIAL_NO
        {
            request_component_id = component_id::INTERFACE_BOARD;
        }
        if request_component_id == component_id::DOSE {
            request_component_id = component_id::GAMMA;
        }
        if self.config.neutron_is_gamma && request_component_id == component_id::NEUTRON {
            request_component_id = component_id::GAMMA;
        }

        let mut message = MessageHeader {
            message_size: (MessageHeader::SIZE + 2) as u16,
            mode: 0,
            component_id: request_component_id,
            report_id: configuration_id,
        };
        let mut request_bytes = header_bytes(&mut message);
        append_crc(&mut request_bytes);
        let prepared = self.streamer.lock().unwrap().prepare_for_send(&request_bytes);

        if !self.rendezvous.begin(configuration_id) {
            return (false, 0);
        }
        self.start_processing(component_id::CONFIGURATION);

        if !self.transport.lock().unwrap().get_configuration_setting(&prepared) {
            self.rendezvous.wait_timeout(Duration::from_millis(0));
            self.stop_processing(component_id::CONFIGURATION, true);
            return (false, 0);
        }

        let outcome = self
            .rendezvous
            .wait_timeout(Duration::from_millis(self.config.configuration_query_timeout_ms));
        self.stop_processing(component_id::CONFIGURATION, true);

        let payload = match outcome {
            Some(RendezvousOutcome::Reply(payload)) => payload,
            _ => return (false, 0),
        };

        if payload.len() > out.len() {
            return (false, 0);
        }
        let mut len = payload.len();
        out[..len].copy_from_slice(&payload);

        if component_id != component_id::INTERFACE_BOARD && configuration_id == report_id::GET_SERIAL_NO {
            let suffix = match component_id {
                component_id::NEUTRON => Some(b'N'),
                component_id::GAMMA => Some(b'G'),
                component_id::DOSE => Some(b'D'),
                _ => None,
            };
            if let Some(suffix) = suffix {
                let string_len = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                if string_len < out.len() {
                    out[string_len] = suffix;
                    len = string_len + 1;
                }
            }
        }

        (true, len)
    }

    fn set_configuration_data(self: &Arc<Self>, component_id: u8, configuration_ids: u16, data: &[u8]) -> bool {
        let configuration_id = (configuration_ids & 0xFF) as u8;
        let mut target_component_id = component_id;
        if configuration_ids & CONFIG_MASK_USE_PARENT != 0
            || configuration_id == report_id::SET_DFU
            || configuration_id == report_id::SET_SERIAL_NO
            || configuration_id == report_id::SET_FACTORY_SETUP
        {
            target_component_id = component_id::INTERFACE_BOARD;
        }

        let mut message = MessageHeader {
            message_size: (MessageHeader::SIZE + data.len() + 2) as u16,
            mode: 0,
            component_id: target_component_id,
            report_id: configuration_id,
        };
        let mut body = header_bytes(&mut message);
        body.extend_from_slice(data);
        append_crc(&mut body);
        let prepared = self.streamer.lock().unwrap().prepare_for_send(&body);
        self.transport.lock().unwrap().set_configuration_setting(&prepared)
    }
}

enum Delivery {
    Deliver(Option<crate::registry::SharedSink>),
    Finished(Option<crate::registry::SharedSink>),
    None,
}

fn registry_sink(registry: &ComponentRegistry, kind: ComponentKind) -> Option<crate::registry::SharedSink> {
    registry.sink_handle(kind)
}

fn header_bytes(header: &mut MessageHeader) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(header.message_size as usize);
    bytes.extend_from_slice(&header.message_size.to_le_bytes());
    bytes.push(header.mode);
    bytes.push(header.component_id);
    bytes.push(header.report_id);
    bytes
}

fn append_crc(bytes: &mut Vec<u8>) {
    let crc = crate::crc::crc16(bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::streamer::LengthPrefixedPacketStreamer;
    use std::sync::Arc as StdArc;

    struct FakeTransport {
        sent: StdArc<Mutex<Vec<Vec<u8>>>>,
        data_ready: Option<Box<dyn FnMut(&[u8]) + Send>>,
        reading: StdArc<Mutex<bool>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                sent: StdArc::new(Mutex::new(Vec::new())),
                data_ready: None,
                reading: StdArc::new(Mutex::new(false)),
            }
        }
    }

    impl Transport for FakeTransport {
        fn set_data_ready_callback(&mut self, cb: Box<dyn FnMut(&[u8]) + Send>) {
            self.data_ready = Some(cb);
        }
        fn set_error_callback(&mut self, _cb: Box<dyn FnMut(i32, String) + Send>) {}
        fn begin_reading(&mut self) {
            *self.reading.lock().unwrap() = true;
        }
        fn stop_reading(&mut self) {
            *self.reading.lock().unwrap() = false;
        }
        fn set_configuration_setting(&mut self, data: &[u8]) -> bool {
            self.sent.lock().unwrap().push(data.to_vec());
            true
        }
        fn get_configuration_setting(&mut self, data: &[u8]) -> bool {
            self.sent.lock().unwrap().push(data.to_vec());
            true
        }
    }

    fn framed(component: u8, report: u8, payload: &[u8]) -> Vec<u8> {
        let mut message = MessageHeader {
            message_size: (MessageHeader::SIZE + payload.len() + 2) as u16,
            mode: 0,
            component_id: component,
            report_id: report,
        };
        let mut bytes = header_bytes(&mut message);
        bytes.extend_from_slice(payload);
        append_crc(&mut bytes);
        bytes
    }

    #[test]
    fn real_time_and_start_time_accessors_round_trip() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let core = AcquisitionCore::builder()
            .clock(clock)
            .build(FakeTransport::new(), LengthPrefixedPacketStreamer::new());

        assert_eq!(core.get_real_time(component_id::GAMMA), 0);
        assert_eq!(core.get_start_time(component_id::GAMMA), 0);

        core.inner
            .registry
            .lock()
            .unwrap()
            .slot_mut(ComponentKind::Gamma)
            .accumulated_real_time_ms = 1500;
        assert_eq!(core.get_real_time(component_id::GAMMA), 1500);
        core.reset_real_time(component_id::GAMMA);
        assert_eq!(core.get_real_time(component_id::GAMMA), 0);

        core.set_start_time(component_id::GAMMA, 42);
        assert_eq!(core.get_start_time(component_id::GAMMA), 42);

        // Unknown IDs are no-ops / zero, matching get_component_property.
        assert_eq!(core.get_real_time(0xFF), 0);
        assert_eq!(core.get_start_time(0xFF), 0);
        core.reset_real_time(0xFF);
        core.set_start_time(0xFF, 7);
    }

    #[test]
    fn start_processing_runs_worker_and_reaches_idle_on_stop() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let core = AcquisitionCore::builder()
            .clock(clock)
            .build(FakeTransport::new(), LengthPrefixedPacketStreamer::new());

        assert!(core.start_processing(component_id::GAMMA));
        // Give the worker a moment to reach Running.
        for _ in 0..50 {
            if core.execution_state() == ExecutionState::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(core.execution_state(), ExecutionState::Running);

        assert!(core.stop_processing(component_id::GAMMA, true));
        assert_eq!(core.execution_state(), ExecutionState::Idle);
    }

    #[test]
    fn spectrum16_delivers_nonzero_channels_after_first_reply() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let core = AcquisitionCore::builder()
            .clock(clock)
            .build(FakeTransport::new(), LengthPrefixedPacketStreamer::new());

        let received = StdArc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        core.add_component(
            component_id::GAMMA,
            Box::new(move |event: ComponentEvent| received_clone.lock().unwrap().push(event)),
        );

        core.inner.registry.lock().unwrap().slot_mut(ComponentKind::Gamma).status =
            ComponentStatus::Running;
        core.inner.state.lock().unwrap().ignore_first_spectrum = false;
        core.inner.state.lock().unwrap().start_acquisition_ts_ms = 0;

        let mut payload = vec![0u8; 6 + SPECTRUM_SIZE * 2];
        payload[6] = 5; // channel 0 count = 5
        let packet = framed(component_id::GAMMA, report_id::SPECTRUM_16, &payload);
        core.inner.process_report(&packet);

        let events = received.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ComponentEvent::Count { channel: 0, count: 5, .. })));
    }
}

//! Typed per-component event sum type.
//!
//! Replaces the original's four raw function-pointer-plus-void-arg callback
//! pairs (`CountEventCallbackFunc`, `DoseEventCallbackFunc`,
//! `FinishedProcessingCallbackFunc`, `ErrorCallbackFunc` in
//! `original_source/kromek_driver/include/IDataProcessor.h`) with a single
//! sum type delivered through one sink per component. This preserves
//! "callback set on a slot" semantics without unsafe type erasure through
//! `void*`.

/// An event delivered to a registered component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentEvent {
    /// A single channel's count, from a gamma spectrum or the neutron
    /// pseudo-channel.
    Count {
        timestamp_ms: i64,
        channel: u16,
        count: u32,
    },
    /// Dose/dose-rate reading (RadiometricsV1 dose component only).
    Dose {
        timestamp_ms: i64,
        dose_usv: f32,
        rate_usv_per_h: f32,
        accumulated_usv: f32,
    },
    /// Acquisition for this component has ended.
    Finished { was_forced: bool },
    /// An error affecting this component.
    Error { code: i32, message: String },
}

/// Per-component event sink. Implemented for any `FnMut(ComponentEvent) +
/// Send` closure via the blanket impl below, so callers can register a
/// plain closure instead of hand-writing a struct.
pub trait ComponentSink: Send {
    fn handle(&mut self, event: ComponentEvent);
}

impl<F> ComponentSink for F
where
    F: FnMut(ComponentEvent) + Send,
{
    fn handle(&mut self, event: ComponentEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_implement_component_sink() {
        use std::sync::{Arc, Mutex};

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let mut sink: Box<dyn ComponentSink> =
            Box::new(move |e: ComponentEvent| received_clone.lock().unwrap().push(e));
        sink.handle(ComponentEvent::Finished { was_forced: true });
        drop(sink);
        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[ComponentEvent::Finished { was_forced: true }]
        );
    }
}

//! Component Registry — the three fixed addressable slots (gamma, neutron,
//! dose) plus their callbacks and per-component runtime state.
//!
//! Grounded on `ComponentDesc` and the `AddComponent`/`RemoveComponent`/
//! `GetComponentProperty` trio in
//! `original_source/kromek_driver/src/D3DataProcessor.cpp`. The original
//! serializes these under the same critical section as execution state; this
//! crate gives the registry its own mutex, kept disjoint from the
//! acquisition mutex so a callback is never invoked while either is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::events::ComponentSink;
use crate::packet::component_id;

/// A registered sink, wrapped so a caller can clone the handle out from under
/// the registry lock and invoke it afterwards — the registry mutex must never
/// be held across a callback.
pub type SharedSink = Arc<Mutex<Box<dyn ComponentSink>>>;

/// Hardware-reported per-component properties (recovered from
/// `ComponentProperty` in `original_source/kromek_driver/include/IDataProcessor.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Temperature,
    LiveTime,
}

/// Orthogonal-to-execution per-component status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    Stopped,
    Running,
    Finishing,
}

impl Default for ComponentStatus {
    fn default() -> Self {
        ComponentStatus::Stopped
    }
}

/// Logical components a composite detector may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Gamma,
    Neutron,
    Dose,
}

impl ComponentKind {
    pub fn id(self) -> u8 {
        match self {
            ComponentKind::Gamma => component_id::GAMMA,
            ComponentKind::Neutron => component_id::NEUTRON,
            ComponentKind::Dose => component_id::DOSE,
        }
    }

    pub fn from_id(id: u8) -> Option<ComponentKind> {
        match id {
            component_id::GAMMA => Some(ComponentKind::Gamma),
            component_id::NEUTRON => Some(ComponentKind::Neutron),
            component_id::DOSE => Some(ComponentKind::Dose),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            ComponentKind::Gamma => 0,
            ComponentKind::Neutron => 1,
            ComponentKind::Dose => 2,
        }
    }
}

/// Per-slot runtime state.
pub struct ComponentSlot {
    pub sink: Option<SharedSink>,
    pub status: ComponentStatus,
    pub start_stop_ts_ms: i64,
    pub accumulated_real_time_ms: i64,
    properties: HashMap<PropertyKey, f32>,
}

impl Default for ComponentSlot {
    fn default() -> Self {
        Self {
            sink: None,
            status: ComponentStatus::Stopped,
            start_stop_ts_ms: 0,
            accumulated_real_time_ms: 0,
            properties: HashMap::new(),
        }
    }
}

impl ComponentSlot {
    fn clear(&mut self) {
        *self = ComponentSlot::default();
    }

    pub fn set_property(&mut self, key: PropertyKey, value: f32) {
        self.properties.insert(key, value);
    }

    pub fn get_property(&self, key: PropertyKey) -> f32 {
        self.properties.get(&key).copied().unwrap_or(0.0)
    }

    /// Convenience for tests and simple callers: locks and invokes the sink
    /// in place. Worker-thread code should instead clone `sink` out while
    /// the registry is locked and call it afterwards — see
    /// [`ComponentRegistry::sink_handle`].
    pub fn emit(&mut self, event: crate::events::ComponentEvent) {
        if let Some(sink) = self.sink.as_ref() {
            sink.lock().unwrap().handle(event);
        }
    }
}

/// Three fixed slots: gamma, neutron, dose. Unknown IDs are ignored by
/// `add`/`remove`, matching the original's `switch` statements which simply
/// fall through on an unrecognised component ID.
pub struct ComponentRegistry {
    slots: [ComponentSlot; 3],
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            slots: [
                ComponentSlot::default(),
                ComponentSlot::default(),
                ComponentSlot::default(),
            ],
        }
    }

    pub fn slot(&self, kind: ComponentKind) -> &ComponentSlot {
        &self.slots[kind.index()]
    }

    pub fn slot_mut(&mut self, kind: ComponentKind) -> &mut ComponentSlot {
        &mut self.slots[kind.index()]
    }

    /// Registers a sink for `id`. Unknown IDs are silently ignored (spec
    /// §4.5).
    pub fn add_component(&mut self, id: u8, sink: Box<dyn ComponentSink>) {
        if let Some(kind) = ComponentKind::from_id(id) {
            self.slots[kind.index()].sink = Some(Arc::new(Mutex::new(sink)));
        }
    }

    /// Clones out the sink handle for `kind`, if one is registered, so it can
    /// be invoked after releasing the registry lock.
    pub fn sink_handle(&self, kind: ComponentKind) -> Option<SharedSink> {
        self.slots[kind.index()].sink.clone()
    }

    /// Resets the slot to defaults. Unknown IDs are silently ignored.
    pub fn remove_component(&mut self, id: u8) {
        if let Some(kind) = ComponentKind::from_id(id) {
            self.slots[kind.index()].clear();
        }
    }

    pub fn get_property(&self, id: u8, key: PropertyKey) -> f32 {
        match ComponentKind::from_id(id) {
            Some(kind) => self.slots[kind.index()].get_property(key),
            None => 0.0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentKind, &ComponentSlot)> {
        [ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose]
            .into_iter()
            .map(move |kind| (kind, &self.slots[kind.index()]))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ComponentKind, &mut ComponentSlot)> {
        self.slots
            .iter_mut()
            .zip([ComponentKind::Gamma, ComponentKind::Neutron, ComponentKind::Dose])
            .map(|(slot, kind)| (kind, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_component_ids_are_ignored() {
        let mut registry = ComponentRegistry::new();
        registry.add_component(0xFF, Box::new(|_| {}));
        registry.remove_component(0xFF); // must not panic
        assert_eq!(registry.get_property(0xFF, PropertyKey::Temperature), 0.0);
    }

    #[test]
    fn missing_property_defaults_to_zero() {
        let registry = ComponentRegistry::new();
        assert_eq!(
            registry.get_property(component_id::GAMMA, PropertyKey::LiveTime),
            0.0
        );
    }

    #[test]
    fn remove_resets_slot_to_defaults() {
        let mut registry = ComponentRegistry::new();
        registry.add_component(component_id::GAMMA, Box::new(|_| {}));
        registry.slot_mut(ComponentKind::Gamma).status = ComponentStatus::Running;
        registry.remove_component(component_id::GAMMA);
        assert_eq!(registry.slot(ComponentKind::Gamma).status, ComponentStatus::Stopped);
        assert!(registry.slot(ComponentKind::Gamma).sink.is_none());
    }
}

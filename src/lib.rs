//! User-space driver core for Kromek-family composite USB/Bluetooth
//! radiation spectrometers.
//!
//! This crate owns the part of the driver that is independent of how bytes
//! actually reach the device: packet reassembly from a raw byte stream
//! (`streamer`), optional Heatshrink-style decompression (`heatshrink`),
//! routing by device/component (`acquisition`), the three fixed gamma/
//! neutron/dose component slots (`registry`), the periodic spectrum poller
//! (`poller`) and the blocking configuration request/response matcher
//! (`rendezvous`). Opening the actual USB-HID endpoint, serial port, or
//! Bluetooth virtual serial connection is the caller's job: supply anything
//! that implements [`transport::Transport`], or use one of the optional
//! reference transports behind the `hid-transport`/`serial-transport`
//! features.
//!
//! ```no_run
//! use kromek_driver::{AcquisitionCore, packet::component_id};
//! # use kromek_driver::transport::Transport;
//! # struct MyTransport;
//! # impl Transport for MyTransport {
//! #     fn set_data_ready_callback(&mut self, _cb: Box<dyn FnMut(&[u8]) + Send>) {}
//! #     fn set_error_callback(&mut self, _cb: Box<dyn FnMut(i32, String) + Send>) {}
//! #     fn begin_reading(&mut self) {}
//! #     fn stop_reading(&mut self) {}
//! #     fn set_configuration_setting(&mut self, _data: &[u8]) -> bool { true }
//! #     fn get_configuration_setting(&mut self, _data: &[u8]) -> bool { true }
//! # }
//! let core = AcquisitionCore::builder()
//!     .build(MyTransport, kromek_driver::streamer::LengthPrefixedPacketStreamer::new());
//! core.add_component(component_id::GAMMA, Box::new(|event| {
//!     log::trace!("gamma event: {event:?}");
//! }));
//! core.start_processing(component_id::GAMMA);
//! ```

pub mod acquisition;
pub mod clock;
pub mod crc;
pub mod error;
pub mod events;
pub mod heatshrink;
pub mod packet;
pub mod poller;
pub mod registry;
pub mod rendezvous;
pub mod streamer;
pub mod transport;

pub use acquisition::{AcquisitionCore, CoreConfig, CoreConfigBuilder, ExecutionState};
pub use error::{Error, Result};
pub use events::{ComponentEvent, ComponentSink};

//! Packet reassembly from a raw byte stream.
//!
//! Grounded on `IPacketStreamer` and its two implementations in
//! `original_source/kromek_driver/include/PacketStreamers.h` /
//! `src/PacketStreamers.cpp`: a length-prefixed, CRC-guarded variant for
//! plain serial transports, and a SLIP-style byte-stuffed/frame-delimited
//! variant for transports that need a resync marker (e.g. Bluetooth virtual
//! serial). Both share the same `AddIncomingData`/`ReadPacket`/`Clear`
//! contract, captured here as the [`PacketStreamer`] trait.

mod framed;
mod length_prefixed;

pub use framed::FramedPacketStreamer;
pub use length_prefixed::LengthPrefixedPacketStreamer;

use crate::error::Result;

/// Converts a raw byte stream into discrete, CRC-verified packets.
///
/// Implementations buffer incoming bytes internally; `read_packet` drains
/// one fully-reassembled packet at a time. Corrupt data is reported as an
/// error rather than panicking, so a caller can log it and keep running —
/// the original's "enable data recovery" behavior is folded into each
/// implementation's handling of the next [`add_incoming_data`](
/// PacketStreamer::add_incoming_data) call after an error.
pub trait PacketStreamer: Send {
    /// Appends `data` to the internal buffer. Returns an error if the
    /// buffer would overflow ("buffer full" is reported, not
    /// silently dropped).
    fn add_incoming_data(&mut self, data: &[u8]) -> Result<()>;

    /// Pops one fully-reassembled packet (header + payload + trailing CRC),
    /// if one is ready. Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    /// Returns [`Error::CorruptStream`] when a length or CRC check fails;
    /// after such an error the streamer discards its buffered data and
    /// begins a resynchronization/recovery window.
    fn read_packet(&mut self) -> Result<Option<Vec<u8>>>;

    /// Discards all buffered, not-yet-complete data.
    fn clear(&mut self);

    /// Prepares `payload` for transmission (e.g. byte-stuffing for framed
    /// transports). Length-prefixed transports return the payload
    /// unchanged.
    fn prepare_for_send(&self, payload: &[u8]) -> Vec<u8>;
}

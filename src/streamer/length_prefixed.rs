//! Length-prefixed, CRC-guarded packet streamer for plain serial transports.
//!
//! Ports `SerialPacketStreamer` from `original_source/kromek_driver/src/
//! PacketStreamers.cpp`: the first two bytes of the buffer are always the
//! little-endian total packet size; once that many bytes have arrived, the
//! trailing two bytes are checked as a CRC (a CRC of exactly `0` is treated
//! as "don't check", matching the original) and the packet is sliced off
//! the front of the buffer.

use std::time::Instant;

use crate::crc;
use crate::error::{Error, Result};
use crate::packet::{DEFAULT_BUFFER_CAPACITY, MAX_REPORT_SIZE};

use super::PacketStreamer;

/// The original reopens data recovery after corruption and waits for a
/// 100ms idle gap before trusting the stream again.
const RECOVERY_IDLE_MS: i64 = 100;

pub struct LengthPrefixedPacketStreamer {
    buffer: Vec<u8>,
    capacity: usize,
    recovering: bool,
    last_data_time_ms: i64,
    /// Monotonic epoch backing [`PacketStreamer::add_incoming_data`]'s real-time
    /// recovery-gap check. [`Self::add_incoming_data_at`] bypasses this for tests.
    epoch: Instant,
}

impl LengthPrefixedPacketStreamer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            recovering: false,
            last_data_time_ms: 0,
            epoch: Instant::now(),
        }
    }

    /// Feeds the current time alongside the data, needed to evaluate the
    /// idle-gap recovery window. [`PacketStreamer::add_incoming_data`]
    /// delegates here using a real monotonic clock; tests that need
    /// deterministic timing should call this directly instead.
    pub fn add_incoming_data_at(&mut self, data: &[u8], now_ms: i64) -> Result<()> {
        if self.recovering {
            if now_ms > self.last_data_time_ms + RECOVERY_IDLE_MS {
                self.recovering = false;
            }
        }
        self.last_data_time_ms = now_ms;
        if self.recovering {
            return Ok(());
        }
        if self.buffer.len() + data.len() > self.capacity {
            return Err(Error::Overflow);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }
}

impl Default for LengthPrefixedPacketStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketStreamer for LengthPrefixedPacketStreamer {
    fn add_incoming_data(&mut self, data: &[u8]) -> Result<()> {
        let now_ms = self.epoch.elapsed().as_millis() as i64;
        self.add_incoming_data_at(data, now_ms)
    }

    fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }
        let packet_size = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if packet_size == 0 || packet_size > MAX_REPORT_SIZE {
            self.recovering = true;
            self.buffer.clear();
            return Err(Error::CorruptStream("invalid packet size"));
        }
        if self.buffer.len() < packet_size {
            return Ok(None);
        }
        let crc_bytes = &self.buffer[packet_size - 2..packet_size];
        let packet_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed = crc::crc16(&self.buffer[..packet_size - 2]);
        if packet_crc != 0 && packet_crc != computed {
            self.recovering = true;
            self.buffer.clear();
            return Err(Error::CorruptStream("crc mismatch"));
        }
        let packet = self.buffer[..packet_size].to_vec();
        self.buffer.drain(..packet_size);
        Ok(Some(packet))
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn prepare_for_send(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

//! SLIP-style byte-stuffed, frame-delimited packet streamer.
//!
//! Ports `FramedPacketStreamer` from `original_source/kromek_driver/src/
//! PacketStreamers.cpp`. Incoming bytes are unescaped on the fly; a
//! `FRAME_BYTE` (0xC0) ends the current frame. On frame end, the first two
//! (already-unescaped) bytes are checked against the accumulated length and
//! the trailing two against a CRC; anything that doesn't match is silently
//! discarded rather than raised as a stream-wide error, since a single
//! malformed frame in a byte-stuffed stream does not desynchronize
//! subsequent frames the way a length-prefixed stream would. The completed
//! packet pool (`_packetPool`/`_packetsReady`) is modeled here as a plain
//! `VecDeque`, since Rust's allocator makes the original's fixed buffer pool
//! unnecessary.

use std::collections::VecDeque;

use crate::crc;
use crate::error::Result;
use crate::packet::MAX_REPORT_SIZE;

use super::PacketStreamer;

const FRAME_BYTE: u8 = 0xC0;
const ESC_BYTE: u8 = 0xDB;
const ESC_FRAME_BYTE: u8 = 0xDC;
const ESC_ESC_BYTE: u8 = 0xDD;

pub struct FramedPacketStreamer {
    buffer: Vec<u8>,
    first_byte_escaped: bool,
    ready: VecDeque<Vec<u8>>,
}

impl FramedPacketStreamer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_REPORT_SIZE),
            first_byte_escaped: false,
            ready: VecDeque::new(),
        }
    }

    fn complete_frame(&mut self) {
        if self.buffer.len() >= 2 {
            let size = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if size == self.buffer.len() && size >= 2 {
                let crc_bytes = &self.buffer[size - 2..size];
                let packet_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
                let computed = crc::crc16(&self.buffer[..size - 2]);
                if packet_crc == 0 || packet_crc == computed {
                    self.ready.push_back(self.buffer.clone());
                }
            }
        }
        self.buffer.clear();
    }
}

impl Default for FramedPacketStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketStreamer for FramedPacketStreamer {
    fn add_incoming_data(&mut self, data: &[u8]) -> Result<()> {
        let mut read_index = 0;

        if self.first_byte_escaped {
            if data.is_empty() {
                return Ok(());
            }
            let unescaped = if data[read_index] == ESC_ESC_BYTE {
                ESC_BYTE
            } else {
                FRAME_BYTE
            };
            self.buffer.push(unescaped);
            self.first_byte_escaped = false;
            read_index += 1;
        }

        while read_index < data.len() {
            let b = data[read_index];
            if b == FRAME_BYTE {
                self.complete_frame();
                read_index += 1;
            } else if self.buffer.len() >= MAX_REPORT_SIZE {
                self.buffer.clear();
                read_index += 1;
            } else if b == ESC_BYTE {
                if read_index + 1 >= data.len() {
                    self.first_byte_escaped = true;
                    break;
                }
                let unescaped = if data[read_index + 1] == ESC_ESC_BYTE {
                    ESC_BYTE
                } else {
                    FRAME_BYTE
                };
                self.buffer.push(unescaped);
                read_index += 2;
            } else {
                self.buffer.push(b);
                read_index += 1;
            }
        }
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.ready.pop_front())
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.first_byte_escaped = false;
        self.ready.clear();
    }

    fn prepare_for_send(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 2);
        for &b in payload {
            match b {
                FRAME_BYTE => {
                    out.push(ESC_BYTE);
                    out.push(ESC_FRAME_BYTE);
                }
                ESC_BYTE => {
                    out.push(ESC_BYTE);
                    out.push(ESC_ESC_BYTE);
                }
                other => out.push(other),
            }
        }
        out.push(FRAME_BYTE);
        out
    }
}

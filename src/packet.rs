//! Wire layout, report IDs and component IDs.
//!
//! The 4-byte message header mirrors `MessageHeader`/`ContentHeader` in
//! `original_source/kromek_driver/include/D3Structs.h`. We model it as a
//! `#[repr(C, packed)]`, `bytemuck::Pod` struct, the same way fixed-layout
//! USB/HID report headers are modeled elsewhere in this codebase, rather than
//! hand-rolling byte offsets everywhere.

use bytemuck::{Pod, Zeroable};

/// Maximum packet size accepted by the streamers.
pub const MAX_REPORT_SIZE: usize = 8500;

/// Default streamer buffer capacity: "approx a second's worth of data" per
/// the original's comment (`MAX_REPORT_SIZE * 20`).
pub const DEFAULT_BUFFER_CAPACITY: usize = MAX_REPORT_SIZE * 20;

/// Fixed addressable component/pseudo-component IDs.
pub mod component_id {
    pub const GAMMA: u8 = 0x01;
    pub const NEUTRON: u8 = 0x02;
    pub const DOSE: u8 = 0x03;
    pub const INTERFACE_BOARD: u8 = 0x07;
    pub const CONFIGURATION: u8 = 0x0A;
}

/// Report IDs, recovered in full from `D3Structs.h`. The acquisition
/// dispatcher only reacts to a handful of these directly; the rest are
/// needed to correctly route `GetConfigurationData`/`SetConfigurationData`.
pub mod report_id {
    pub const SET_GAIN: u8 = 0x02;
    pub const SET_BIAS: u8 = 0x07;
    pub const SET_SERIAL_NO: u8 = 0x08;
    pub const SET_LLD: u8 = 0x09;
    pub const SET_ENABLE_LLD: u8 = 0x0C;
    pub const SET_FACTORY_SETUP: u8 = 0x11;
    pub const SET_SOFTWARE_LLD: u8 = 0x12;
    pub const SET_OTG: u8 = 0x46;
    pub const SET_DFU: u8 = 0x47;
    pub const SET_COMPRESSION: u8 = 0x4F;

    pub const GET_GAIN: u8 = 0x82;
    pub const GET_BIAS: u8 = 0x86;
    pub const GET_BIAS2: u8 = 0x87;
    pub const GET_SERIAL_NO: u8 = 0x88;
    pub const GET_LLD: u8 = 0x89;
    pub const GET_ENABLE_LLD: u8 = 0x8C;
    pub const GET_VERSION: u8 = 0x8A;
    pub const GET_ACTUAL_BIAS: u8 = 0x8B;
    pub const GET_SOFTWARE_LLD: u8 = 0x92;
    pub const GET_OTG: u8 = 0xC6;
    pub const GET_STATUS: u8 = 0xC5;
    pub const GET_DEVICE_INFO: u8 = 0xC8;

    pub const INTERNAL_ERROR: u8 = 0xC0;
    pub const SPECTRUM_16: u8 = 0xC1;
    pub const RADIOMETRICS_V1: u8 = 0xC2;
    pub const START_RESPONSE: u8 = 0xC4;

    /// Configuration-get report IDs the acquisition dispatcher hands to the
    /// rendezvous.
    pub const CONFIGURATION_GET_IDS: &[u8] = &[
        GET_GAIN,
        GET_BIAS,
        GET_BIAS2,
        GET_SERIAL_NO,
        GET_LLD,
        GET_VERSION,
        GET_ACTUAL_BIAS,
        GET_ENABLE_LLD,
        GET_SOFTWARE_LLD,
        GET_OTG,
        GET_STATUS,
        GET_DEVICE_INFO,
    ];

    pub fn is_configuration_get(report_id: u8) -> bool {
        CONFIGURATION_GET_IDS.contains(&report_id)
    }
}

pub mod internal_error_id {
    pub const NOT_IMPLEMENTED: u8 = 0x3;
    pub const WARMING_UP: u8 = 0xB;
}

/// Mask: force the request to the interface-board pseudo-component.
pub const CONFIG_MASK_USE_PARENT: u16 = 0x0100;

/// Number of channels in a full spectrum payload.
pub const SPECTRUM_SIZE: usize = 4096;

/// The 4-byte header common to every packet.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MessageHeader {
    pub message_size: u16,
    pub mode: u8,
    pub component_id: u8,
    pub report_id: u8,
}

impl MessageHeader {
    pub const SIZE: usize = std::mem::size_of::<MessageHeader>();

    pub fn from_bytes(data: &[u8]) -> Option<MessageHeader> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(*bytemuck::from_bytes(&data[..Self::SIZE]))
    }

    pub fn is_compressed(&self) -> bool {
        self.mode & 0x1 != 0
    }
}

/// A fully reassembled, CRC-verified packet, parsed just far enough to route
/// it: header fields plus a view of the payload between the header and the
/// trailing CRC.
pub struct PacketView<'a> {
    pub header: MessageHeader,
    bytes: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// `bytes` must be a full packet (header + payload + trailing CRC), as
    /// handed back by a [`crate::streamer::PacketStreamer::read_packet`].
    pub fn parse(bytes: &'a [u8]) -> Option<PacketView<'a>> {
        let header = MessageHeader::from_bytes(bytes)?;
        if bytes.len() < MessageHeader::SIZE + 2 {
            return None;
        }
        Some(PacketView { header, bytes })
    }

    /// Payload between the header and the trailing 2-byte CRC.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[MessageHeader::SIZE..self.bytes.len() - 2]
    }

    pub fn raw(&self) -> &'a [u8] {
        self.bytes
    }
}

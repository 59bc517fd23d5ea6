//! Crate-wide error type.
//!
//! Categories mirror the driver's error surface; numeric codes mirror the `ErrorCodes` enum
//! recovered from the original `IDevice.h` (kept as associated constants
//! under [`code`] so callers that still expect a bare integer, the way the
//! original `DeviceErrorCallbackFunc` did, can get one out of any variant).

use thiserror::Error;

/// Numeric error codes, preserved from the original driver's `ErrorCodes` enum.
pub mod code {
    pub const DEVICE_OPEN_FAILED: i32 = 100;
    pub const READ_FAILED: i32 = 101;
    pub const INTERNAL_DEVICE: i32 = 102;
    pub const WRITE_FAILED: i32 = 103;
    pub const DECOMPRESSION_FAILED: i32 = 104;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error {code}: {message}")]
    Transport { code: i32, message: String },

    #[error("decompression of packet failed")]
    DecompressionFailed,

    #[error("device reported an internal error: {0}")]
    InternalDeviceError(String),

    #[error("stream corrupted: {0}")]
    CorruptStream(&'static str),

    #[error("configuration request timed out")]
    ConfigurationTimeout,

    #[error("incoming data buffer overflow")]
    Overflow,

    #[error("a configuration request is already in flight")]
    RendezvousBusy,
}

impl Error {
    /// The numeric code a raw error callback would have received.
    pub fn code(&self) -> i32 {
        match self {
            Error::Transport { code, .. } => *code,
            Error::DecompressionFailed => code::DECOMPRESSION_FAILED,
            Error::InternalDeviceError(_) => code::INTERNAL_DEVICE,
            Error::CorruptStream(_) => code::READ_FAILED,
            Error::ConfigurationTimeout => code::READ_FAILED,
            Error::Overflow => code::WRITE_FAILED,
            Error::RendezvousBusy => code::WRITE_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

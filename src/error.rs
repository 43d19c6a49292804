//! Error types for the P938x controller.

use thiserror::Error;

/// Top-level error type.
///
/// Transport errors on the status/telemetry path are normally absorbed by the
/// controller and turned into a removal transition rather than surfaced; they
/// only propagate out of operations (firmware upload, identity queries) where
/// the caller asked for the bus transaction directly.
#[derive(Error, Debug)]
pub enum Error {
    /// Register bus read/write failure. The chip powers its register
    /// interface from the coupled field, so this usually means the
    /// transmitter went away mid-transaction.
    #[error("register transport: {0}")]
    Transport(String),

    /// Firmware upload protocol failure. Fatal to the upload only.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Request rejected because the device is in the wrong state.
    /// No side effects were performed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Missing or invalid platform wiring at construction time.
    #[error("configuration: {0}")]
    Config(String),

    /// The controller task has shut down; the handle is dangling.
    #[error("controller is not running")]
    Closed,
}

/// Failures of the OTP programming handshake.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Boot loader reported a programming error (status 4).
    #[error("OTP programming error at 0x{addr:04x}")]
    ProgramError { addr: u16 },

    /// Boot loader rejected the packet checksum (status 8).
    #[error("checksum mismatch at 0x{addr:04x}")]
    ChecksumMismatch { addr: u16 },

    /// Attempted to clear an OTP bit already programmed to 1 (status 16).
    #[error("illegal bit clear at 0x{addr:04x}")]
    IllegalBitClear { addr: u16 },

    /// Status byte held an undefined value.
    #[error("unexpected status 0x{status:02x} at 0x{addr:04x}")]
    UnexpectedStatus { addr: u16, status: u8 },

    /// Status byte stayed busy past the retry cap.
    #[error("status poll timed out at 0x{addr:04x}")]
    PollTimeout { addr: u16 },
}

/// Synchronous request rejections.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateError {
    /// Tx mode cannot be enabled while coupled to a transmitter.
    #[error("tx mode request rejected, transmitter is attached")]
    TransmitterAttached,

    /// A firmware upload is already in flight.
    #[error("firmware programming already in progress")]
    UploadPending,

    /// The operation needs the chip powered (boost or coupled field).
    #[error("chip is not powered")]
    ChipOff,

    /// The operation needs an active transmitter coupling.
    #[error("no transmitter coupled")]
    NotCoupled,

    /// Attempted to write a read-only property.
    #[error("property is read-only")]
    ReadOnlyProperty,
}

pub type Result<T> = std::result::Result<T, Error>;

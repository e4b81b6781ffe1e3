//! Error taxonomy for the DFU transfer.
//!
//! Only [`DfuError::ChecksumMismatch`] is ever recovered internally (bounded
//! retries inside the object transfer engine); every other variant propagates
//! to the caller as a terminal result.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ExtError, ObjectKind, OpCode, ResponseCode};

/// Why the device NAK'd a request.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum RejectReason {
    #[error(transparent)]
    Code(ResponseCode),
    #[error(transparent)]
    Extended(ExtError),
}

#[derive(Debug, Error)]
pub enum DfuError {
    /// Connection drop or write failure. Fatal, no auto-reconnect.
    #[error("transport failure")]
    Transport(#[source] anyhow::Error),

    /// No response arrived within the configured window. Treated like a
    /// transport failure, but reported distinctly from a checksum failure.
    #[error("no {opcode:?} response within {timeout:?}")]
    Timeout { opcode: OpCode, timeout: Duration },

    /// The device NAK'd a control request.
    #[error("device rejected {opcode:?}: {reason}")]
    DeviceRejected { opcode: OpCode, reason: RejectReason },

    /// The device cannot accept the object (capacity or create failure).
    #[error("object {object} ({kind:?}, {size} bytes) rejected: {detail}")]
    ObjectRejected {
        object: usize,
        kind: ObjectKind,
        size: usize,
        detail: String,
    },

    /// Device-reported progress disagrees with the bytes we sent.
    /// Recoverable by resuming from the device-reported offset.
    #[error(
        "checksum mismatch on object {object}: expected offset {expected_offset} crc {expected_crc:#010x}, \
         device reported offset {actual_offset} crc {actual_crc:#010x}"
    )]
    ChecksumMismatch {
        object: usize,
        expected_offset: u32,
        actual_offset: u32,
        expected_crc: u32,
        actual_crc: u32,
    },

    /// The checksum retry budget for one object ran out.
    #[error("object {object} failed checksum verification {attempts} times")]
    ChecksumExhausted { object: usize, attempts: u32 },

    /// A client-side state invariant was broken. Always a defect, never retried.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The DFU package could not be read or is malformed.
    #[error("invalid DFU package: {0}")]
    ArchiveInvalid(String),

    /// A transfer is already running on this device.
    #[error("a transfer is already in progress on this device")]
    SessionBusy,

    /// Cancellation was requested and honored at an object boundary.
    #[error("transfer cancelled")]
    Cancelled,
}

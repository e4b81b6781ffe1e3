//! DFU control-point wire format.
//!
//! Frames as defined in
//! nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h
//! (reduced opcode set). All multi-byte fields are little-endian.

use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::correlator::ResponseCorrelator;
use crate::error::DfuError;
use crate::transport::DfuTransport;

/// DFU object variants.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ObjectKind {
    /// Init metadata (signature, size, hash of the firmware).
    Command = 0x01,
    /// A window of firmware bytes.
    Data = 0x02,
}

/// DFU command opcodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Create = 0x01,
    SetPrn = 0x02,
    CalculateChecksum = 0x03,
    Execute = 0x04,
    Select = 0x06,
    Response = 0x60,
}

/// DFU response result codes.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    #[error("invalid opcode")]
    Invalid = 0x00,
    #[error("success (not an error)")]
    Success = 0x01,
    #[error("opcode not supported")]
    OpCodeNotSupported = 0x02,
    #[error("invalid parameter")]
    InvalidParameter = 0x03,
    #[error("not enough memory for the data object")]
    InsufficientResources = 0x04,
    #[error("invalid data object")]
    InvalidObject = 0x05,
    #[error("invalid object type")]
    UnsupportedType = 0x07,
    #[error("operation not permitted")]
    OperationNotPermitted = 0x08,
    #[error("operation failed")]
    OperationFailed = 0x0A,
    #[error("extended error")]
    ExtError = 0x0B,
}

/// DFU extended error codes, carried in the first payload byte of an
/// `ExtError` response.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExtError {
    #[error("no extended error (bad implementation)")]
    NoError = 0x00,
    #[error("invalid error code")]
    InvalidErrorCode = 0x01,
    #[error("wrong command format")]
    WrongCommandFormat = 0x02,
    #[error("unknown command")]
    UnknownCommand = 0x03,
    #[error("invalid init command")]
    InitCommandInvalid = 0x04,
    #[error("firmware version is too low")]
    FwVersionFailure = 0x05,
    #[error("hardware version mismatch")]
    HwVersionFailure = 0x06,
    #[error("required softdevice version mismatch")]
    SdVersionFailure = 0x07,
    #[error("missing signature")]
    SignatureMissing = 0x08,
    #[error("wrong hash type")]
    WrongHashType = 0x09,
    #[error("hash calculation failed")]
    HashFailed = 0x0A,
    #[error("wrong signature type")]
    WrongSignatureType = 0x0B,
    #[error("hash verification failed")]
    VerificationFailed = 0x0C,
    #[error("insufficient space")]
    InsufficientSpace = 0x0D,
}

/// A control-point request frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Request {
    Create { kind: ObjectKind, size: u32 },
    SetPrn(u16),
    CalculateChecksum,
    Execute,
    Select(ObjectKind),
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Create { .. } => OpCode::Create,
            Request::SetPrn(_) => OpCode::SetPrn,
            Request::CalculateChecksum => OpCode::CalculateChecksum,
            Request::Execute => OpCode::Execute,
            Request::Select(_) => OpCode::Select,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.opcode().into()];
        match *self {
            Request::Create { kind, size } => {
                frame.push(kind.into());
                frame.extend_from_slice(&size.to_le_bytes());
            }
            Request::SetPrn(prn) => frame.extend_from_slice(&prn.to_le_bytes()),
            Request::Select(kind) => frame.push(kind.into()),
            Request::CalculateChecksum | Request::Execute => {}
        }
        frame
    }
}

/// Payload of a SELECT response.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SelectResponse {
    pub max_object_size: u32,
    pub offset: u32,
    pub crc: u32,
}

impl SelectResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, DfuError> {
        if payload.len() < 12 {
            return Err(DfuError::ProtocolViolation(format!(
                "Select response payload too short ({} bytes)",
                payload.len()
            )));
        }
        Ok(SelectResponse {
            max_object_size: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            offset: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
            crc: u32::from_le_bytes(payload[8..12].try_into().unwrap()),
        })
    }
}

/// Payload of a CALCULATE_CHECKSUM response or a packet receipt notification.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChecksumResponse {
    pub offset: u32,
    pub crc: u32,
}

impl ChecksumResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, DfuError> {
        if payload.len() < 8 {
            return Err(DfuError::ProtocolViolation(format!(
                "checksum response payload too short ({} bytes)",
                payload.len()
            )));
        }
        Ok(ChecksumResponse {
            offset: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            crc: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
        })
    }
}

/// Issue one control-point request and await its response payload.
///
/// The expectation is registered before the write goes out, so a response
/// arriving between the write and the await is never lost.
pub(crate) async fn request<T: DfuTransport>(
    transport: &T,
    correlator: &ResponseCorrelator,
    req: Request,
    timeout: Duration,
) -> Result<Vec<u8>, DfuError> {
    let pending = correlator.expect(req.opcode())?;
    transport.write_ctrl(&req.encode()).await?;
    pending.wait(timeout).await
}

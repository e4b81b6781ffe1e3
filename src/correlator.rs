//! Bridging the asynchronous notify stream to request/response calls.
//!
//! The control point pushes response frames at arbitrary times after a write.
//! The correlator keeps one opcode-keyed waiter per outstanding request and
//! routes each decoded frame to its waiter; frames nobody is waiting for
//! (e.g. a packet receipt while receipts are disabled) are logged and dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::error::{DfuError, RejectReason};
use crate::protocol::{ExtError, OpCode, ResponseCode};

type Waiter = oneshot::Sender<Result<Vec<u8>, DfuError>>;

/// Opcode-keyed response router. Performs no I/O of its own.
#[derive(Default)]
pub struct ResponseCorrelator {
    waiters: Mutex<HashMap<OpCode, Waiter>>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the response to `opcode`.
    ///
    /// Must be called before the triggering write is sent, otherwise the
    /// response can arrive with nobody listening. At most one expectation per
    /// opcode may be outstanding; a second one is a client defect.
    pub fn expect(&self, opcode: OpCode) -> Result<PendingResponse<'_>, DfuError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.contains_key(&opcode) {
            return Err(DfuError::ProtocolViolation(format!(
                "an expectation for {opcode:?} is already pending"
            )));
        }
        waiters.insert(opcode, tx);
        Ok(PendingResponse { correlator: self, opcode, rx })
    }

    /// Decode one notification frame and route it to its waiter.
    pub fn on_notification(&self, bytes: &[u8]) {
        if bytes.len() < 3 || bytes[0] != u8::from(OpCode::Response) {
            warn!("dropping malformed notification: {bytes:02x?}");
            return;
        }
        let Ok(opcode) = OpCode::try_from(bytes[1]) else {
            warn!("dropping notification for unknown opcode {:#04x}", bytes[1]);
            return;
        };
        let Some(waiter) = self.waiters.lock().unwrap().remove(&opcode) else {
            debug!("no pending waiter for {opcode:?} response, dropping");
            return;
        };
        let outcome = match ResponseCode::try_from(bytes[2]) {
            Ok(ResponseCode::Success) => Ok(bytes[3..].to_vec()),
            Ok(ResponseCode::ExtError) => {
                let ext = bytes
                    .get(3)
                    .and_then(|b| ExtError::try_from(*b).ok())
                    .unwrap_or(ExtError::NoError);
                Err(DfuError::DeviceRejected { opcode, reason: RejectReason::Extended(ext) })
            }
            Ok(code) => Err(DfuError::DeviceRejected { opcode, reason: RejectReason::Code(code) }),
            Err(_) => Err(DfuError::ProtocolViolation(format!(
                "unknown result code {:#04x} in {opcode:?} response",
                bytes[2]
            ))),
        };
        // The waiter may have timed out and dropped its receiver already.
        let _ = waiter.send(outcome);
    }
}

/// Handle to one awaited response. Dropping it deregisters the waiter.
pub struct PendingResponse<'a> {
    correlator: &'a ResponseCorrelator,
    opcode: OpCode,
    rx: oneshot::Receiver<Result<Vec<u8>, DfuError>>,
}

impl PendingResponse<'_> {
    /// Suspend until the matching response arrives or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<u8>, DfuError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DfuError::ProtocolViolation(format!(
                "waiter for {:?} was dropped by the correlator",
                self.opcode
            ))),
            Err(_) => Err(DfuError::Timeout { opcode: self.opcode, timeout }),
        }
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.correlator.waiters.lock().unwrap().remove(&self.opcode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(opcode: OpCode, result: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![OpCode::Response.into(), opcode.into(), result];
        f.extend_from_slice(payload);
        f
    }

    #[tokio::test]
    async fn expectation_registered_before_notification_resolves() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(OpCode::Select).unwrap();
        correlator.on_notification(&frame(OpCode::Select, 0x01, &[1, 2, 3]));
        let payload = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload, [1, 2, 3]);
    }

    #[tokio::test]
    async fn unmatched_notification_leaves_other_waiters_intact() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(OpCode::Execute).unwrap();
        // A periodic receipt nobody asked for.
        correlator.on_notification(&frame(OpCode::CalculateChecksum, 0x01, &[0; 8]));
        correlator.on_notification(&frame(OpCode::Execute, 0x01, &[]));
        assert!(pending.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_expectation_is_a_protocol_violation() {
        let correlator = ResponseCorrelator::new();
        let _pending = correlator.expect(OpCode::Create).unwrap();
        assert!(matches!(
            correlator.expect(OpCode::Create),
            Err(DfuError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn timeout_frees_the_opcode_slot() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(OpCode::Execute).unwrap();
        let err = pending.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, DfuError::Timeout { opcode: OpCode::Execute, .. }));
        // The slot must be reusable after the timeout.
        assert!(correlator.expect(OpCode::Execute).is_ok());
    }

    #[tokio::test]
    async fn rejection_fails_the_waiter_with_the_result_code() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(OpCode::Create).unwrap();
        correlator.on_notification(&frame(OpCode::Create, 0x04, &[]));
        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            DfuError::DeviceRejected {
                opcode: OpCode::Create,
                reason: RejectReason::Code(ResponseCode::InsufficientResources),
            }
        ));
    }

    #[tokio::test]
    async fn extended_error_byte_is_decoded() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(OpCode::Execute).unwrap();
        correlator.on_notification(&frame(OpCode::Execute, 0x0B, &[0x08]));
        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            DfuError::DeviceRejected { reason: RejectReason::Extended(ExtError::SignatureMissing), .. }
        ));
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.expect(OpCode::Select).unwrap();
        correlator.on_notification(&[0x60]);
        correlator.on_notification(&[0xFF, 0x06, 0x01]);
        // Waiter is still pending afterwards.
        let err = pending.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, DfuError::Timeout { .. }));
    }
}

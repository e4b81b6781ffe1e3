//! Scripted in-process DFU target for exercising the transfer core without
//! a radio. Implements [`DfuTransport`] over an in-memory notification
//! channel and mimics the bootloader's object bookkeeping.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::stream::BoxStream;

use crate::correlator::ResponseCorrelator;
use crate::crc;
use crate::error::DfuError;
use crate::protocol::ResponseCode;
use crate::session::CancelToken;
use crate::transport::DfuTransport;

/// One control-point operation as seen by the simulated device.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceOp {
    Select(u8),
    Create(u8, u32),
    SetPrn(u16),
    Checksum,
    Execute(u8),
}

struct SimState {
    max_object_size: u32,
    selected: u8,
    prn: u16,
    prn_counter: u16,
    cmd: Vec<u8>,
    data: Vec<u8>,
    data_executed: usize,
    /// Drop incoming data bytes beyond this absolute offset. Cleared by the
    /// next checksum request unless `lose_forever` is set.
    lose_after: Option<usize>,
    lose_forever: bool,
    reject_create: Option<ResponseCode>,
    cancel_on_data: Option<CancelToken>,
    ops: Vec<DeviceOp>,
}

pub struct SimDevice {
    state: Mutex<SimState>,
    tx: UnboundedSender<Vec<u8>>,
    rx: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
}

const KIND_COMMAND: u8 = 0x01;
const KIND_DATA: u8 = 0x02;
const COMMAND_CAPACITY: u32 = 512;

fn ok_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x60, opcode, 0x01];
    frame.extend_from_slice(payload);
    frame
}

fn err_frame(opcode: u8, code: ResponseCode) -> Vec<u8> {
    vec![0x60, opcode, code as u8]
}

fn progress_payload(offset: usize, crc: u32) -> Vec<u8> {
    let mut payload = (offset as u32).to_le_bytes().to_vec();
    payload.extend_from_slice(&crc.to_le_bytes());
    payload
}

impl SimState {
    fn progress_of(&self, kind: u8) -> (usize, u32) {
        match kind {
            KIND_COMMAND => (self.cmd.len(), crc::compute(&self.cmd)),
            _ => (self.data.len(), crc::compute(&self.data)),
        }
    }

    fn handle_ctrl(&mut self, bytes: &[u8]) -> Vec<u8> {
        match bytes[0] {
            // SELECT
            0x06 => {
                let kind = bytes[1];
                self.ops.push(DeviceOp::Select(kind));
                self.selected = kind;
                let max = match kind {
                    KIND_COMMAND => COMMAND_CAPACITY,
                    _ => self.max_object_size,
                };
                let (offset, crc) = self.progress_of(kind);
                let mut payload = max.to_le_bytes().to_vec();
                payload.extend_from_slice(&progress_payload(offset, crc));
                ok_frame(0x06, &payload)
            }
            // CREATE
            0x01 => {
                let kind = bytes[1];
                let size = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
                self.ops.push(DeviceOp::Create(kind, size));
                if let Some(code) = self.reject_create {
                    return err_frame(0x01, code);
                }
                self.selected = kind;
                self.prn_counter = 0;
                match kind {
                    KIND_COMMAND => self.cmd.clear(),
                    _ => self.data.truncate(self.data_executed),
                }
                ok_frame(0x01, &[])
            }
            // SET_PRN
            0x02 => {
                let prn = u16::from_le_bytes(bytes[1..3].try_into().unwrap());
                self.ops.push(DeviceOp::SetPrn(prn));
                self.prn = prn;
                self.prn_counter = 0;
                ok_frame(0x02, &[])
            }
            // CALCULATE_CHECKSUM
            0x03 => {
                self.ops.push(DeviceOp::Checksum);
                let (offset, crc) = self.progress_of(self.selected);
                if !self.lose_forever {
                    self.lose_after = None;
                }
                ok_frame(0x03, &progress_payload(offset, crc))
            }
            // EXECUTE
            0x04 => {
                self.ops.push(DeviceOp::Execute(self.selected));
                if self.selected == KIND_DATA {
                    self.data_executed = self.data.len();
                }
                ok_frame(0x04, &[])
            }
            other => err_frame(other, ResponseCode::OpCodeNotSupported),
        }
    }

    /// Returns a receipt frame when the PRN counter fires.
    fn handle_data(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        match self.selected {
            KIND_COMMAND => self.cmd.extend_from_slice(bytes),
            _ => {
                if let Some(limit) = self.lose_after {
                    let room = limit.saturating_sub(self.data.len());
                    self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
                } else {
                    self.data.extend_from_slice(bytes);
                }
                if let Some(token) = self.cancel_on_data.take() {
                    token.cancel();
                }
            }
        }
        if self.prn > 0 {
            self.prn_counter += 1;
            if self.prn_counter == self.prn {
                self.prn_counter = 0;
                let (offset, crc) = self.progress_of(self.selected);
                return Some(ok_frame(0x03, &progress_payload(offset, crc)));
            }
        }
        None
    }
}

impl SimDevice {
    pub fn new(max_object_size: u32) -> Self {
        let (tx, rx) = unbounded();
        SimDevice {
            state: Mutex::new(SimState {
                max_object_size,
                selected: KIND_DATA,
                prn: 0,
                prn_counter: 0,
                cmd: Vec::new(),
                data: Vec::new(),
                data_executed: 0,
                lose_after: None,
                lose_forever: false,
                reject_create: None,
                cancel_on_data: None,
                ops: Vec::new(),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Silently discard data bytes past `offset`, once or persistently.
    pub fn lose_data_after(&self, offset: usize, forever: bool) {
        let mut state = self.state.lock().unwrap();
        state.lose_after = Some(offset);
        state.lose_forever = forever;
    }

    pub fn reject_create(&self, code: ResponseCode) {
        self.state.lock().unwrap().reject_create = Some(code);
    }

    /// Trip `token` when the first firmware byte arrives on the data channel.
    pub fn cancel_on_first_data(&self, token: CancelToken) {
        self.state.lock().unwrap().cancel_on_data = Some(token);
    }

    /// Pretend a fully streamed but unexecuted data object is already present.
    pub fn preload_data(&self, bytes: &[u8]) {
        self.state.lock().unwrap().data = bytes.to_vec();
    }

    pub fn command(&self) -> Vec<u8> {
        self.state.lock().unwrap().cmd.clone()
    }

    pub fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }

    pub fn data_executed(&self) -> usize {
        self.state.lock().unwrap().data_executed
    }

    pub fn prn(&self) -> u16 {
        self.state.lock().unwrap().prn
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count(&self, pred: impl Fn(&DeviceOp) -> bool) -> usize {
        self.state.lock().unwrap().ops.iter().filter(|op| pred(op)).count()
    }
}

impl DfuTransport for SimDevice {
    async fn write_ctrl(&self, bytes: &[u8]) -> Result<(), DfuError> {
        let reply = self.state.lock().unwrap().handle_ctrl(bytes);
        let _ = self.tx.unbounded_send(reply);
        Ok(())
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<(), DfuError> {
        let receipt = self.state.lock().unwrap().handle_data(bytes);
        if let Some(frame) = receipt {
            let _ = self.tx.unbounded_send(frame);
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, DfuError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("notification stream requested twice");
        Ok(rx.boxed())
    }
}

/// Spawn a notification pump for engine-level tests, mirroring what the
/// session coordinator does.
pub async fn wire(dev: &SimDevice) -> Arc<ResponseCorrelator> {
    let correlator = Arc::new(ResponseCorrelator::new());
    let mut notifications = dev.notifications().await.unwrap();
    let pump = Arc::clone(&correlator);
    tokio::spawn(async move {
        while let Some(frame) = notifications.next().await {
            pump.on_notification(&frame);
        }
    });
    correlator
}

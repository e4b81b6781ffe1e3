//! Per-object transfer state machine.
//!
//! One engine run carries a single DFU object from selection through execute:
//!
//! ```text
//! Selecting -> Creating -> Streaming -> Verifying -> Executing -> done
//!                  ^            `----------' |
//!                  `-------------------------'  (bounded checksum retries)
//! ```
//!
//! Selecting doubles as the resume path: when the device reports a partial
//! object whose checksum matches our local prefix, streaming restarts from
//! the reported offset instead of recreating the object from scratch.

use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::correlator::ResponseCorrelator;
use crate::crc;
use crate::error::DfuError;
use crate::fragment;
use crate::protocol::{self, ChecksumResponse, ObjectKind, OpCode, Request, SelectResponse};
use crate::session::TransferConfig;
use crate::transport::DfuTransport;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Selecting,
    Creating { window: usize },
    Streaming { window: usize, resume: usize },
    Verifying { window: usize },
    Executing { window: usize },
}

pub(crate) struct ObjectTransferEngine<'a, T: DfuTransport> {
    pub(crate) transport: &'a T,
    pub(crate) correlator: &'a ResponseCorrelator,
    pub(crate) config: &'a TransferConfig,
    pub(crate) progress: &'a ProgressBar,
    pub(crate) kind: ObjectKind,
    /// Remaining payload of this kind; the first `min(len, max_object_size)`
    /// bytes form this object's window.
    pub(crate) payload: &'a [u8],
    /// Absolute offset of `payload[0]` within the device's byte stream for
    /// this object kind.
    pub(crate) base: u32,
    /// Rolling CRC over the bytes preceding `payload`.
    pub(crate) crc_init: u32,
    /// Object index (0 is the init command object), for error reporting.
    pub(crate) object: usize,
}

impl<T: DfuTransport> ObjectTransferEngine<'_, T> {
    /// Drive the object to completion; returns the number of bytes committed.
    pub(crate) async fn run(&self) -> Result<usize, DfuError> {
        let mut state = State::Selecting;
        let mut retries = 0u32;
        loop {
            debug!("object {}: {state:?}", self.object);
            state = match state {
                State::Selecting => {
                    let selected = self.select().await?;
                    self.plan(selected)?
                }
                State::Creating { window } => {
                    self.create(window).await?;
                    State::Streaming { window, resume: 0 }
                }
                State::Streaming { window, resume } => {
                    self.stream(window, resume).await?;
                    State::Verifying { window }
                }
                State::Verifying { window } => match self.verify(window).await {
                    Ok(()) => State::Executing { window },
                    Err(err @ DfuError::ChecksumMismatch { .. }) => {
                        retries += 1;
                        if retries > self.config.max_retries {
                            return Err(DfuError::ChecksumExhausted {
                                object: self.object,
                                attempts: retries,
                            });
                        }
                        warn!("{err}; retry {retries}/{}", self.config.max_retries);
                        State::Selecting
                    }
                    Err(err) => return Err(err),
                },
                State::Executing { window } => {
                    self.execute().await?;
                    debug!("object {} committed ({window} bytes)", self.object);
                    return Ok(window);
                }
            };
        }
    }

    /// Decide where to go after SELECT: resume a matching partial object,
    /// or create a fresh one.
    fn plan(&self, selected: SelectResponse) -> Result<State, DfuError> {
        let max = selected.max_object_size as usize;
        if max == 0 || (self.kind == ObjectKind::Command && self.payload.len() > max) {
            return Err(DfuError::ObjectRejected {
                object: self.object,
                kind: self.kind,
                size: self.payload.len(),
                detail: format!("exceeds device object capacity of {max} bytes"),
            });
        }
        let window = match self.kind {
            ObjectKind::Command => self.payload.len(),
            ObjectKind::Data => self.payload.len().min(max),
        };

        let resume = selected.offset.saturating_sub(self.base) as usize;
        if resume > 0 && resume <= window {
            // The device-reported progress is only trustworthy if its
            // checksum matches our local prefix.
            if crc::extend(self.crc_init, &self.payload[..resume]) == selected.crc {
                info!(
                    "object {}: resuming at device-reported offset {}",
                    self.object, selected.offset
                );
                return Ok(State::Streaming { window, resume });
            }
        }
        if resume > 0 {
            debug!(
                "object {}: stale partial object on device (offset {}), recreating",
                self.object, selected.offset
            );
        }
        Ok(State::Creating { window })
    }

    async fn select(&self) -> Result<SelectResponse, DfuError> {
        let payload = self.request(Request::Select(self.kind)).await?;
        SelectResponse::parse(&payload)
    }

    async fn create(&self, window: usize) -> Result<(), DfuError> {
        let req = Request::Create { kind: self.kind, size: window as u32 };
        match self.request(req).await {
            Ok(_) => Ok(()),
            Err(DfuError::DeviceRejected { reason, .. }) => Err(DfuError::ObjectRejected {
                object: self.object,
                kind: self.kind,
                size: window,
                detail: reason.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    /// Write the window tail as ordered data-channel fragments. With packet
    /// receipts enabled, every `prn`-th fragment is followed by a receipt
    /// await; a divergent receipt cuts streaming short so that Verifying can
    /// drive the retry from the device-reported offset.
    async fn stream(&self, window: usize, resume: usize) -> Result<(), DfuError> {
        let mut sent = resume;
        let mut since_receipt: u16 = 0;
        for frag in fragment::fragments(&self.payload[resume..window], self.config.fragment_size) {
            let expect_receipt = self.config.prn > 0 && since_receipt + 1 == self.config.prn;
            let pending = if expect_receipt {
                // Register before the triggering write to avoid losing a
                // receipt that arrives immediately.
                Some(self.correlator.expect(OpCode::CalculateChecksum)?)
            } else {
                None
            };
            self.transport.write_data(frag).await?;
            sent += frag.len();
            if self.kind == ObjectKind::Data {
                self.progress.set_position(self.base as u64 + sent as u64);
            }
            match pending {
                Some(pending) => {
                    let receipt =
                        ChecksumResponse::parse(&pending.wait(self.config.request_timeout).await?)?;
                    let expected_crc = crc::extend(self.crc_init, &self.payload[..sent]);
                    if receipt.offset != self.base + sent as u32 || receipt.crc != expected_crc {
                        warn!(
                            "object {}: packet receipt diverged at offset {} (local {})",
                            self.object,
                            receipt.offset,
                            self.base + sent as u32
                        );
                        return Ok(());
                    }
                    since_receipt = 0;
                }
                None => since_receipt += 1,
            }
        }
        Ok(())
    }

    async fn verify(&self, window: usize) -> Result<(), DfuError> {
        let payload = self.request(Request::CalculateChecksum).await?;
        let reported = ChecksumResponse::parse(&payload)?;
        let expected_offset = self.base + window as u32;
        let expected_crc = crc::extend(self.crc_init, &self.payload[..window]);
        if reported.offset != expected_offset || reported.crc != expected_crc {
            return Err(DfuError::ChecksumMismatch {
                object: self.object,
                expected_offset,
                actual_offset: reported.offset,
                expected_crc,
                actual_crc: reported.crc,
            });
        }
        Ok(())
    }

    async fn execute(&self) -> Result<(), DfuError> {
        self.request(Request::Execute).await?;
        Ok(())
    }

    async fn request(&self, req: Request) -> Result<Vec<u8>, DfuError> {
        protocol::request(self.transport, self.correlator, req, self.config.request_timeout).await
    }
}

//! End-to-end transfer orchestration.
//!
//! The coordinator owns the connected transport, the response correlator and
//! its notification pump, and runs one engine pass for the init command
//! object followed by as many data object passes as the firmware needs. Each
//! data pass starts with its own SELECT, so the device-reported maximum
//! object size is honored even when it changes between objects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use indicatif::ProgressBar;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::correlator::ResponseCorrelator;
use crate::crc;
use crate::engine::ObjectTransferEngine;
use crate::error::DfuError;
use crate::package::FirmwareImage;
use crate::protocol::{self, ObjectKind, Request};
use crate::transport::DfuTransport;

/// Transfer policy values. All of them are overridable from the CLI; the
/// object size itself always comes from the device's SELECT response.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Fragments between packet receipt notifications; 0 disables receipts.
    pub prn: u16,
    /// Data-channel fragment size. 20 bytes is the minimum safe
    /// unacknowledged write size.
    pub fragment_size: usize,
    /// Timeout for every control-point response await.
    pub request_timeout: Duration,
    /// Checksum retry budget per object.
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            prn: 0,
            fragment_size: 20,
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Cooperative cancellation flag, checked at object boundaries only so the
/// device is never abandoned mid-object.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct SessionCoordinator<T: DfuTransport> {
    transport: T,
    correlator: Arc<ResponseCorrelator>,
    config: TransferConfig,
    cancel: CancelToken,
    progress: ProgressBar,
    active: Mutex<()>,
}

impl<T: DfuTransport> SessionCoordinator<T> {
    /// Take exclusive ownership of the transport and start routing its
    /// notifications into the correlator.
    pub async fn start(
        transport: T,
        config: TransferConfig,
        progress: ProgressBar,
    ) -> Result<Self, DfuError> {
        let correlator = Arc::new(ResponseCorrelator::new());
        let mut notifications = transport.notifications().await?;
        let pump = Arc::clone(&correlator);
        tokio::spawn(async move {
            while let Some(frame) = notifications.next().await {
                pump.on_notification(&frame);
            }
            debug!("notification stream closed");
        });
        Ok(SessionCoordinator {
            transport,
            correlator,
            config,
            cancel: CancelToken::new(),
            progress,
            active: Mutex::new(()),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Deliver the whole image: the init command object first, then the
    /// firmware as successive data objects.
    pub async fn transfer_firmware(&self, image: &FirmwareImage) -> Result<(), DfuError> {
        let _active = self.active.try_lock().map_err(|_| DfuError::SessionBusy)?;

        self.request(Request::SetPrn(self.config.prn)).await?;

        self.progress.set_length(image.firmware_data.len() as u64);
        self.progress.set_message("init packet");
        ObjectTransferEngine {
            transport: &self.transport,
            correlator: &self.correlator,
            config: &self.config,
            progress: &self.progress,
            kind: ObjectKind::Command,
            payload: &image.init_data,
            base: 0,
            crc_init: 0,
            object: 0,
        }
        .run()
        .await?;
        info!("init packet committed ({} bytes)", image.init_data.len());

        self.progress.set_message("firmware");
        let firmware = image.firmware_data.as_slice();
        let mut offset = 0usize;
        let mut rolling_crc = 0u32;
        let mut object = 1usize;
        while offset < firmware.len() {
            if self.cancel.is_cancelled() {
                info!("cancelled at object boundary, {offset}/{} bytes delivered", firmware.len());
                return Err(DfuError::Cancelled);
            }
            let committed = ObjectTransferEngine {
                transport: &self.transport,
                correlator: &self.correlator,
                config: &self.config,
                progress: &self.progress,
                kind: ObjectKind::Data,
                payload: &firmware[offset..],
                base: offset as u32,
                crc_init: rolling_crc,
                object,
            }
            .run()
            .await?;
            rolling_crc = crc::extend(rolling_crc, &firmware[offset..offset + committed]);
            offset += committed;
            object += 1;
            self.progress.set_position(offset as u64);
        }
        self.progress.finish_with_message("done");
        Ok(())
    }

    async fn request(&self, req: Request) -> Result<Vec<u8>, DfuError> {
        protocol::request(&self.transport, &self.correlator, req, self.config.request_timeout).await
    }
}

//! DFU transport interface.
//!
//! A connected target exposes two logical channels: the control point
//! (acknowledged writes, notify-capable) and the data point (unacknowledged,
//! high-throughput writes). The transfer core only ever talks to these traits;
//! the BLE implementation lives in `transport_btleplug`.

use futures::stream::BoxStream;

use crate::error::DfuError;

/// A connected DFU target.
pub trait DfuTransport {
    /// Acknowledged write on the control point.
    async fn write_ctrl(&self, bytes: &[u8]) -> Result<(), DfuError>;

    /// Unacknowledged write on the data point. Fragments are delivered in
    /// call order; the device assembles them as a contiguous byte stream.
    async fn write_data(&self, bytes: &[u8]) -> Result<(), DfuError>;

    /// Subscribe to control-point notifications and return the frame stream.
    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, DfuError>;
}

/// Produces connected transports from scan results.
pub trait DfuTransportManager {
    type Transport: DfuTransport;

    /// Connect to the peripheral at `index` in the current scan listing.
    async fn connect(&self, index: usize) -> Result<Self::Transport, DfuError>;
}

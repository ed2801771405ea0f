//! Capability surface of an attached measurement session.
//!
//! The streaming loop only talks to these traits, so any backend (the
//! simulator in this crate, a hardware binding, a test fake) can sit behind it.

use async_trait::async_trait;

use crate::{ChannelId, DeviceInfo, Mode, SmuError, Tick};

#[async_trait]
pub trait Session: Send {
    type Device: Device;

    /// Devices bound to this session, in discovery order. May be empty.
    fn devices(&self) -> &[Self::Device];

    fn devices_mut(&mut self) -> &mut [Self::Device];

    /// Start acquisition on every device. A duration of 0 streams until cancelled.
    async fn start(&mut self, duration: u64) -> Result<(), SmuError>;

    /// Stop acquisition on every device.
    async fn cancel(&mut self) -> Result<(), SmuError>;
}

#[async_trait]
pub trait Device: Send {
    fn info(&self) -> &DeviceInfo;

    /// When set, dataflow errors are swallowed instead of reported.
    fn ignore_dataflow(&self) -> bool;

    fn set_ignore_dataflow(&mut self, ignore: bool);

    fn mode(&self, channel: ChannelId) -> Mode;

    fn set_mode(&mut self, channel: ChannelId, mode: Mode) -> Result<(), SmuError>;

    /// Queue output samples for a channel. Returns once they are enqueued,
    /// not once the device has consumed them.
    async fn write(&mut self, channel: ChannelId, samples: Vec<f32>) -> Result<(), SmuError>;

    /// Wait for exactly `num_samples` ticks.
    async fn read(&mut self, num_samples: usize) -> Result<Vec<Tick>, SmuError>;
}

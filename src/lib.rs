mod device;
mod error;
mod format;
mod sim;
mod stream;
mod waveform;

// Re-export the main interface
pub use device::{Device, Session};
pub use error::SmuError;
pub use format::{format_tick, format_value, OutputStyle};
pub use sim::{SimConfig, SimDevice, SimSession};
pub use stream::{run_stream, StreamConfig, StreamOutcome, StreamReport};
pub use waveform::{RandomStep, Sine, StepWaveform, UniformNoise, Waveform};

/// Channel operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// High impedance, nothing sourced.
    #[default]
    Disabled,
    /// Source voltage, measure current.
    Svmi,
    /// Source current, measure voltage.
    Simv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    A,
    B,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::A, ChannelId::B];

    pub fn index(self) -> usize {
        match self {
            ChannelId::A => 0,
            ChannelId::B => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelId::A => "A",
            ChannelId::B => "B",
        }
    }
}

impl std::str::FromStr for ChannelId {
    type Err = SmuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(ChannelId::A),
            "B" | "b" => Ok(ChannelId::B),
            other => Err(SmuError::InvalidChannel(other.to_string())),
        }
    }
}

/// One time-aligned measurement across both channels, each as (volts, amps).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Tick {
    pub a: (f32, f32),
    pub b: (f32, f32),
}

impl Tick {
    pub fn new(a: (f32, f32), b: (f32, f32)) -> Self {
        Self { a, b }
    }

    pub fn channel(&self, channel: ChannelId) -> (f32, f32) {
        match channel {
            ChannelId::A => self.a,
            ChannelId::B => self.b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub label: String,
    pub serial: String,
    pub fwver: String,
    pub hwver: String,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: serial {}: fw {}: hw {}",
            self.label, self.serial, self.fwver, self.hwver
        )
    }
}

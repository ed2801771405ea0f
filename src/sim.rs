//! Simulated ADALM1000-style session.
//!
//! Each device runs an acquisition task on the tokio runtime. Every timer tick it
//! drains one chunk from the per-channel output queues, applies a resistive load
//! model, and pushes the resulting ticks into a bounded input queue. A full input
//! queue drops the chunk and latches an overflow that the next `read` reports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::device::{Device, Session};
use crate::{ChannelId, DeviceInfo, Mode, SmuError, Tick};

const V_MIN: f32 = 0.0;
const V_MAX: f32 = 5.0;
const I_MIN: f32 = -0.2;
const I_MAX: f32 = 0.2;
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SimConfig {
    device_count: usize,
    sample_rate: f64, // samples/s
    chunk_size: usize, // ticks per acquisition step
    queue_size: usize, // ticks, input and per-channel output
    load_ohms: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            sample_rate: 100_000.0,
            chunk_size: 256,
            queue_size: 100_000,
            load_ohms: 1000.0,
        }
    }
}

impl SimConfig {
    pub fn new(device_count: usize, sample_rate: f64, chunk_size: usize, queue_size: usize, load_ohms: f32) -> Result<Self, anyhow::Error> {
        if !(sample_rate >= 1.0) {
            error!("sample_rate must be at least 1.0");
            return Err(anyhow!("sample_rate must be at least 1.0"));
        }
        if chunk_size < 1 {
            error!("chunk_size must be greater than 0");
            return Err(anyhow!("chunk_size must be greater than 0"));
        }
        if (chunk_size as f64 / sample_rate) < 1e-6 {
            error!("chunk_size {} at {} samples/s gives a sub-microsecond acquisition period", chunk_size, sample_rate);
            return Err(anyhow!("chunk_size {} at {} samples/s gives a sub-microsecond acquisition period", chunk_size, sample_rate));
        }
        if queue_size < chunk_size {
            error!("queue_size must be at least chunk_size");
            return Err(anyhow!("queue_size must be at least chunk_size"));
        }
        if !(load_ohms > 0.0) {
            error!("load_ohms must be positive");
            return Err(anyhow!("load_ohms must be positive"));
        }
        Ok(Self {
            device_count,
            sample_rate,
            chunk_size,
            queue_size,
            load_ohms,
        })
    }

    pub fn with_devices(mut self, device_count: usize) -> Self {
        self.device_count = device_count;
        self
    }

    fn chunk_period(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate)
    }
}

/// Measured (volts, amps) for a channel sourcing `value` into `load_ohms` to ground.
pub(crate) fn measure(mode: Mode, value: f32, load_ohms: f32) -> (f32, f32) {
    match mode {
        Mode::Disabled => (0.0, 0.0),
        Mode::Svmi => {
            let volts = value.clamp(V_MIN, V_MAX);
            (volts, (volts / load_ohms).clamp(I_MIN, I_MAX))
        }
        Mode::Simv => {
            let amps = value.clamp(I_MIN, I_MAX);
            ((amps * load_ohms).clamp(V_MIN, V_MAX), amps)
        }
    }
}

#[derive(Debug)]
enum SimCommand {
    Start { limit: Option<u64>, ack: oneshot::Sender<()> },
    Stop { ack: oneshot::Sender<()> },
}

#[derive(Debug, Default)]
struct OutputQueue {
    samples: VecDeque<f32>,
    last: f32,
}

#[derive(Debug, Default)]
struct SimState {
    running: bool,
    remaining: Option<u64>,
    modes: [Mode; 2],
    outputs: [OutputQueue; 2],
    input: VecDeque<Tick>,
    overflowed: bool,
    dropped: u64,
}

struct Shared {
    state: Mutex<SimState>,
    input_ready: Notify,
    output_space: Notify,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, SimState>, SmuError> {
        self.state
            .lock()
            .map_err(|_| SmuError::Session("device state lock poisoned".to_string()))
    }
}

struct Acquisition {
    config: SimConfig,
    shared: Arc<Shared>,
    command_rx: Receiver<SimCommand>,
}

impl Acquisition {
    async fn run(&mut self) {
        let period = self.config.chunk_period();
        let mut sample_timer = interval_at(Instant::now() + period, period);
        sample_timer.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(SimCommand::Start { limit, ack }) => {
                            if let Ok(mut state) = self.shared.lock() {
                                state.input.clear();
                                state.overflowed = false;
                                state.running = true;
                                state.remaining = limit;
                            }
                            sample_timer.reset();
                            let _ = ack.send(());
                            info!("acquisition started, limit: {:?}", limit);
                        },
                        Some(SimCommand::Stop { ack }) => {
                            if let Ok(mut state) = self.shared.lock() {
                                state.running = false;
                            }
                            self.shared.input_ready.notify_one();
                            let _ = ack.send(());
                            info!("acquisition stopped");
                        },
                        None => {
                            debug!("command channel closed, acquisition task exiting");
                            break;
                        }
                    }
                },
                _ = sample_timer.tick() => {
                    self.acquire_chunk();
                }
            }
        }
    }

    fn acquire_chunk(&mut self) {
        let Ok(mut state) = self.shared.lock() else {
            error!("device state lock poisoned, skipping chunk");
            return;
        };
        if !state.running {
            return;
        }
        let mut count = self.config.chunk_size as u64;
        if let Some(remaining) = state.remaining {
            count = count.min(remaining);
        }

        let mut chunk = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut measured = [(0.0, 0.0); 2];
            for channel in ChannelId::ALL {
                let idx = channel.index();
                let mode = state.modes[idx];
                let output = &mut state.outputs[idx];
                let value = match mode {
                    Mode::Disabled => 0.0,
                    _ => {
                        if let Some(sample) = output.samples.pop_front() {
                            output.last = sample;
                        }
                        output.last
                    }
                };
                measured[idx] = measure(mode, value, self.config.load_ohms);
            }
            chunk.push(Tick::new(measured[0], measured[1]));
        }

        if state.input.len() + chunk.len() > self.config.queue_size {
            state.overflowed = true;
            state.dropped += chunk.len() as u64;
            debug!("input queue full, dropped {} samples", chunk.len());
        } else {
            state.input.extend(chunk);
        }
        if let Some(remaining) = state.remaining.as_mut() {
            *remaining -= count;
            if *remaining == 0 {
                state.running = false;
                info!("acquisition reached sample limit");
            }
        }
        drop(state);

        self.shared.input_ready.notify_one();
        self.shared.output_space.notify_one();
    }
}

pub struct SimDevice {
    info: DeviceInfo,
    config: SimConfig,
    shared: Arc<Shared>,
    command_tx: Sender<SimCommand>,
    task: JoinHandle<()>,
    ignore_dataflow: bool,
    streaming: bool,
}

impl SimDevice {
    /// Must be called from within a tokio runtime; the acquisition task is spawned here.
    pub fn new(index: usize, config: SimConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState::default()),
            input_ready: Notify::new(),
            output_space: Notify::new(),
        });
        let (command_tx, command_rx) = tokio::sync::mpsc::channel::<SimCommand>(4);
        let mut acquisition = Acquisition {
            config: config.clone(),
            shared: shared.clone(),
            command_rx,
        };
        let task = tokio::spawn(async move { acquisition.run().await });

        Self {
            info: DeviceInfo {
                label: "ADALM1000".to_string(),
                serial: format!("SIM{:04}", index),
                fwver: "2.17".to_string(),
                hwver: "F".to_string(),
            },
            config,
            shared,
            command_tx,
            task,
            ignore_dataflow: false,
            streaming: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Total samples dropped on input overflow since creation.
    pub fn dropped_samples(&self) -> u64 {
        self.shared.lock().map(|state| state.dropped).unwrap_or(0)
    }

    async fn send_command(&self, make: impl FnOnce(oneshot::Sender<()>) -> SimCommand) -> Result<(), SmuError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(make(ack_tx))
            .await
            .map_err(|e| SmuError::Session(format!("acquisition task gone: {}", e)))?;
        ack_rx
            .await
            .map_err(|_| SmuError::Session("acquisition task dropped command".to_string()))
    }

    async fn start(&mut self, limit: Option<u64>) -> Result<(), SmuError> {
        self.send_command(|ack| SimCommand::Start { limit, ack }).await?;
        self.streaming = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SmuError> {
        self.send_command(|ack| SimCommand::Stop { ack }).await?;
        self.streaming = false;
        Ok(())
    }

    fn dataflow(&self, what: &str) -> Result<(), SmuError> {
        if self.ignore_dataflow {
            debug!("{}: {}, ignored", self.info.serial, what);
            Ok(())
        } else {
            Err(SmuError::Dataflow(what.to_string()))
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Device for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn ignore_dataflow(&self) -> bool {
        self.ignore_dataflow
    }

    fn set_ignore_dataflow(&mut self, ignore: bool) {
        self.ignore_dataflow = ignore;
    }

    fn mode(&self, channel: ChannelId) -> Mode {
        self.shared
            .lock()
            .map(|state| state.modes[channel.index()])
            .unwrap_or_default()
    }

    fn set_mode(&mut self, channel: ChannelId, mode: Mode) -> Result<(), SmuError> {
        if self.streaming {
            return Err(SmuError::Session("cannot change mode while streaming".to_string()));
        }
        self.shared.lock()?.modes[channel.index()] = mode;
        info!("{}: channel {} mode set to {:?}", self.info.serial, channel.name(), mode);
        Ok(())
    }

    async fn write(&mut self, channel: ChannelId, samples: Vec<f32>) -> Result<(), SmuError> {
        if samples.len() > self.config.queue_size {
            return Err(SmuError::Session(format!(
                "write of {} samples exceeds queue size {}",
                samples.len(),
                self.config.queue_size
            )));
        }
        let deadline = Instant::now() + WRITE_TIMEOUT;
        loop {
            {
                let mut state = self.shared.lock()?;
                let queue = &mut state.outputs[channel.index()].samples;
                if queue.len() + samples.len() <= self.config.queue_size {
                    queue.extend(samples);
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline || timeout(deadline - now, self.shared.output_space.notified()).await.is_err() {
                warn!("{}: channel {} write timed out", self.info.serial, channel.name());
                return self.dataflow("data write timeout");
            }
        }
    }

    async fn read(&mut self, num_samples: usize) -> Result<Vec<Tick>, SmuError> {
        if num_samples > self.config.queue_size {
            return Err(SmuError::Session(format!(
                "read of {} samples exceeds queue size {}",
                num_samples, self.config.queue_size
            )));
        }
        loop {
            {
                let mut state = self.shared.lock()?;
                if state.overflowed {
                    state.overflowed = false;
                    drop(state);
                    self.dataflow("data sample dropped")?;
                    continue;
                }
                if state.input.len() >= num_samples {
                    return Ok(state.input.drain(..num_samples).collect());
                }
                if !state.running {
                    return Err(SmuError::Session("device is not streaming".to_string()));
                }
            }
            self.shared.input_ready.notified().await;
        }
    }
}

pub struct SimSession {
    devices: Vec<SimDevice>,
}

impl SimSession {
    pub fn new(config: SimConfig) -> Self {
        let devices = (0..config.device_count)
            .map(|index| SimDevice::new(index, config.clone()))
            .collect::<Vec<_>>();
        info!("simulated session with {} device(s)", devices.len());
        Self { devices }
    }
}

#[async_trait]
impl Session for SimSession {
    type Device = SimDevice;

    fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    fn devices_mut(&mut self) -> &mut [SimDevice] {
        &mut self.devices
    }

    async fn start(&mut self, duration: u64) -> Result<(), SmuError> {
        let limit = if duration == 0 { None } else { Some(duration) };
        for device in self.devices.iter_mut() {
            device.start(limit).await?;
        }
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), SmuError> {
        for device in self.devices.iter_mut() {
            if device.streaming {
                device.stop().await?;
            }
        }
        Ok(())
    }
}

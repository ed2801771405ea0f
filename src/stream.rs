use std::io::Write;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::device::{Device, Session};
use crate::format::{write_ticks, OutputStyle};
use crate::waveform::Waveform;
use crate::{ChannelId, Mode, SmuError};

pub const NO_DEVICE_MESSAGE: &str = "no devices attached";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    num_samples: usize, // ticks written and read per iteration
    mode: Mode,
    ignore_dataflow: bool,
    style: OutputStyle,
    max_iterations: Option<u64>, // None runs until cancelled
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            num_samples: 1024,
            mode: Mode::Svmi,
            ignore_dataflow: false,
            style: OutputStyle::Lines,
            max_iterations: None,
        }
    }
}

impl StreamConfig {
    pub fn new(num_samples: usize, mode: Mode, ignore_dataflow: bool, style: OutputStyle, max_iterations: Option<u64>) -> Result<Self, anyhow::Error> {
        if num_samples < 1 {
            error!("num_samples must be greater than 0");
            return Err(anyhow!("num_samples must be greater than 0"));
        }
        if mode == Mode::Disabled {
            error!("streaming needs a sourcing mode, got {:?}", mode);
            return Err(anyhow!("streaming needs a sourcing mode, got {:?}", mode));
        }
        Ok(Self {
            num_samples,
            mode,
            ignore_dataflow,
            style,
            max_iterations,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    NoDevice,
    Cancelled,
    /// `max_iterations` reached.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    pub iterations: u64,
    pub ticks: u64,
    pub dropped_batches: u64,
}

impl StreamReport {
    fn new(outcome: StreamOutcome) -> Self {
        Self {
            outcome,
            iterations: 0,
            ticks: 0,
            dropped_batches: 0,
        }
    }
}

/// Stream a waveform out of the first device while printing what it measures.
///
/// Every iteration writes `num_samples` values to channels A and B, then waits
/// for `num_samples` ticks and prints them, one line per tick. Runs until
/// `cancel` fires or `max_iterations` is reached. A dataflow error ends the run
/// unless the device has `ignore_dataflow` set, in which case the affected
/// batch is dropped and streaming continues.
pub async fn run_stream<S, W, O>(
    session: &mut S,
    config: &StreamConfig,
    waveform: &mut W,
    out: &mut O,
    cancel: &CancellationToken,
) -> Result<StreamReport, SmuError>
where
    S: Session,
    W: Waveform + ?Sized,
    O: Write + ?Sized,
{
    let Some(dev) = session.devices_mut().first_mut() else {
        writeln!(out, "{}", NO_DEVICE_MESSAGE)?;
        out.flush()?;
        return Ok(StreamReport::new(StreamOutcome::NoDevice));
    };

    info!("using device {}", dev.info());
    dev.set_ignore_dataflow(config.ignore_dataflow);
    for channel in ChannelId::ALL {
        dev.set_mode(channel, config.mode)?;
    }

    session.start(0).await?;
    info!("continuous streaming started, {} samples per iteration", config.num_samples);

    let mut report = StreamReport::new(StreamOutcome::Cancelled);
    let mut v: u64 = 0;
    let result = loop {
        if cancel.is_cancelled() {
            break Ok(StreamOutcome::Cancelled);
        }
        if config.max_iterations.is_some_and(|max| report.iterations >= max) {
            break Ok(StreamOutcome::Completed);
        }

        let dev = &mut session.devices_mut()[0];
        let a_samples = waveform.refill(v, config.num_samples);
        let b_samples = waveform.refill(v, config.num_samples);
        let written = match dev.write(ChannelId::A, a_samples).await {
            Ok(()) => dev.write(ChannelId::B, b_samples).await,
            Err(e) => Err(e),
        };
        v += 1;

        if let Err(e) = written {
            if e.is_dataflow() && dev.ignore_dataflow() {
                warn!("write dropped at iteration {}: {}", report.iterations, e);
                report.dropped_batches += 1;
            } else {
                error!("write failed at iteration {}: {}", report.iterations, e);
                break Err(e);
            }
        }

        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(StreamOutcome::Cancelled),
            read = dev.read(config.num_samples) => read,
        };
        match read {
            Ok(ticks) => {
                if let Err(e) = write_ticks(out, &ticks, config.style) {
                    break Err(e.into());
                }
                report.ticks += ticks.len() as u64;
            }
            Err(e) if e.is_dataflow() && dev.ignore_dataflow() => {
                warn!("read dropped at iteration {}: {}", report.iterations, e);
                report.dropped_batches += 1;
            }
            Err(e) => {
                error!("read failed at iteration {}: {}", report.iterations, e);
                break Err(e);
            }
        }
        report.iterations += 1;
    };

    if let Err(e) = session.cancel().await {
        warn!("failed to stop session: {}", e);
    }

    let outcome = result?;
    report.outcome = outcome;
    info!(
        "streaming ended: {:?} after {} iterations, {} ticks, {} dropped batches",
        outcome, report.iterations, report.ticks, report.dropped_batches
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::StepWaveform;
    use crate::{DeviceInfo, Tick};
    use async_trait::async_trait;
    use tokio::time::Duration;
    use tracing_subscriber::EnvFilter;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Write(ChannelId, Vec<f32>),
        Read(usize),
    }

    struct FakeDevice {
        info: DeviceInfo,
        ignore_dataflow: bool,
        modes: [Mode; 2],
        calls: Vec<Call>,
        tick: Tick,
        overflow_on_read: Option<usize>, // 1-based read call that fails
        overflow_on_write: Option<usize>, // 1-based write call that fails
        stall_reads: bool,
    }

    impl FakeDevice {
        fn new() -> Self {
            Self {
                info: DeviceInfo {
                    label: "fake".to_string(),
                    serial: "FAKE0".to_string(),
                    fwver: "0".to_string(),
                    hwver: "0".to_string(),
                },
                ignore_dataflow: false,
                modes: [Mode::Disabled; 2],
                calls: Vec::new(),
                tick: Tick::new((1.0, 0.1), (1.0, 0.1)),
                overflow_on_read: None,
                overflow_on_write: None,
                stall_reads: false,
            }
        }

        fn reads(&self) -> Vec<usize> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Read(n) => Some(*n),
                    _ => None,
                })
                .collect()
        }

        fn writes(&self) -> Vec<(ChannelId, Vec<f32>)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Write(ch, batch) => Some((*ch, batch.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Device for FakeDevice {
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
            self.modes[channel.index()]
        }

        fn set_mode(&mut self, channel: ChannelId, mode: Mode) -> Result<(), SmuError> {
            self.modes[channel.index()] = mode;
            Ok(())
        }

        async fn write(&mut self, channel: ChannelId, samples: Vec<f32>) -> Result<(), SmuError> {
            self.calls.push(Call::Write(channel, samples));
            if Some(self.writes().len()) == self.overflow_on_write {
                return Err(SmuError::Dataflow("data write timeout".to_string()));
            }
            Ok(())
        }

        async fn read(&mut self, num_samples: usize) -> Result<Vec<Tick>, SmuError> {
            self.calls.push(Call::Read(num_samples));
            if self.stall_reads {
                std::future::pending::<()>().await;
            }
            if Some(self.reads().len()) == self.overflow_on_read {
                return Err(SmuError::Dataflow("data sample dropped".to_string()));
            }
            Ok(vec![self.tick; num_samples])
        }
    }

    struct FakeSession {
        devices: Vec<FakeDevice>,
        starts: Vec<u64>,
        cancels: usize,
    }

    impl FakeSession {
        fn with_device(device: FakeDevice) -> Self {
            Self {
                devices: vec![device],
                starts: Vec::new(),
                cancels: 0,
            }
        }

        fn empty() -> Self {
            Self {
                devices: Vec::new(),
                starts: Vec::new(),
                cancels: 0,
            }
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        type Device = FakeDevice;

        fn devices(&self) -> &[FakeDevice] {
            &self.devices
        }

        fn devices_mut(&mut self) -> &mut [FakeDevice] {
            &mut self.devices
        }

        async fn start(&mut self, duration: u64) -> Result<(), SmuError> {
            self.starts.push(duration);
            Ok(())
        }

        async fn cancel(&mut self) -> Result<(), SmuError> {
            self.cancels += 1;
            Ok(())
        }
    }

    fn config(num_samples: usize, ignore_dataflow: bool, max_iterations: Option<u64>) -> StreamConfig {
        StreamConfig::new(num_samples, Mode::Svmi, ignore_dataflow, OutputStyle::Lines, max_iterations).unwrap()
    }

    #[test]
    fn test_stream_config_default() {
        let config = StreamConfig::default();
        assert_eq!(config.num_samples, 1024);
        assert_eq!(config.mode, Mode::Svmi);
        assert!(!config.ignore_dataflow);
        assert_eq!(config.style, OutputStyle::Lines);
        assert!(config.max_iterations.is_none());
    }

    #[test]
    fn test_stream_config_invalid() {
        assert!(StreamConfig::new(0, Mode::Svmi, false, OutputStyle::Lines, None).is_err());
        assert!(StreamConfig::new(16, Mode::Disabled, false, OutputStyle::Lines, None).is_err());
        assert!(StreamConfig::new(16, Mode::Simv, true, OutputStyle::Overwrite, Some(3)).is_ok());
    }

    #[tokio::test]
    async fn test_no_device_prints_message_only() {
        init_test_logging();
        let mut session = FakeSession::empty();
        let mut out = Vec::new();
        let report = run_stream(
            &mut session,
            &config(4, false, None),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, StreamOutcome::NoDevice);
        assert_eq!(report.iterations, 0);
        assert_eq!(String::from_utf8(out).unwrap(), "no devices attached\n");
        assert!(session.starts.is_empty());
        assert_eq!(session.cancels, 0);
    }

    #[tokio::test]
    async fn test_setup_configures_device_and_starts_continuous() {
        init_test_logging();
        let mut session = FakeSession::with_device(FakeDevice::new());
        let mut out = Vec::new();
        run_stream(
            &mut session,
            &config(4, true, Some(1)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let dev = &session.devices[0];
        assert!(dev.ignore_dataflow);
        assert_eq!(dev.mode(ChannelId::A), Mode::Svmi);
        assert_eq!(dev.mode(ChannelId::B), Mode::Svmi);
        assert_eq!(session.starts, vec![0]);
        assert_eq!(session.cancels, 1);
    }

    #[tokio::test]
    async fn test_output_lines_for_read_batch() {
        init_test_logging();
        let mut session = FakeSession::with_device(FakeDevice::new());
        let mut out = Vec::new();
        let report = run_stream(
            &mut session,
            &config(4, false, Some(1)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, StreamOutcome::Completed);
        assert_eq!(report.ticks, 4);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in lines {
            assert_eq!(line, " 1.000000  0.100000  1.000000  0.100000");
            assert_eq!(line.split_whitespace().count(), 4);
        }
    }

    #[tokio::test]
    async fn test_write_and_read_lengths_aligned() {
        init_test_logging();
        let mut session = FakeSession::with_device(FakeDevice::new());
        let mut out = Vec::new();
        run_stream(
            &mut session,
            &config(7, false, Some(5)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Each iteration is write A, write B, read, all with the same length.
        let calls = &session.devices[0].calls;
        assert_eq!(calls.len(), 15);
        for iteration in calls.chunks(3) {
            match iteration {
                [Call::Write(ChannelId::A, a), Call::Write(ChannelId::B, b), Call::Read(n)] => {
                    assert_eq!(a.len(), *n);
                    assert_eq!(b.len(), *n);
                    assert_eq!(*n, 7);
                }
                other => panic!("unexpected call sequence: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_step_values_advance_by_one_per_iteration() {
        init_test_logging();
        let mut session = FakeSession::with_device(FakeDevice::new());
        let mut out = Vec::new();
        run_stream(
            &mut session,
            &config(3, false, Some(14)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let writes = session.devices[0].writes();
        assert_eq!(writes.len(), 28);
        for (i, pair) in writes.chunks(2).enumerate() {
            let expected = vec![(i as u64 % 6) as f32; 3];
            assert_eq!(pair[0], (ChannelId::A, expected.clone()));
            assert_eq!(pair[1], (ChannelId::B, expected));
        }
    }

    #[tokio::test]
    async fn test_custom_waveform_sees_every_v_once() {
        init_test_logging();
        let mut session = FakeSession::with_device(FakeDevice::new());
        let mut seen = Vec::new();
        let mut recorder = |v: u64, n: usize| {
            seen.push(v);
            vec![0.5f32; n]
        };
        let mut out = Vec::new();
        run_stream(
            &mut session,
            &config(2, false, Some(4)),
            &mut recorder,
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Called once per channel with the same v.
        assert_eq!(seen, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[tokio::test]
    async fn test_overflow_ignored_when_tolerant() {
        init_test_logging();
        let mut device = FakeDevice::new();
        device.overflow_on_read = Some(2);
        let mut session = FakeSession::with_device(device);
        let mut out = Vec::new();
        let report = run_stream(
            &mut session,
            &config(4, true, Some(4)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, StreamOutcome::Completed);
        assert_eq!(report.iterations, 4);
        assert_eq!(report.dropped_batches, 1);
        assert_eq!(report.ticks, 12);
        assert_eq!(session.devices[0].reads().len(), 4);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 12);
    }

    #[tokio::test]
    async fn test_overflow_on_third_read_halts_after_two_iterations() {
        init_test_logging();
        let mut device = FakeDevice::new();
        device.overflow_on_read = Some(3);
        let mut session = FakeSession::with_device(device);
        let mut out = Vec::new();
        let result = run_stream(
            &mut session,
            &config(4, false, None),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(SmuError::Dataflow(_))));
        assert_eq!(session.devices[0].reads().len(), 3);
        assert_eq!(session.devices[0].writes().len(), 6);
        // Only the two completed iterations produced output.
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 8);
        assert_eq!(session.cancels, 1);
    }

    #[tokio::test]
    async fn test_write_overflow_policy() {
        init_test_logging();
        let mut device = FakeDevice::new();
        device.overflow_on_write = Some(1);
        let mut session = FakeSession::with_device(device);
        let mut out = Vec::new();
        let result = run_stream(
            &mut session,
            &config(4, false, Some(3)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(SmuError::Dataflow(_))));
        assert!(session.devices[0].reads().is_empty());

        let mut device = FakeDevice::new();
        device.overflow_on_write = Some(1);
        let mut session = FakeSession::with_device(device);
        let mut out = Vec::new();
        let report = run_stream(
            &mut session,
            &config(4, true, Some(3)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.dropped_batches, 1);
        assert_eq!(report.iterations, 3);
        assert_eq!(session.devices[0].reads().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_no_iterations() {
        init_test_logging();
        let mut session = FakeSession::with_device(FakeDevice::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let report = run_stream(&mut session, &config(4, false, None), &mut StepWaveform::default(), &mut out, &cancel)
            .await
            .unwrap();

        assert_eq!(report.outcome, StreamOutcome::Cancelled);
        assert_eq!(report.iterations, 0);
        assert!(session.devices[0].calls.is_empty());
        assert_eq!(session.cancels, 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_read() {
        init_test_logging();
        let mut device = FakeDevice::new();
        device.stall_reads = true;
        let mut session = FakeSession::with_device(device);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut out = Vec::new();
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            run_stream(&mut session, &config(4, false, None), &mut StepWaveform::default(), &mut out, &cancel),
        )
        .await
        .expect("cancellation did not interrupt the read")
        .unwrap();

        assert_eq!(report.outcome, StreamOutcome::Cancelled);
        assert_eq!(report.iterations, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_streams_against_simulated_device() {
        init_test_logging();
        use crate::sim::{SimConfig, SimSession};

        let mut session = SimSession::new(SimConfig::default());
        let mut out = Vec::new();
        let report = run_stream(
            &mut session,
            &config(256, false, Some(3)),
            &mut StepWaveform::default(),
            &mut out,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, StreamOutcome::Completed);
        assert_eq!(report.ticks, 768);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 768);
        for line in text.lines() {
            let fields: Vec<f32> = line.split_whitespace().map(|f| f.parse().unwrap()).collect();
            assert_eq!(fields.len(), 4);
            // Measurements trail the writes, so any step value written so far may show up.
            assert!((0.0..=2.0).contains(&fields[0]), "line: {}", line);
            assert!((0.0..=2.0).contains(&fields[2]), "line: {}", line);
        }
        assert!(!session.devices()[0].is_streaming());
    }
}

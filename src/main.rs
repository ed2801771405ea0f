use std::io::{BufWriter, IsTerminal, Write};

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use smu_stream::{
    run_stream, Mode, OutputStyle, RandomStep, SimConfig, SimSession, Sine, SmuError, StepWaveform, StreamConfig,
    StreamOutcome, UniformNoise, Waveform,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WaveformKind {
    /// v mod 6, stepping once per batch
    Step,
    /// Random integer in 0..=5 per batch
    Random,
    /// Random value in [-0.2, 0.2] per batch
    Noise,
    /// 2.5 ± 2.5 sine at --frequency
    Sine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Svmi,
    Simv,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Svmi => Mode::Svmi,
            ModeArg::Simv => Mode::Simv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DataflowPolicy {
    /// Ignore when stdout is a terminal
    Auto,
    Always,
    Never,
}

impl DataflowPolicy {
    fn resolve(self, stdout_is_tty: bool) -> bool {
        match self {
            DataflowPolicy::Auto => stdout_is_tty,
            DataflowPolicy::Always => true,
            DataflowPolicy::Never => false,
        }
    }
}

/// Stream a waveform to a source/measure unit and print what it measures.
#[derive(Parser, Debug)]
#[command(name = "smu-stream", version)]
struct Args {
    /// Samples written and read per iteration
    #[arg(long, env = "SMU_NUM_SAMPLES", default_value_t = 1024)]
    num_samples: usize,

    #[arg(long, value_enum, default_value_t = WaveformKind::Step)]
    waveform: WaveformKind,

    #[arg(long, value_enum, default_value_t = ModeArg::Svmi)]
    mode: ModeArg,

    /// Whether dropped or late samples are tolerated
    #[arg(long, value_enum, default_value_t = DataflowPolicy::Auto)]
    ignore_dataflow: DataflowPolicy,

    /// Stop after this many iterations instead of running until Ctrl-C
    #[arg(long)]
    iterations: Option<u64>,

    /// Redraw a single line instead of printing one line per sample (terminal only)
    #[arg(long)]
    overwrite: bool,

    /// Number of simulated devices to attach
    #[arg(long, env = "SMU_DEVICES", default_value_t = 1)]
    devices: usize,

    #[arg(long, default_value_t = 100_000.0)]
    sample_rate: f64,

    #[arg(long, default_value_t = 256)]
    chunk_size: usize,

    /// Device-side buffer, in samples
    #[arg(long, default_value_t = 100_000)]
    queue_size: usize,

    /// Resistive load on each channel
    #[arg(long, default_value_t = 1000.0)]
    load_ohms: f32,

    /// Sine frequency in Hz
    #[arg(long, default_value_t = 1000.0)]
    frequency: f32,
}

fn build_waveform(args: &Args) -> Result<Box<dyn Waveform + Send>> {
    Ok(match args.waveform {
        WaveformKind::Step => Box::new(StepWaveform::default()),
        WaveformKind::Random => Box::new(RandomStep::default()),
        WaveformKind::Noise => Box::new(UniformNoise::default()),
        WaveformKind::Sine => Box::new(Sine::new(2.5, 2.5, args.frequency, args.sample_rate as f32, 0.0)?),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries samples, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("Starting smu-stream v{}", env!("CARGO_PKG_VERSION"));

    let stdout_is_tty = std::io::stdout().is_terminal();
    let style = if args.overwrite && stdout_is_tty {
        OutputStyle::Overwrite
    } else {
        OutputStyle::Lines
    };
    let config = StreamConfig::new(
        args.num_samples,
        args.mode.into(),
        args.ignore_dataflow.resolve(stdout_is_tty),
        style,
        args.iterations,
    )?;
    let sim_config = SimConfig::new(args.devices, args.sample_rate, args.chunk_size, args.queue_size, args.load_ohms)?;
    let mut waveform = build_waveform(&args)?;
    let mut session = SimSession::new(sim_config);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping stream");
                interrupt.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let result = run_stream(&mut session, &config, waveform.as_mut(), &mut out, &cancel).await;
    if style == OutputStyle::Overwrite {
        writeln!(out)?;
    }
    out.flush()?;

    match result {
        Ok(report) => {
            if report.outcome != StreamOutcome::NoDevice {
                info!(
                    "Stream finished: {} iterations, {} samples, {} dropped batches",
                    report.iterations, report.ticks, report.dropped_batches
                );
            }
            Ok(())
        }
        Err(SmuError::Dataflow(msg)) => {
            error!("sample(s) dropped: {}", msg);
            Err(anyhow!("sample(s) dropped: {}", msg))
        }
        Err(e) => {
            error!("Stream failed: {}", e);
            Err(e.into())
        }
    }
}

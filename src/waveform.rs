use anyhow::{anyhow, Result};
use rand::Rng;
use tracing::error;

/// Produces the output batch for one streaming iteration.
///
/// `v` is the iteration counter, starting at 0 and increasing by one per batch.
pub trait Waveform {
    fn refill(&mut self, v: u64, num_samples: usize) -> Vec<f32>;
}

impl<F> Waveform for F
where
    F: FnMut(u64, usize) -> Vec<f32>,
{
    fn refill(&mut self, v: u64, num_samples: usize) -> Vec<f32> {
        self(v, num_samples)
    }
}

/// Constant batch of `v mod modulus`: a repeating staircase of integer volts.
#[derive(Debug, Clone)]
pub struct StepWaveform {
    modulus: u64,
}

impl Default for StepWaveform {
    fn default() -> Self {
        Self { modulus: 6 }
    }
}

impl StepWaveform {
    pub fn new(modulus: u64) -> Result<Self> {
        if modulus == 0 {
            error!("step modulus must be greater than 0");
            return Err(anyhow!("step modulus must be greater than 0"));
        }
        Ok(Self { modulus })
    }
}

impl Waveform for StepWaveform {
    fn refill(&mut self, v: u64, num_samples: usize) -> Vec<f32> {
        vec![(v % self.modulus) as f32; num_samples]
    }
}

/// Constant batch of a random integer in `0..=max`, ignoring `v`.
#[derive(Debug, Clone)]
pub struct RandomStep {
    max: u32,
}

impl Default for RandomStep {
    fn default() -> Self {
        Self { max: 5 }
    }
}

impl RandomStep {
    pub fn new(max: u32) -> Self {
        Self { max }
    }
}

impl Waveform for RandomStep {
    fn refill(&mut self, _v: u64, num_samples: usize) -> Vec<f32> {
        let value = rand::thread_rng().gen_range(0..=self.max);
        vec![value as f32; num_samples]
    }
}

/// Constant batch of a random float in `[low, high]`, ignoring `v`.
#[derive(Debug, Clone)]
pub struct UniformNoise {
    low: f32,
    high: f32,
}

impl Default for UniformNoise {
    fn default() -> Self {
        Self { low: -0.2, high: 0.2 }
    }
}

impl UniformNoise {
    pub fn new(low: f32, high: f32) -> Result<Self> {
        if !(low <= high) {
            error!("noise range is empty: [{}, {}]", low, high);
            return Err(anyhow!("noise range is empty: [{}, {}]", low, high));
        }
        Ok(Self { low, high })
    }
}

impl Waveform for UniformNoise {
    fn refill(&mut self, _v: u64, num_samples: usize) -> Vec<f32> {
        let value = rand::thread_rng().gen_range(self.low..=self.high);
        vec![value; num_samples]
    }
}

/// Sine wave that stays phase-continuous across batches.
#[derive(Debug, Clone)]
pub struct Sine {
    amplitude: f32,   // peak, around offset
    offset: f32,      // V or A
    frequency: f32,   // Hz
    sample_rate: f32, // samples/s
    phase_offset: f32, // radians
}

impl Default for Sine {
    fn default() -> Self {
        Self {
            amplitude: 2.5,
            offset: 2.5,
            frequency: 1000.0,
            sample_rate: 100_000.0,
            phase_offset: 0.0,
        }
    }
}

impl Sine {
    pub fn new(amplitude: f32, offset: f32, frequency: f32, sample_rate: f32, phase_offset: f32) -> Result<Self> {
        if sample_rate < 1.0 {
            error!("sample_rate must be at least 1.0");
            return Err(anyhow!("sample_rate must be at least 1.0"));
        }
        if frequency < 0.0 {
            error!("frequency must not be negative");
            return Err(anyhow!("frequency must not be negative"));
        }
        if frequency > sample_rate / 2.0 {
            error!("frequency {} Hz is above Nyquist for {} samples/s", frequency, sample_rate);
            return Err(anyhow!("frequency {} Hz is above Nyquist for {} samples/s", frequency, sample_rate));
        }
        Ok(Self {
            amplitude,
            offset,
            frequency,
            sample_rate,
            phase_offset,
        })
    }
}

impl Waveform for Sine {
    fn refill(&mut self, v: u64, num_samples: usize) -> Vec<f32> {
        let sample_period = 1.0 / self.sample_rate as f64;
        let first = v * num_samples as u64;
        let mut samples = Vec::with_capacity(num_samples);
        for i in 0..num_samples as u64 {
            let t = (first + i) as f64 * sample_period;
            let phase = 2.0 * std::f64::consts::PI * self.frequency as f64 * t + self.phase_offset as f64;
            samples.push(self.offset + self.amplitude * phase.sin() as f32);
        }
        samples
    }
}

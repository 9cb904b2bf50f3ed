//! Synthetic signal device: deterministic multi-channel EEG-like generator
//! used for development, demos and the test suite.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use super::{monotonic_now, DeviceAdapter};
use crate::error::{EngineError, Result};
use crate::types::{DeviceDescriptor, DeviceState, SampleFrame, SelfTestReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Sine,
    Alpha,
    Beta,
    Theta,
    Delta,
    Erp,
    Ssvep,
    RealisticEeg,
}

impl SignalKind {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "sine" => Ok(SignalKind::Sine),
            "alpha" => Ok(SignalKind::Alpha),
            "beta" => Ok(SignalKind::Beta),
            "theta" => Ok(SignalKind::Theta),
            "delta" => Ok(SignalKind::Delta),
            "erp" => Ok(SignalKind::Erp),
            "ssvep" => Ok(SignalKind::Ssvep),
            "realistic_eeg" => Ok(SignalKind::RealisticEeg),
            other => Err(EngineError::BadParameter(format!(
                "unknown signal type {other}"
            ))),
        }
    }

    /// Center frequency of the band-limited kinds.
    fn band(&self) -> Option<(f64, f64)> {
        match self {
            SignalKind::Alpha => Some((8.0, 13.0)),
            SignalKind::Beta => Some((13.0, 30.0)),
            SignalKind::Theta => Some((4.0, 8.0)),
            SignalKind::Delta => Some((0.5, 4.0)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SyntheticSettings {
    pub kind: SignalKind,
    pub frequency_hz: f64,
    pub amplitude_uv: f64,
    pub noise_rms_uv: f64,
    pub blink_probability: f64,
    pub muscle_probability: f64,
    pub pop_probability: f64,
    pub seed: u64,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            kind: SignalKind::RealisticEeg,
            frequency_hz: 10.0,
            amplitude_uv: 30.0,
            noise_rms_uv: 2.0,
            blink_probability: 0.0005,
            muscle_probability: 0.0002,
            pop_probability: 0.0001,
            seed: 0xBC1,
        }
    }
}

/// Per-channel transient state: a decaying artifact envelope.
#[derive(Clone, Copy, Default)]
struct Transient {
    remaining: usize,
    total: usize,
    kind: TransientKind,
}

#[derive(Clone, Copy, Default, PartialEq)]
enum TransientKind {
    #[default]
    None,
    Blink,
    Muscle,
    Pop,
}

/// Pure sample generator; separate from the adapter so tests can pull
/// samples without threads.
pub struct SignalGenerator {
    settings: SyntheticSettings,
    sampling_rate: f64,
    channels: usize,
    rng: StdRng,
    sample_clock: u64,
    pink_state: Vec<f64>,
    transients: Vec<Transient>,
}

impl SignalGenerator {
    pub fn new(settings: SyntheticSettings, sampling_rate: f64, channels: usize) -> Self {
        Self {
            settings,
            sampling_rate,
            channels,
            rng: StdRng::seed_from_u64(settings.seed),
            sample_clock: 0,
            pink_state: vec![0.0; channels],
            transients: vec![Transient::default(); channels],
        }
    }

    fn gaussian(&mut self) -> f64 {
        // Box-Muller.
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn base_sample(&mut self, t: f64, channel: usize) -> f64 {
        let amp = self.settings.amplitude_uv;
        let two_pi = 2.0 * std::f64::consts::PI;
        let phase = channel as f64 * 0.1;
        match self.settings.kind {
            SignalKind::Sine => amp * (two_pi * self.settings.frequency_hz * t + phase).sin(),
            SignalKind::Ssvep => {
                let f = self.settings.frequency_hz;
                amp * (two_pi * f * t + phase).sin()
                    + 0.4 * amp * (two_pi * 2.0 * f * t + phase).sin()
            }
            SignalKind::Alpha | SignalKind::Beta | SignalKind::Theta | SignalKind::Delta => {
                let (lo, hi) = self.settings.kind.band().unwrap_or((8.0, 13.0));
                let center = (lo + hi) / 2.0;
                let spread = (hi - lo) / 4.0;
                (amp / 3.0)
                    * ((two_pi * (center - spread) * t + phase).sin()
                        + (two_pi * center * t + phase * 2.0).sin()
                        + (two_pi * (center + spread) * t + phase * 3.0).sin())
            }
            SignalKind::Erp => {
                // P300: positive bump in the 300–400 ms window of each epoch.
                let epoch_t = t.fract();
                let bump = if (0.3..0.4).contains(&epoch_t) {
                    let x = (epoch_t - 0.35) / 0.025;
                    amp * (-0.5 * x * x).exp()
                } else {
                    0.0
                };
                bump + 0.1 * amp * (two_pi * 10.0 * t + phase).sin()
            }
            SignalKind::RealisticEeg => {
                let f = self.settings.frequency_hz;
                let primary = amp * (two_pi * f * t + phase).sin();
                let harmonic = 0.3 * amp * (two_pi * 2.0 * f * t + phase).sin();
                // One-pole lowpass of white noise stands in for pink noise.
                let white = self.gaussian();
                self.pink_state[channel] = 0.98 * self.pink_state[channel] + 0.02 * white;
                let pink = 0.2 * amp * self.pink_state[channel] * 10.0;
                primary + harmonic + pink
            }
        }
    }

    fn transient_sample(&mut self, channel: usize) -> f64 {
        let amp = self.settings.amplitude_uv;
        // Possibly start a new transient.
        if self.transients[channel].kind == TransientKind::None {
            let roll: f64 = self.rng.gen();
            let fs = self.sampling_rate;
            if roll < self.settings.blink_probability {
                self.transients[channel] = Transient {
                    remaining: (0.3 * fs) as usize,
                    total: (0.3 * fs) as usize,
                    kind: TransientKind::Blink,
                };
            } else if roll < self.settings.blink_probability + self.settings.muscle_probability {
                self.transients[channel] = Transient {
                    remaining: (0.2 * fs) as usize,
                    total: (0.2 * fs) as usize,
                    kind: TransientKind::Muscle,
                };
            } else if roll
                < self.settings.blink_probability
                    + self.settings.muscle_probability
                    + self.settings.pop_probability
            {
                self.transients[channel] = Transient {
                    remaining: (0.05 * fs) as usize,
                    total: (0.05 * fs) as usize,
                    kind: TransientKind::Pop,
                };
            }
        }
        let state = self.transients[channel];
        if state.kind == TransientKind::None || state.total == 0 {
            return 0.0;
        }
        let progress = 1.0 - state.remaining as f64 / state.total as f64;
        let envelope = (std::f64::consts::PI * progress).sin();
        let value = match state.kind {
            TransientKind::Blink => 5.0 * amp * envelope,
            TransientKind::Muscle => {
                // Broadband 30–100 Hz burst.
                let t = self.sample_clock as f64 / self.sampling_rate;
                let carrier = (2.0 * std::f64::consts::PI * 65.0 * t).sin();
                2.0 * amp * envelope * (carrier + 0.5 * self.gaussian())
            }
            TransientKind::Pop => 10.0 * amp * (1.0 - progress),
            TransientKind::None => 0.0,
        };
        let next = state.remaining - 1;
        self.transients[channel].remaining = next;
        if next == 0 {
            self.transients[channel] = Transient::default();
        }
        value
    }

    /// Produces the next frame across all channels.
    pub fn next_frame(&mut self) -> Vec<f32> {
        let t = self.sample_clock as f64 / self.sampling_rate;
        let mut out = Vec::with_capacity(self.channels);
        for ch in 0..self.channels {
            let base = self.base_sample(t, ch);
            let noise = self.settings.noise_rms_uv * self.gaussian();
            let transient = self.transient_sample(ch);
            out.push((base + noise + transient) as f32);
        }
        self.sample_clock += 1;
        out
    }
}

pub struct SyntheticAdapter {
    descriptor: DeviceDescriptor,
    settings: SyntheticSettings,
    stop_flag: Arc<AtomicBool>,
    frames_emitted: Arc<AtomicU64>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl SyntheticAdapter {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                state: DeviceState::Disconnected,
                ..descriptor
            },
            settings: SyntheticSettings::default(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            frames_emitted: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn settings(&self) -> SyntheticSettings {
        self.settings
    }
}

impl DeviceAdapter for SyntheticAdapter {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn state(&self) -> DeviceState {
        self.descriptor.state
    }

    fn connect(&mut self) -> Result<()> {
        if self.descriptor.sampling_rate <= 0.0 || self.descriptor.channel_count == 0 {
            self.descriptor.state = DeviceState::Error;
            return Err(EngineError::BadParameter(
                "synthetic device needs positive rate and channels".into(),
            ));
        }
        self.descriptor.state = DeviceState::Connected;
        log::info!("synthetic {} connected", self.descriptor.device_id);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.descriptor.state == DeviceState::Streaming {
            self.stop_streaming()?;
        }
        self.descriptor.state = DeviceState::Disconnected;
        Ok(())
    }

    fn configure(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        for (key, value) in config {
            match key.as_str() {
                "signal_type" => {
                    let name = value.as_str().ok_or_else(|| {
                        EngineError::BadParameter("signal_type must be a string".into())
                    })?;
                    self.settings.kind = SignalKind::parse(name)?;
                }
                "frequency" => {
                    self.settings.frequency_hz = value.as_f64().ok_or_else(|| {
                        EngineError::BadParameter("frequency must be a number".into())
                    })?;
                }
                "amplitude" => {
                    self.settings.amplitude_uv = value.as_f64().ok_or_else(|| {
                        EngineError::BadParameter("amplitude must be a number".into())
                    })?;
                }
                "noise_rms" => {
                    self.settings.noise_rms_uv = value.as_f64().ok_or_else(|| {
                        EngineError::BadParameter("noise_rms must be a number".into())
                    })?;
                }
                "blink_probability" => {
                    self.settings.blink_probability = value.as_f64().unwrap_or(0.0);
                }
                "muscle_probability" => {
                    self.settings.muscle_probability = value.as_f64().unwrap_or(0.0);
                }
                "pop_probability" => {
                    self.settings.pop_probability = value.as_f64().unwrap_or(0.0);
                }
                "seed" => {
                    self.settings.seed = value.as_u64().unwrap_or(0xBC1);
                }
                "sampling_rate" => {
                    let rate = value.as_f64().ok_or_else(|| {
                        EngineError::BadParameter("sampling_rate must be a number".into())
                    })?;
                    if rate <= 0.0 {
                        return Err(EngineError::BadParameter(
                            "sampling_rate must be positive".into(),
                        ));
                    }
                    self.descriptor.sampling_rate = rate as f32;
                }
                "channels" => {
                    let count = value.as_u64().ok_or_else(|| {
                        EngineError::BadParameter("channels must be a count".into())
                    })? as usize;
                    if count == 0 {
                        return Err(EngineError::BadParameter(
                            "channels must be positive".into(),
                        ));
                    }
                    self.descriptor.channel_count = count;
                }
                "buffer_size" => {}
                _ => {
                    return Err(EngineError::BadParameter(format!(
                        "unrecognized synthetic option {key}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn start_streaming(&mut self, sink: Sender<SampleFrame>) -> Result<()> {
        match self.descriptor.state {
            DeviceState::Streaming => return Ok(()),
            DeviceState::Connected => {}
            _ => {
                return Err(EngineError::NotConnected(
                    self.descriptor.device_id.clone(),
                ))
            }
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.frames_emitted.store(0, Ordering::SeqCst);
        let stop_flag = Arc::clone(&self.stop_flag);
        let emitted = Arc::clone(&self.frames_emitted);
        let mut generator = SignalGenerator::new(
            self.settings,
            self.descriptor.sampling_rate as f64,
            self.descriptor.channel_count,
        );
        let fs = self.descriptor.sampling_rate as f64;

        self.worker = Some(std::thread::spawn(move || {
            // Emit in 10 ms batches to keep pacing smooth.
            let batch = ((fs / 100.0).ceil() as usize).max(1);
            let batch_period = Duration::from_secs_f64(batch as f64 / fs);
            let mut counter: u32 = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                let started = std::time::Instant::now();
                for _ in 0..batch {
                    counter = counter.wrapping_add(1);
                    let frame = SampleFrame {
                        timestamp: monotonic_now(),
                        channels: generator.next_frame(),
                        sample_index: counter,
                        aux: None,
                        marker: None,
                    };
                    if sink.send(frame).is_err() {
                        return;
                    }
                    emitted.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(rest) = batch_period.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
        }));
        self.descriptor.state = DeviceState::Streaming;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        if self.descriptor.state != DeviceState::Streaming {
            return Ok(());
        }
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.descriptor.state = DeviceState::Connected;
        Ok(())
    }

    fn read_impedance(&mut self) -> Result<BTreeMap<String, f32>> {
        if !matches!(
            self.descriptor.state,
            DeviceState::Connected | DeviceState::Streaming
        ) {
            return Err(EngineError::NotConnected(
                self.descriptor.device_id.clone(),
            ));
        }
        // The simulated electrodes have stable, plausible impedances.
        let mut out = BTreeMap::new();
        for ch in 0..self.descriptor.channel_count {
            out.insert(format!("Ch{}", ch + 1), 15.0 + (ch % 10) as f32 * 2.0);
        }
        Ok(out)
    }

    fn self_test(&mut self) -> Result<SelfTestReport> {
        let mut report = SelfTestReport::new();
        let connected = matches!(
            self.descriptor.state,
            DeviceState::Connected | DeviceState::Streaming
        );
        report.record(
            "generator",
            connected,
            if connected {
                "generator ready"
            } else {
                "generator offline"
            },
        );
        if self.descriptor.state == DeviceState::Streaming {
            let before = self.frames_emitted.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(50));
            let after = self.frames_emitted.load(Ordering::Relaxed);
            report.record(
                "data_streaming",
                after > before,
                format!("{} frames in the observation window", after - before),
            );
        }
        Ok(report)
    }
}

impl Drop for SyntheticAdapter {
    fn drop(&mut self) {
        let _ = self.stop_streaming();
    }
}

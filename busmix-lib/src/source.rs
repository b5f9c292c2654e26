//! Behavioral-layer input: per-frame voice parameters and sample sources.

use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

use crate::audio::{AudioBuffer, BufferState, ChannelConfig};
use crate::graph::{BusContext, ConnectionType};
use crate::ids::ListenerId;

/// One emitter-to-listener path computed by the behavioral layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ray {
    pub listener: ListenerId,
    pub dry: f32,
    pub game_aux: f32,
    pub user_aux: f32,
    /// Radians; 0 is straight ahead, positive to the right.
    pub azimuth: f32,
    pub elevation: f32,
    /// 0 collapses multichannel sources to a point, 1 spreads them fully.
    pub spread: f32,
}

impl Default for Ray {
    fn default() -> Self {
        Self {
            listener: ListenerId(0),
            dry: 1.0,
            game_aux: 1.0,
            user_aux: 1.0,
            azimuth: 0.0,
            elevation: 0.0,
            spread: 0.0,
        }
    }
}

/// How a voice is positioned in the output layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Spatialization {
    /// Pan in `[-1, 1]`, left to right.
    TwoD { pan: f32 },
    /// Position taken from the rays.
    ThreeD,
}

impl Default for Spatialization {
    fn default() -> Self {
        Spatialization::TwoD { pan: 0.0 }
    }
}

/// An auxiliary send requested by the behavioral layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuxSend {
    pub bus: BusContext,
    #[serde(default)]
    pub listener: ListenerId,
    /// Linear control value.
    pub level: f32,
    #[serde(default = "game_send")]
    pub kind: ConnectionType,
    #[serde(default)]
    pub lpf: f32,
    #[serde(default)]
    pub hpf: f32,
}

fn game_send() -> ConnectionType {
    ConnectionType::GameDefinedSend
}

/// Per-frame parameters of one voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceFrameParams {
    /// Listener-independent volume (linear).
    pub volume: f32,
    pub output_bus: Option<BusContext>,
    pub listener: ListenerId,
    /// Control value of the dry route (linear).
    pub output_bus_volume: f32,
    pub output_bus_lpf: f32,
    pub output_bus_hpf: f32,
    pub aux_sends: Vec<AuxSend>,
    pub rays: Vec<Ray>,
    /// Loudness envelope of the source material (dB), reported to HDR buses.
    pub envelope_db: f32,
    pub spatialization: Spatialization,
    pub forced_virtual: bool,
    pub start_with_fade_in: bool,
}

impl Default for SourceFrameParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            output_bus: None,
            listener: ListenerId(0),
            output_bus_volume: 1.0,
            output_bus_lpf: 0.0,
            output_bus_hpf: 0.0,
            aux_sends: Vec::new(),
            rays: Vec::new(),
            envelope_db: 0.0,
            spatialization: Spatialization::default(),
            forced_virtual: false,
            start_with_fade_in: false,
        }
    }
}

impl SourceFrameParams {
    pub fn routed_to(bus: BusContext) -> Self {
        Self {
            output_bus: Some(bus),
            ..Self::default()
        }
    }
}

/// Produces one voice's samples, one frame at a time.
pub trait VoiceSource: Send {
    fn channel_config(&self) -> ChannelConfig;

    /// Fill `buffer`, set its valid frame count and report its state.
    fn render(&mut self, buffer: &mut AudioBuffer);

    /// Called instead of `render` while the voice is inaudible.
    fn skip(&mut self, _frames: usize) {}

    /// No samples are left to render or skip.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Sine oscillator, optionally limited to a number of frames.
#[derive(Debug, Clone)]
pub struct SineSource {
    config: ChannelConfig,
    frequency: f32,
    amplitude: f32,
    sample_rate: u32,
    phase: f32,
    remaining: Option<usize>,
}

impl SineSource {
    pub fn new(config: ChannelConfig, frequency: f32, amplitude: f32, sample_rate: u32) -> Self {
        Self {
            config,
            frequency: if frequency.is_finite() { frequency.abs() } else { 440.0 },
            amplitude: if amplitude.is_finite() { amplitude } else { 0.0 },
            sample_rate: sample_rate.max(1),
            phase: 0.0,
            remaining: None,
        }
    }

    /// Stop after `frames` sample frames.
    pub fn with_length(mut self, frames: usize) -> Self {
        self.remaining = Some(frames);
        self
    }

    fn advance_phase(&mut self, frames: usize) {
        let increment = TAU * self.frequency / self.sample_rate as f32;
        self.phase = (self.phase + increment * frames as f32) % TAU;
    }
}

impl VoiceSource for SineSource {
    fn channel_config(&self) -> ChannelConfig {
        self.config
    }

    fn render(&mut self, buffer: &mut AudioBuffer) {
        let frames = match self.remaining {
            Some(left) => left.min(buffer.max_frames()),
            None => buffer.max_frames(),
        };
        let increment = TAU * self.frequency / self.sample_rate as f32;
        for ch in 0..buffer.num_channels() {
            let mut phase = self.phase;
            let channel = buffer.channel_mut(ch);
            for sample in channel[..frames].iter_mut() {
                *sample = phase.sin() * self.amplitude;
                phase += increment;
            }
            channel[frames..].fill(0.0);
        }
        self.advance_phase(frames);
        buffer.set_valid_frames(frames);
        finish_frame(buffer, &mut self.remaining, frames);
    }

    fn skip(&mut self, frames: usize) {
        self.advance_phase(frames);
        if let Some(left) = self.remaining.as_mut() {
            *left = left.saturating_sub(frames);
        }
    }

    fn is_finished(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// DC source, mostly useful for checking gains.
#[derive(Debug, Clone)]
pub struct ConstantSource {
    config: ChannelConfig,
    value: f32,
    remaining: Option<usize>,
}

impl ConstantSource {
    pub fn new(config: ChannelConfig, value: f32) -> Self {
        Self {
            config,
            value,
            remaining: None,
        }
    }

    pub fn with_length(mut self, frames: usize) -> Self {
        self.remaining = Some(frames);
        self
    }
}

impl VoiceSource for ConstantSource {
    fn channel_config(&self) -> ChannelConfig {
        self.config
    }

    fn render(&mut self, buffer: &mut AudioBuffer) {
        let frames = match self.remaining {
            Some(left) => left.min(buffer.max_frames()),
            None => buffer.max_frames(),
        };
        for ch in 0..buffer.num_channels() {
            let channel = buffer.channel_mut(ch);
            channel[..frames].fill(self.value);
            channel[frames..].fill(0.0);
        }
        buffer.set_valid_frames(frames);
        finish_frame(buffer, &mut self.remaining, frames);
    }

    fn skip(&mut self, frames: usize) {
        if let Some(left) = self.remaining.as_mut() {
            *left = left.saturating_sub(frames);
        }
    }

    fn is_finished(&self) -> bool {
        self.remaining == Some(0)
    }
}

fn finish_frame(buffer: &mut AudioBuffer, remaining: &mut Option<usize>, frames: usize) {
    let state = match remaining.as_mut() {
        Some(left) => {
            *left -= frames;
            if *left == 0 {
                BufferState::NoMoreData
            } else {
                BufferState::DataReady
            }
        }
        None => BufferState::DataReady,
    };
    buffer.set_state(state);
}

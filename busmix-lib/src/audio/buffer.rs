//! Planar per-frame audio buffers.

use super::channels::ChannelConfig;
use crate::dsp::ramp::VolumeRamp;
use crate::error::{try_reserve, Result};

/// What a producer has to say about the frame it just filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    /// The producer finished; `valid_frames` may be short.
    NoMoreData,
    /// The frame holds fresh data.
    DataReady,
    /// Nothing was produced this frame.
    #[default]
    NoDataReady,
}

/// One frame of planar audio: `channels × max_frames` samples.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    data: Vec<f32>,
    config: ChannelConfig,
    max_frames: usize,
    valid_frames: usize,
    state: BufferState,
}

impl AudioBuffer {
    /// Allocate a zeroed buffer, reporting allocation failure.
    pub fn try_new(config: ChannelConfig, max_frames: usize) -> Result<Self> {
        let mut data = Vec::new();
        try_reserve(&mut data, config.channels() * max_frames, "audio buffer")?;
        data.resize(config.channels() * max_frames, 0.0);
        Ok(Self {
            data,
            config,
            max_frames,
            valid_frames: 0,
            state: BufferState::NoDataReady,
        })
    }

    /// Change the layout, reallocating only when the sample count grows.
    pub fn reconfigure(&mut self, config: ChannelConfig, max_frames: usize) -> Result<()> {
        let needed = config.channels() * max_frames;
        if needed > self.data.len() {
            let extra = needed - self.data.len();
            try_reserve(&mut self.data, extra, "audio buffer")?;
        }
        self.data.resize(needed, 0.0);
        self.config = config;
        self.max_frames = max_frames;
        self.clear();
        Ok(())
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    pub fn num_channels(&self) -> usize {
        self.config.channels()
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn valid_frames(&self) -> usize {
        self.valid_frames
    }

    pub fn set_valid_frames(&mut self, frames: usize) {
        self.valid_frames = frames.min(self.max_frames);
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn set_state(&mut self, state: BufferState) {
        self.state = state;
    }

    /// True when the producer delivered samples this frame.
    pub fn has_data(&self) -> bool {
        self.state != BufferState::NoDataReady && self.valid_frames > 0
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn channel(&self, channel: usize) -> &[f32] {
        let start = channel * self.max_frames;
        self.data.get(start..start + self.max_frames).unwrap_or(&[])
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        let start = channel * self.max_frames;
        let end = start + self.max_frames;
        self.data.get_mut(start..end).unwrap_or(&mut [])
    }

    /// Zero all samples and forget the previous frame.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.valid_frames = 0;
        self.state = BufferState::NoDataReady;
    }

    /// Zero the samples past `valid_frames` and mark the frame full.
    pub fn zero_pad(&mut self) {
        if self.valid_frames >= self.max_frames {
            return;
        }
        let valid = self.valid_frames;
        for ch in 0..self.num_channels() {
            self.channel_mut(ch)[valid..].fill(0.0);
        }
        self.valid_frames = self.max_frames;
    }

    /// Copy samples and state from a buffer with the same layout.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        let len = self.data.len().min(other.data.len());
        self.data[..len].copy_from_slice(&other.data[..len]);
        self.valid_frames = other.valid_frames.min(self.max_frames);
        self.state = other.state;
    }

    /// Apply a two-point gain ramp across the valid frames.
    pub fn apply_gain_ramp(&mut self, ramp: VolumeRamp) {
        if ramp.prev == 1.0 && ramp.next == 1.0 {
            return;
        }
        let frames = self.max_frames;
        let step = ramp.step(frames);
        for ch in 0..self.num_channels() {
            let mut gain = ramp.prev;
            for sample in self.channel_mut(ch).iter_mut() {
                *sample *= gain;
                gain += step;
            }
        }
    }

    pub fn channel_peak(&self, channel: usize) -> f32 {
        self.channel(channel)
            .iter()
            .fold(0.0_f32, |acc, sample| acc.max(sample.abs()))
    }

    pub fn peak(&self) -> f32 {
        (0..self.num_channels())
            .map(|ch| self.channel_peak(ch))
            .fold(0.0_f32, f32::max)
    }

    /// Interleave the valid frames into `out`, returning the samples written.
    pub fn write_interleaved(&self, out: &mut [f32]) -> usize {
        let channels = self.num_channels();
        if channels == 0 {
            return 0;
        }
        let frames = self.valid_frames.min(out.len() / channels);
        for frame in 0..frames {
            for ch in 0..channels {
                out[frame * channels + ch] = self.data[ch * self.max_frames + frame];
            }
        }
        frames * channels
    }
}

//! Output sinks: the endpoint a device hands its final buffer to.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::audio::{AudioBuffer, ChannelConfig};
use crate::dsp::ramp::GainRamp;
use crate::error::SinkError;
use crate::settings::DeviceSettings;

/// What a sink wants this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataNeeded {
    /// Number of frame blocks to render; 0 is valid.
    Frames(u32),
    /// The endpoint is gone; the device must stop talking to it.
    Fail,
}

/// Stream format a sink is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFormat {
    pub config: ChannelConfig,
    pub sample_rate: u32,
    pub frame_length: usize,
}

pub trait Sink {
    fn name(&self) -> &str;

    fn is_data_needed(&mut self) -> DataNeeded;

    /// Take one rendered block with the device's master-volume ramp.
    fn consume(&mut self, buffer: &AudioBuffer, ramp: GainRamp);

    fn on_frame_end(&mut self) {}

    fn reset(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn term(&mut self) {}

    fn is_dummy(&self) -> bool {
        false
    }
}

/// Opens sinks for devices.
pub trait SinkFactory {
    fn create_sink(
        &mut self,
        device: &DeviceSettings,
        format: SinkFormat,
    ) -> Result<Box<dyn Sink>, SinkError>;
}

/// Sink that discards everything and never asks for data.
#[derive(Debug, Clone, Default)]
pub struct DummySink {
    consumed: u64,
}

impl DummySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Sink for DummySink {
    fn name(&self) -> &str {
        "dummy"
    }

    fn is_data_needed(&mut self) -> DataNeeded {
        DataNeeded::Frames(0)
    }

    fn consume(&mut self, _buffer: &AudioBuffer, _ramp: GainRamp) {
        self.consumed += 1;
    }

    fn is_dummy(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct BufferSinkState {
    blocks_per_tick: u32,
    fail: bool,
    failure_reported: bool,
    calls_after_failure: u64,
    channels: usize,
    samples: Vec<f32>,
    consumed: u64,
    frame_ends: u64,
    resets: u64,
    terminated: bool,
}

impl BufferSinkState {
    fn note_call(&mut self) {
        if self.failure_reported {
            self.calls_after_failure += 1;
        }
    }
}

/// Shared view of a [`BufferSink`], kept by tests and offline renderers.
#[derive(Debug, Clone, Default)]
pub struct BufferSinkHandle(Arc<Mutex<BufferSinkState>>);

impl BufferSinkHandle {
    pub fn set_blocks_per_tick(&self, blocks: u32) {
        self.0.lock().blocks_per_tick = blocks;
    }

    /// Make the sink report [`DataNeeded::Fail`] from now on.
    pub fn fail(&self) {
        self.0.lock().fail = true;
    }

    /// Interleaved samples received so far, master volume applied.
    pub fn samples(&self) -> Vec<f32> {
        self.0.lock().samples.clone()
    }

    pub fn take_samples(&self) -> Vec<f32> {
        std::mem::take(&mut self.0.lock().samples)
    }

    pub fn channels(&self) -> usize {
        self.0.lock().channels
    }

    pub fn consumed(&self) -> u64 {
        self.0.lock().consumed
    }

    pub fn frame_ends(&self) -> u64 {
        self.0.lock().frame_ends
    }

    pub fn resets(&self) -> u64 {
        self.0.lock().resets
    }

    pub fn is_terminated(&self) -> bool {
        self.0.lock().terminated
    }

    /// Calls made after the sink reported a failure.
    pub fn calls_after_failure(&self) -> u64 {
        self.0.lock().calls_after_failure
    }
}

/// In-memory sink for tests and offline rendering.
#[derive(Debug)]
pub struct BufferSink {
    name: String,
    handle: BufferSinkHandle,
}

impl BufferSink {
    pub fn new(name: impl Into<String>, channels: usize, blocks_per_tick: u32) -> (Self, BufferSinkHandle) {
        let handle = BufferSinkHandle::default();
        {
            let mut state = handle.0.lock();
            state.channels = channels;
            state.blocks_per_tick = blocks_per_tick;
        }
        (
            Self {
                name: name.into(),
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl Sink for BufferSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_data_needed(&mut self) -> DataNeeded {
        let mut state = self.handle.0.lock();
        state.note_call();
        if state.fail {
            state.failure_reported = true;
            return DataNeeded::Fail;
        }
        DataNeeded::Frames(state.blocks_per_tick)
    }

    fn consume(&mut self, buffer: &AudioBuffer, ramp: GainRamp) {
        let mut state = self.handle.0.lock();
        state.note_call();
        state.consumed += 1;
        let channels = buffer.num_channels();
        let frames = buffer.max_frames();
        state.samples.reserve(frames * channels);
        for frame in 0..frames {
            let gain = ramp.at(frame, frames);
            for ch in 0..channels {
                let sample = buffer.channel(ch)[frame];
                state.samples.push(sample * gain);
            }
        }
    }

    fn on_frame_end(&mut self) {
        let mut state = self.handle.0.lock();
        state.note_call();
        state.frame_ends += 1;
    }

    fn reset(&mut self) -> Result<(), SinkError> {
        let mut state = self.handle.0.lock();
        state.note_call();
        if state.fail {
            return Err(SinkError::Runtime(format!("{} is failing", self.name)));
        }
        state.resets += 1;
        Ok(())
    }

    fn term(&mut self) {
        let mut state = self.handle.0.lock();
        state.note_call();
        state.terminated = true;
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    unavailable: bool,
    attempts: u64,
    blocks_per_tick: u32,
    created: Vec<(String, BufferSinkHandle)>,
}

/// Factory of [`BufferSink`]s; clones share the same registry of handles.
#[derive(Debug, Clone)]
pub struct BufferSinkFactory(Arc<Mutex<FactoryState>>);

impl Default for BufferSinkFactory {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BufferSinkFactory {
    pub fn new(blocks_per_tick: u32) -> Self {
        Self(Arc::new(Mutex::new(FactoryState {
            blocks_per_tick,
            ..FactoryState::default()
        })))
    }

    /// Make every following creation fail with [`SinkError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.0.lock().unavailable = unavailable;
    }

    pub fn attempts(&self) -> u64 {
        self.0.lock().attempts
    }

    /// Most recent sink created for the device named `name`.
    pub fn handle(&self, name: &str) -> Option<BufferSinkHandle> {
        self.0
            .lock()
            .created
            .iter()
            .rev()
            .find(|(device, _)| device == name)
            .map(|(_, handle)| handle.clone())
    }

    pub fn created(&self) -> usize {
        self.0.lock().created.len()
    }
}

impl SinkFactory for BufferSinkFactory {
    fn create_sink(
        &mut self,
        device: &DeviceSettings,
        format: SinkFormat,
    ) -> Result<Box<dyn Sink>, SinkError> {
        let mut state = self.0.lock();
        state.attempts += 1;
        if state.unavailable {
            return Err(SinkError::Unavailable(device.name.clone()));
        }
        let (sink, handle) = BufferSink::new(
            device.name.clone(),
            format.config.channels(),
            state.blocks_per_tick,
        );
        state.created.push((device.name.clone(), handle));
        Ok(Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BufferState;
    use crate::dsp::ramp::VolumeRamp;

    fn block(value: f32) -> AudioBuffer {
        let mut buffer = AudioBuffer::try_new(ChannelConfig::stereo(), 4).expect("allocate");
        buffer.channel_mut(0).fill(value);
        buffer.channel_mut(1).fill(-value);
        buffer.set_valid_frames(4);
        buffer.set_state(BufferState::DataReady);
        buffer
    }

    #[test]
    fn buffer_sink_interleaves_with_the_ramp() {
        let (mut sink, handle) = BufferSink::new("test", 2, 1);
        sink.consume(&block(1.0), VolumeRamp::new(1.0, 0.0));
        let samples = handle.samples();
        assert_eq!(samples.len(), 8);
        assert_eq!(&samples[..2], &[1.0, -1.0]);
        assert!((samples[2] - 0.75).abs() < 1e-6);
        assert_eq!(handle.consumed(), 1);
    }

    #[test]
    fn failing_sinks_count_later_calls() {
        let (mut sink, handle) = BufferSink::new("test", 2, 3);
        assert_eq!(sink.is_data_needed(), DataNeeded::Frames(3));
        handle.fail();
        assert_eq!(sink.is_data_needed(), DataNeeded::Fail);
        assert_eq!(handle.calls_after_failure(), 0);
        sink.on_frame_end();
        assert_eq!(handle.calls_after_failure(), 1);
    }

    #[test]
    fn factory_tracks_handles_and_availability() {
        let mut factory = BufferSinkFactory::new(2);
        let format = SinkFormat {
            config: ChannelConfig::stereo(),
            sample_rate: 48_000,
            frame_length: 4,
        };
        let device = DeviceSettings::default();
        assert!(factory.create_sink(&device, format).is_ok());
        assert!(factory.handle("main").is_some());

        factory.set_unavailable(true);
        let err = factory.create_sink(&device, format).err();
        assert_eq!(err, Some(SinkError::Unavailable("main".into())));
        assert_eq!(factory.attempts(), 2);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn dummy_sinks_need_nothing() {
        let mut sink = DummySink::new();
        assert_eq!(sink.is_data_needed(), DataNeeded::Frames(0));
        assert!(sink.is_dummy());
    }
}

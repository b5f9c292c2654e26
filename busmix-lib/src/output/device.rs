//! One output device: a sink, its state and master volume.

use serde::Serialize;
use std::collections::BTreeSet;

use super::capture::{write_with_ramp, CaptureSink};
use super::sink::{DataNeeded, DummySink, Sink};
use crate::audio::AudioBuffer;
use crate::dsp::level::db_to_linear;
use crate::dsp::ramp::VolumeRamp;
use crate::error::SinkError;
use crate::ids::{DeviceId, ListenerId, SharesetId};
use crate::settings::DeviceSettings;
use crate::spatial::SharedPanCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Configured to never open a real sink.
    ForcedDummy,
    Active,
    /// Running on a dummy until a real sink can be opened.
    ToActivate,
}

pub struct Device {
    id: DeviceId,
    settings: DeviceSettings,
    state: DeviceState,
    sink: Box<dyn Sink>,
    listeners: BTreeSet<ListenerId>,
    volume: VolumeRamp,
    capture: Option<Box<dyn CaptureSink>>,
    capture_scratch: AudioBuffer,
    pub(crate) pending_blocks: u32,
    pub(crate) idle_ticks: u32,
    blocks_sent: u64,
    failures: u32,
    pan_cache: SharedPanCache,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.settings.name)
            .field("state", &self.state)
            .field("sink", &self.sink.name())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        settings: DeviceSettings,
        state: DeviceState,
        sink: Box<dyn Sink>,
    ) -> Self {
        let volume = VolumeRamp::constant(db_to_linear(settings.volume_db));
        Self {
            id,
            listeners: settings.listeners.iter().copied().collect(),
            settings,
            state,
            sink,
            volume,
            capture: None,
            capture_scratch: AudioBuffer::default(),
            pending_blocks: 0,
            idle_ticks: 0,
            blocks_sent: 0,
            failures: 0,
            pan_cache: SharedPanCache::default(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn shareset(&self) -> SharesetId {
        self.settings.shareset
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    pub fn is_dummy(&self) -> bool {
        self.sink.is_dummy()
    }

    /// Listeners routed here; empty means every listener.
    pub fn listeners(&self) -> &BTreeSet<ListenerId> {
        &self.listeners
    }

    pub fn volume(&self) -> VolumeRamp {
        self.volume
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn pan_cache(&self) -> &SharedPanCache {
        &self.pan_cache
    }

    pub fn has_capture(&self) -> bool {
        self.capture.is_some()
    }

    /// True when both devices may hear the same listener.
    pub(crate) fn overlaps(&self, listeners: &[ListenerId]) -> bool {
        self.listeners.is_empty()
            || listeners.is_empty()
            || listeners.iter().any(|l| self.listeners.contains(l))
    }

    pub(crate) fn set_volume_db(&mut self, volume_db: f32) {
        self.volume.next = db_to_linear(volume_db);
        self.settings.volume_db = volume_db;
    }

    pub(crate) fn set_capture(&mut self, capture: Option<Box<dyn CaptureSink>>) {
        self.capture = capture;
    }

    pub(crate) fn poll(&mut self) -> DataNeeded {
        self.sink.is_data_needed()
    }

    /// Swap in a real sink.
    pub(crate) fn activate(&mut self, sink: Box<dyn Sink>) {
        log::info!("{} ({}): active on {}", self.id, self.settings.name, sink.name());
        self.sink = sink;
        self.state = DeviceState::Active;
        self.idle_ticks = 0;
    }

    /// Drop the current sink without calling it again and continue on a
    /// dummy until reactivation.
    pub(crate) fn fall_back_to_dummy(&mut self, reason: &str) {
        log::warn!(
            "{} ({}): {} ({}), switching to a dummy sink",
            self.id,
            self.settings.name,
            reason,
            self.sink.name()
        );
        self.sink = Box::new(DummySink::new());
        self.failures += 1;
        self.pending_blocks = 0;
        self.idle_ticks = 0;
        if self.state != DeviceState::ForcedDummy {
            self.state = DeviceState::ToActivate;
        }
    }

    /// Replace the sink with a dummy after a clean shutdown.
    pub(crate) fn terminate(&mut self) {
        self.sink.term();
        self.sink = Box::new(DummySink::new());
    }

    pub(crate) fn replace_sink(&mut self, settings: DeviceSettings, sink: Box<dyn Sink>, state: DeviceState) {
        self.sink.term();
        self.listeners = settings.listeners.iter().copied().collect();
        self.volume.next = db_to_linear(settings.volume_db);
        self.settings = settings;
        self.sink = sink;
        self.state = state;
        self.pending_blocks = 0;
        self.idle_ticks = 0;
    }

    /// Hand one block to the sink, then to the capture target.
    pub(crate) fn output(&mut self, buffer: &AudioBuffer) {
        self.sink.consume(buffer, self.volume);
        self.blocks_sent += 1;
        self.pending_blocks = self.pending_blocks.saturating_sub(1);

        if let Some(capture) = self.capture.as_deref_mut() {
            if let Err(err) = write_with_ramp(capture, buffer, self.volume, &mut self.capture_scratch) {
                log::warn!("{} ({}): capture disabled: {}", self.id, self.settings.name, err);
                self.capture = None;
            }
        }
    }

    pub(crate) fn reset_sink(&mut self) -> Result<(), SinkError> {
        self.sink.reset()
    }

    pub(crate) fn end_frame(&mut self) {
        self.sink.on_frame_end();
        self.volume.rotate();
    }
}

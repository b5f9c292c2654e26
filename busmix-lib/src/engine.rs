//! One engine instance: the mix graph plus the devices it renders to.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::graph::{BusContext, ConnectionType, GraphStats, MixGraph};
use crate::ids::{BusId, ConnectionId, DeviceId, NodeId, VoiceId};
use crate::output::{CaptureHandle, CaptureSink, DeviceState, OutputManager, SinkFactory};
use crate::plugin::PluginFactory;
use crate::settings::{BusSettings, DeviceSettings, EngineSettings};
use crate::source::{SourceFrameParams, VoiceSource};
use crate::spatial::{DefaultPanner, Panner};

/// State of one device after a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    pub id: DeviceId,
    pub name: String,
    pub state: DeviceState,
    pub sink: String,
    pub blocks_sent: u64,
    pub failures: u32,
    /// Per-channel peak of the device mix bus in the last rendered frame.
    pub peaks: Vec<f32>,
}

/// What one call to [`MixEngine::render_tick`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub blocks: u32,
    pub silent_mode: bool,
    pub graph: GraphStats,
    pub devices: Vec<DeviceReport>,
}

pub struct MixEngine {
    graph: MixGraph,
    outputs: OutputManager,
    ticks: u64,
    frames: u64,
    reinit_requested: bool,
}

impl std::fmt::Debug for MixEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixEngine")
            .field("graph", &self.graph)
            .field("outputs", &self.outputs)
            .field("ticks", &self.ticks)
            .finish()
    }
}

impl MixEngine {
    pub fn new(
        settings: EngineSettings,
        sinks: Box<dyn SinkFactory>,
        plugins: Arc<dyn PluginFactory>,
    ) -> Result<Self> {
        Self::with_panner(settings, sinks, plugins, Arc::new(DefaultPanner))
    }

    pub fn with_panner(
        settings: EngineSettings,
        sinks: Box<dyn SinkFactory>,
        plugins: Arc<dyn PluginFactory>,
        panner: Arc<dyn Panner>,
    ) -> Result<Self> {
        settings.validate()?;
        let settings = settings.sanitized();
        log::info!(
            "engine: {} Hz, {} frames per block",
            settings.sample_rate,
            settings.frame_length
        );
        Ok(Self {
            graph: MixGraph::new(settings.clone(), plugins, panner)?,
            outputs: OutputManager::new(settings, sinks),
            ticks: 0,
            frames: 0,
            reinit_requested: false,
        })
    }

    pub fn graph(&self) -> &MixGraph {
        &self.graph
    }

    pub fn outputs(&self) -> &OutputManager {
        &self.outputs
    }

    pub fn settings(&self) -> &EngineSettings {
        self.graph.settings()
    }

    /// Frames rendered since creation.
    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    /// Run one device tick and render as many frames as the devices need.
    pub fn render_tick(&mut self) -> TickReport {
        self.ticks += 1;
        let reinit = std::mem::take(&mut self.reinit_requested);
        self.outputs.manage_devices_state(reinit);
        let blocks = self.outputs.is_data_needed();
        for _ in 0..blocks {
            self.render_frame();
        }
        self.report(blocks)
    }

    fn render_frame(&mut self) {
        self.graph.run_frame();
        self.outputs.output_frame(&self.graph);
        self.outputs.on_frame_end();
        self.graph.end_frame();
        self.frames += 1;
        debug_assert!(
            self.graph.validate_topology().is_ok(),
            "topology broken after frame {}",
            self.frames
        );
    }

    fn report(&self, blocks: u32) -> TickReport {
        let devices = self
            .outputs
            .devices()
            .map(|device| DeviceReport {
                id: device.id(),
                name: device.name().to_string(),
                state: device.state(),
                sink: device.sink_name().to_string(),
                blocks_sent: device.blocks_sent(),
                failures: device.failures(),
                peaks: self
                    .graph
                    .device_bus(device.id())
                    .and_then(|bus| bus.meter())
                    .map(<[f32]>::to_vec)
                    .unwrap_or_default(),
            })
            .collect();
        TickReport {
            tick: self.ticks,
            blocks,
            silent_mode: self.outputs.is_silent_mode(),
            graph: self.graph.stats(),
            devices,
        }
    }

    /// Retry inactive devices on the next tick regardless of phase.
    pub fn request_device_reinit(&mut self) {
        self.reinit_requested = true;
    }

    /// Block until the silent-mode ticker fires. Returns false when not in
    /// silent mode or on timeout.
    pub fn wait_silent_tick(&self, timeout: Duration) -> bool {
        self.outputs.wait_silent_tick(timeout)
    }

    pub fn reset_devices(&mut self) {
        self.outputs.reset_devices();
    }

    pub fn term(&mut self) {
        self.outputs.term();
        log::info!("engine terminated after {} frames", self.frames);
    }

    // Devices

    pub fn init_main_device(&mut self, settings: DeviceSettings) -> Result<DeviceId> {
        self.outputs.init_main_device(settings, &mut self.graph)
    }

    pub fn add_output_device(&mut self, settings: DeviceSettings) -> Result<DeviceId> {
        self.outputs.add_output_device(settings, &mut self.graph)
    }

    pub fn remove_output_device(&mut self, id: DeviceId) -> Result<()> {
        self.outputs.remove_output_device(id, &mut self.graph)
    }

    pub fn replace_device(&mut self, id: DeviceId, settings: DeviceSettings) -> Result<()> {
        self.outputs.replace_device(id, settings, &mut self.graph)
    }

    pub fn set_device_volume(&mut self, id: DeviceId, volume_db: f32) -> Result<()> {
        self.outputs.set_device_volume(id, volume_db)
    }

    pub fn set_capture(&mut self, id: DeviceId, capture: Option<Box<dyn CaptureSink>>) -> Result<()> {
        self.outputs.set_capture(id, capture)
    }

    pub fn capture_handle(&self, id: DeviceId) -> Option<&CaptureHandle> {
        self.outputs.capture_handle(id)
    }

    // Buses

    pub fn register_bus(&mut self, settings: BusSettings) -> Result<BusId> {
        self.graph.register_bus(settings)
    }

    pub fn set_bus_volume(&mut self, bus: BusId, volume_db: f32) -> Result<()> {
        self.graph.set_bus_volume(bus, volume_db)
    }

    pub fn set_effect_bypass(&mut self, context: BusContext, slot: usize, bypass: bool) -> Result<()> {
        self.graph.set_effect_bypass(context, slot, bypass)
    }

    pub fn pause_bus(&mut self, context: BusContext, paused: bool) -> Result<()> {
        self.graph.pause_bus(context, paused)
    }

    pub fn set_custom_game_data(&mut self, context: BusContext, index: usize, data: Vec<u8>) -> Result<()> {
        self.graph.set_custom_game_data(context, index, data)
    }

    pub fn add_output_bus(
        &mut self,
        source: NodeId,
        to: BusContext,
        kind: ConnectionType,
        control: f32,
    ) -> Result<ConnectionId> {
        self.graph.add_output_bus(source, to, kind, control)
    }

    pub fn set_output_bus_volume(&mut self, id: ConnectionId, control: f32) -> Result<()> {
        self.graph.set_output_bus_volume(id, control)
    }

    pub fn remove_output_bus(&mut self, id: ConnectionId) -> Result<()> {
        self.graph.remove_output_bus(id)
    }

    // Voices

    pub fn add_voice(&mut self, source: Box<dyn VoiceSource>, params: SourceFrameParams) -> Result<VoiceId> {
        self.graph.add_voice(source, params)
    }

    pub fn set_voice_params(&mut self, id: VoiceId, params: SourceFrameParams) -> Result<()> {
        self.graph.set_voice_params(id, params)
    }

    pub fn stop_voice(&mut self, id: VoiceId) -> Result<()> {
        self.graph.stop_voice(id)
    }
}

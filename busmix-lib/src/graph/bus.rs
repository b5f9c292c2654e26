//! Bus nodes: accumulate inputs, run the insert chain, expose one result.

use serde::Serialize;
use std::cell::Cell;
use std::sync::Arc;

use super::connection::Connection;
use super::context::BusContext;
use super::hdr::HdrState;
use super::inputs::InputList;
use super::mixable::{Mixable, Route};
use crate::audio::{AudioBuffer, BufferState, ChannelConfig};
use crate::dsp::level::db_to_linear;
use crate::dsp::mix::mix_into;
use crate::error::{PluginError, Result};
use crate::ids::{BusId, BusNodeId, DeviceId};
use crate::plugin::{
    EffectIo, EffectPlugin, MixerInput, MixerPlugin, PluginContext, PluginFactory,
};
use crate::settings::{EffectSlotSettings, HdrSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Created, nothing received yet.
    Init,
    Play,
    /// Torn down; ignores input until destroyed.
    Stop,
    Pause,
    /// Temporarily producing nothing because its inputs are virtual or done.
    Idle,
}

/// Cached graph state answered to plugins.
pub(crate) struct BusHost {
    name: String,
    sample_rate: u32,
    downstream_gain: f32,
    parent_config: ChannelConfig,
    media: Vec<Vec<u8>>,
    game_data: Vec<Vec<u8>>,
    errors_posted: Cell<u32>,
}

impl PluginContext for BusHost {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn downstream_gain(&self) -> f32 {
        self.downstream_gain
    }

    fn parent_channel_config(&self) -> ChannelConfig {
        self.parent_config
    }

    fn media(&self, index: usize) -> Option<&[u8]> {
        self.media.get(index).map(Vec::as_slice)
    }

    fn custom_game_data(&self, index: usize) -> Option<&[u8]> {
        self.game_data.get(index).map(Vec::as_slice)
    }

    fn post_monitor_message(&self, message: &str) {
        log::debug!("[{}] {}", self.name, message);
    }

    fn post_error(&self, error: &PluginError) {
        self.errors_posted.set(self.errors_posted.get() + 1);
        log::error!("[{}] {}", self.name, error);
    }
}

struct EffectSlot {
    settings: EffectSlotSettings,
    effect: Option<Box<dyn EffectPlugin>>,
    buffer: Option<AudioBuffer>,
    disabled: bool,
}

struct MixerSlot {
    settings: EffectSlotSettings,
    plugin: Option<Box<dyn MixerPlugin>>,
    disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Accumulator,
    Slot(usize),
}

/// Everything needed to build a bus node.
pub(crate) struct BusNodeInit {
    pub id: BusNodeId,
    pub context: BusContext,
    pub name: String,
    pub config: ChannelConfig,
    pub parent_config: ChannelConfig,
    pub frame_length: usize,
    pub sample_rate: u32,
    pub frame_rate: f32,
    pub volume_db: f32,
    pub effects: Vec<EffectSlotSettings>,
    pub mixer: Option<EffectSlotSettings>,
    pub hdr: Option<HdrSettings>,
    pub metering: bool,
    pub keep_alive: bool,
    pub media: Vec<Vec<u8>>,
    pub factory: Arc<dyn PluginFactory>,
}

pub struct BusNode {
    id: BusNodeId,
    context: BusContext,
    pub(crate) mixable: Mixable,
    pub(crate) routes: Vec<Route>,
    config: ChannelConfig,
    output_config: ChannelConfig,
    frame_length: usize,
    volume_db: f32,
    accumulator: AudioBuffer,
    filter_scratch: AudioBuffer,
    mix_scratch: Vec<f32>,
    slots: Vec<EffectSlot>,
    mixer: Option<MixerSlot>,
    plugins_ready: bool,
    stage: Stage,
    state: NodeState,
    received_input: bool,
    produced: bool,
    processed: bool,
    keep_alive: bool,
    pub(crate) hdr: Option<HdrState>,
    pub(crate) hdr_target: Option<BusNodeId>,
    pub(crate) inputs: InputList,
    host: BusHost,
    metering: bool,
    meter: Vec<f32>,
    pub(crate) feedback: Option<AudioBuffer>,
    pub(crate) reaches_device: Option<DeviceId>,
    pub(crate) depth: usize,
    factory: Arc<dyn PluginFactory>,
}

impl std::fmt::Debug for BusNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusNode")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("state", &self.state)
            .field("config", &self.config)
            .field("inputs", &self.inputs.len())
            .field("connections", &self.mixable.connections().len())
            .finish()
    }
}

impl BusNode {
    pub(crate) fn new(init: BusNodeInit) -> Result<Self> {
        init.config.validate()?;
        let accumulator = AudioBuffer::try_new(init.config, init.frame_length)?;
        let slots = init
            .effects
            .into_iter()
            .map(|settings| EffectSlot {
                settings,
                effect: None,
                buffer: None,
                disabled: false,
            })
            .collect();
        let mixer = init.mixer.map(|settings| MixerSlot {
            settings,
            plugin: None,
            disabled: false,
        });
        Ok(Self {
            id: init.id,
            context: init.context,
            mixable: Mixable::default(),
            routes: Vec::new(),
            config: init.config,
            output_config: init.config,
            frame_length: init.frame_length,
            volume_db: init.volume_db,
            accumulator,
            filter_scratch: AudioBuffer::default(),
            mix_scratch: vec![0.0; init.frame_length],
            slots,
            mixer,
            plugins_ready: false,
            stage: Stage::Accumulator,
            state: NodeState::Init,
            received_input: false,
            produced: false,
            processed: false,
            keep_alive: init.keep_alive,
            hdr: init.hdr.map(|settings| HdrState::new(settings, init.frame_rate)),
            hdr_target: None,
            inputs: InputList::default(),
            host: BusHost {
                name: init.name,
                sample_rate: init.sample_rate,
                downstream_gain: 1.0,
                parent_config: init.parent_config,
                media: init.media,
                game_data: Vec::new(),
                errors_posted: Cell::new(0),
            },
            metering: init.metering,
            meter: vec![0.0; init.config.channels()],
            feedback: None,
            reaches_device: None,
            depth: 0,
            factory: init.factory,
        })
    }

    pub fn id(&self) -> BusNodeId {
        self.id
    }

    pub fn context(&self) -> BusContext {
        self.context
    }

    pub fn bus_id(&self) -> Option<BusId> {
        self.context.bus_id()
    }

    pub fn name(&self) -> &str {
        &self.host.name
    }

    pub fn is_device_bus(&self) -> bool {
        self.context.is_device()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Layout inputs are mixed into.
    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    /// Layout after the insert chain.
    pub fn output_config(&self) -> ChannelConfig {
        self.output_config
    }

    pub fn mixable(&self) -> &Mixable {
        &self.mixable
    }

    pub fn inputs(&self) -> &InputList {
        &self.inputs
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn hdr(&self) -> Option<&HdrState> {
        self.hdr.as_ref()
    }

    pub fn volume_db(&self) -> f32 {
        self.volume_db
    }

    pub fn reaches_device(&self) -> Option<DeviceId> {
        self.reaches_device
    }

    /// Per-channel peaks of the last processed frame, when metering is on.
    pub fn meter(&self) -> Option<&[f32]> {
        self.metering.then_some(self.meter.as_slice())
    }

    pub fn plugin_errors(&self) -> u32 {
        self.host.errors_posted.get()
    }

    pub(crate) fn set_volume_db(&mut self, volume_db: f32) {
        if volume_db.is_finite() {
            self.volume_db = volume_db;
        }
    }

    pub(crate) fn behavioral_volume(&self) -> f32 {
        db_to_linear(self.volume_db)
    }

    pub(crate) fn set_parent_config(&mut self, config: ChannelConfig) {
        if self.host.parent_config != config {
            self.host.parent_config = config;
            self.plugins_ready = false;
        }
    }

    pub(crate) fn set_downstream_gain_db(&mut self, downstream_db: f32) {
        self.host.downstream_gain = db_to_linear(downstream_db);
    }

    pub(crate) fn set_custom_game_data(&mut self, index: usize, data: Vec<u8>) {
        if self.host.game_data.len() <= index {
            self.host.game_data.resize(index + 1, Vec::new());
        }
        self.host.game_data[index] = data;
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        match (paused, self.state) {
            (true, NodeState::Stop) | (false, NodeState::Stop) => {}
            (true, _) => self.state = NodeState::Pause,
            (false, NodeState::Pause) => self.state = NodeState::Idle,
            (false, _) => {}
        }
    }

    pub(crate) fn stop(&mut self) {
        self.state = NodeState::Stop;
    }

    /// Toggle bypass on an effect slot; the chain is rebuilt on next use.
    pub(crate) fn set_effect_bypass(&mut self, slot: usize, bypass: bool) -> bool {
        let Some(effect) = self.slots.get_mut(slot) else {
            return false;
        };
        if effect.settings.bypass != bypass {
            effect.settings.bypass = bypass;
            self.plugins_ready = false;
        }
        true
    }

    pub(crate) fn enable_feedback_buffer(&mut self, enabled: bool) {
        if !enabled {
            self.feedback = None;
            return;
        }
        if self.feedback.is_none() {
            match AudioBuffer::try_new(self.output_config, self.frame_length) {
                Ok(buffer) => self.feedback = Some(buffer),
                Err(err) => log::error!("{}: no feedback buffer: {}", self.host.name, err),
            }
        }
    }

    pub(crate) fn has_feedback(&self) -> bool {
        self.feedback.is_some()
    }

    /// Build the plugin chain ahead of the render pass so the output layout
    /// is known when matrices are sized.
    pub(crate) fn prepare(&mut self) {
        if !matches!(self.state, NodeState::Stop) {
            self.ensure_plugins();
        }
    }

    /// Bus may be torn down: nothing feeds it, it is not playing and nothing
    /// asks for it to stay.
    pub fn is_destroyable(&self) -> bool {
        !self.is_device_bus()
            && self.inputs.is_empty()
            && self.state != NodeState::Play
            && !self.keep_alive
            && !self.hdr.as_ref().is_some_and(HdrState::is_releasing)
    }

    /// Create and initialize plugins that are not live yet.
    fn ensure_plugins(&mut self) {
        if self.plugins_ready {
            return;
        }
        self.plugins_ready = true;

        let BusNode {
            slots,
            mixer,
            host,
            factory,
            config,
            frame_length,
            output_config,
            meter,
            stage,
            ..
        } = self;
        let host = &*host;
        *stage = Stage::Accumulator;

        if let Some(slot) = mixer.as_mut() {
            if slot.plugin.is_none() && !slot.disabled {
                let created = factory.create_mixer(&slot.settings).and_then(|mut plugin| {
                    plugin.init(host, *config).map(|_| plugin)
                });
                match created {
                    Ok(plugin) => slot.plugin = Some(plugin),
                    Err(err) => {
                        host.post_error(&err);
                        log::error!("{}: dropping mixer slot", host.name);
                        slot.disabled = true;
                    }
                }
            }
        }

        let mut current = *config;
        for (index, slot) in slots.iter_mut().enumerate() {
            slot.effect = None;
            slot.buffer = None;
            if slot.disabled || slot.settings.bypass {
                continue;
            }
            let mut effect = match factory.create_effect(&slot.settings) {
                Ok(effect) => effect,
                Err(err) => {
                    host.post_error(&err);
                    log::error!("{}: dropping effect slot {}", host.name, index);
                    slot.disabled = true;
                    continue;
                }
            };
            let produced = match effect.init(host, current) {
                Ok(config) => config,
                Err(err) => {
                    host.post_error(&err);
                    log::error!("{}: dropping effect slot {}", host.name, index);
                    slot.disabled = true;
                    continue;
                }
            };
            if effect.is_in_place() && produced == current {
                slot.effect = Some(effect);
                continue;
            }
            match AudioBuffer::try_new(produced, *frame_length) {
                Ok(buffer) => {
                    slot.buffer = Some(buffer);
                    slot.effect = Some(effect);
                    current = produced;
                }
                Err(err) => {
                    log::error!("{}: disabling effect slot {}: {}", host.name, index, err);
                    slot.disabled = true;
                }
            }
        }

        if *output_config != current {
            log::debug!(
                "{}: output layout {} -> {} channel(s)",
                host.name,
                output_config.num_channels,
                current.num_channels
            );
        }
        *output_config = current;
        meter.resize(current.channels(), 0.0);
    }

    /// Accumulate one input into this frame's mix.
    pub(crate) fn consume_buffer(&mut self, source: &mut AudioBuffer, connection: &mut Connection) {
        if matches!(self.state, NodeState::Pause | NodeState::Stop) {
            return;
        }
        if connection.skips_render() || source.state() == BufferState::NoDataReady {
            return;
        }
        self.ensure_plugins();
        source.zero_pad();
        connection
            .filter
            .update_coefficients(self.host.sample_rate, source.num_channels());

        self.received_input = true;
        if matches!(self.state, NodeState::Init | NodeState::Idle) {
            self.state = NodeState::Play;
        }

        let (kind, listener, origin) = (connection.kind(), connection.listener(), connection.source());
        let (volume, ray_volume, hdr_gain) =
            (connection.volume(), connection.ray_volume(), connection.hdr_gain());
        let Some((filter, gain, matrix)) = connection.mix_parts() else {
            return;
        };

        let BusNode {
            mixer,
            accumulator,
            filter_scratch,
            mix_scratch,
            host,
            ..
        } = self;
        let host = &*host;
        match mixer.as_mut().and_then(|slot| slot.plugin.as_mut()) {
            Some(plugin) => {
                if filter_scratch.config() != source.config()
                    || filter_scratch.max_frames() != source.max_frames()
                {
                    if let Err(err) = filter_scratch.reconfigure(source.config(), source.max_frames()) {
                        log::error!("{}: skipping input: {}", host.name, err);
                        return;
                    }
                }
                filter_scratch.copy_from(source);
                if filter.is_active() {
                    for ch in 0..filter_scratch.num_channels() {
                        filter.process_channel(ch, filter_scratch.channel_mut(ch));
                    }
                }
                let input = MixerInput {
                    buffer: filter_scratch,
                    source: origin,
                    kind,
                    listener,
                    volume,
                    ray_volume,
                    hdr_gain,
                    matrix,
                };
                plugin.consume_input(&input, accumulator, host);
            }
            None => mix_into(source, filter, gain, matrix, accumulator, mix_scratch),
        }
    }

    /// Run the mixer hooks and insert chain once per frame.
    pub(crate) fn process(&mut self) {
        if self.processed {
            return;
        }
        self.processed = true;
        self.stage = Stage::Accumulator;

        if matches!(self.state, NodeState::Pause | NodeState::Stop)
            || (!self.received_input && self.state != NodeState::Play)
        {
            self.accumulator.set_state(BufferState::NoDataReady);
            return;
        }

        self.ensure_plugins();
        self.produced = self.received_input;
        self.accumulator.set_valid_frames(self.frame_length);
        self.accumulator.set_state(if self.received_input {
            BufferState::DataReady
        } else {
            BufferState::NoMoreData
        });

        let BusNode {
            mixer,
            slots,
            accumulator,
            host,
            stage,
            produced,
            metering,
            meter,
            ..
        } = self;
        let host = &*host;

        if let Some(plugin) = mixer.as_mut().and_then(|slot| slot.plugin.as_mut()) {
            plugin.on_mix_done(accumulator, host);
        }
        for index in 0..slots.len() {
            let (next, slot_produced) = run_slot(accumulator, slots, index, *stage, host);
            *stage = next;
            *produced |= slot_produced;
        }
        let current = stage_buffer(accumulator, slots, *stage);
        if let Some(plugin) = mixer.as_mut().and_then(|slot| slot.plugin.as_mut()) {
            plugin.on_effects_processed(current, host);
            plugin.on_frame_end(current, host);
        }

        if *metering {
            meter.resize(current.num_channels(), 0.0);
            for (ch, peak) in meter.iter_mut().enumerate() {
                *peak = current.channel_peak(ch);
            }
        }
    }

    /// This frame's result; processes the bus first when needed.
    pub fn get_resulting_buffer(&mut self) -> &AudioBuffer {
        self.process();
        self.output()
    }

    /// The current stage buffer.
    pub fn output(&self) -> &AudioBuffer {
        match self.stage {
            Stage::Slot(index) => self
                .slots
                .get(index)
                .and_then(|slot| slot.buffer.as_ref())
                .unwrap_or(&self.accumulator),
            Stage::Accumulator => &self.accumulator,
        }
    }

    pub(crate) fn has_output(&self) -> bool {
        self.processed && self.output().state() != BufferState::NoDataReady
    }

    pub(crate) fn take_output(&mut self) -> AudioBuffer {
        match self.stage {
            Stage::Slot(index) => self
                .slots
                .get_mut(index)
                .and_then(|slot| slot.buffer.take())
                .unwrap_or_default(),
            Stage::Accumulator => std::mem::take(&mut self.accumulator),
        }
    }

    pub(crate) fn restore_output(&mut self, buffer: AudioBuffer) {
        match self.stage {
            Stage::Slot(index) => {
                if let Some(slot) = self.slots.get_mut(index) {
                    slot.buffer = Some(buffer);
                }
            }
            Stage::Accumulator => self.accumulator = buffer,
        }
    }

    /// Close the frame: keep the feedback copy, settle Play/Idle and release
    /// the buffers.
    pub(crate) fn end_frame(&mut self) {
        if self.feedback.is_some() {
            let produced = self.produced;
            let output = match self.stage {
                Stage::Slot(index) => self.slots.get(index).and_then(|slot| slot.buffer.as_ref()),
                Stage::Accumulator => Some(&self.accumulator),
            };
            if let (Some(feedback), Some(output)) = (self.feedback.as_mut(), output) {
                let same_layout = feedback.config() == output.config()
                    || feedback.reconfigure(output.config(), output.max_frames()).is_ok();
                if produced && same_layout {
                    feedback.copy_from(output);
                } else {
                    feedback.clear();
                }
            }
        }

        if self.state == NodeState::Play && !self.produced {
            self.state = NodeState::Idle;
        }

        self.accumulator.clear();
        for slot in self.slots.iter_mut() {
            if let Some(buffer) = slot.buffer.as_mut() {
                buffer.clear();
            }
        }
        self.stage = Stage::Accumulator;
        self.received_input = false;
        self.produced = false;
        self.processed = false;
    }
}

fn stage_buffer<'a>(
    accumulator: &'a mut AudioBuffer,
    slots: &'a mut [EffectSlot],
    stage: Stage,
) -> &'a mut AudioBuffer {
    match stage {
        Stage::Slot(index) => match slots.get_mut(index).and_then(|slot| slot.buffer.as_mut()) {
            Some(buffer) => buffer,
            None => accumulator,
        },
        Stage::Accumulator => accumulator,
    }
}

/// Run slot `index` on the current stage; returns the new stage and whether
/// the slot produced data.
fn run_slot(
    accumulator: &mut AudioBuffer,
    slots: &mut [EffectSlot],
    index: usize,
    stage: Stage,
    host: &BusHost,
) -> (Stage, bool) {
    let (before, rest) = slots.split_at_mut(index);
    let Some(slot) = rest.first_mut() else {
        return (stage, false);
    };
    let Some(effect) = slot.effect.as_mut() else {
        return (stage, false);
    };
    let current = stage_buffer(accumulator, before, stage);
    match slot.buffer.as_mut() {
        None => {
            effect.execute(EffectIo::InPlace(current), host);
            (stage, current.state() == BufferState::DataReady)
        }
        Some(output) => {
            output.clear();
            effect.execute(
                EffectIo::OutOfPlace {
                    input: current,
                    output,
                },
                host,
            );
            (Stage::Slot(index), output.state() == BufferState::DataReady)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MatrixRamp;
    use crate::graph::ConnectionType;
    use crate::ids::{BusId, ConnectionId, ListenerId, NodeId, VoiceId};
    use crate::plugin::BuiltinPlugins;
    use serde_json::json;

    const FRAMES: usize = 8;

    fn bus(effects: Vec<EffectSlotSettings>, mixer: Option<EffectSlotSettings>) -> BusNode {
        BusNode::new(BusNodeInit {
            id: BusNodeId(1),
            context: BusContext::global(BusId(1)),
            name: "test".into(),
            config: ChannelConfig::stereo(),
            parent_config: ChannelConfig::stereo(),
            frame_length: FRAMES,
            sample_rate: 48_000,
            frame_rate: 48_000.0 / FRAMES as f32,
            volume_db: 0.0,
            effects,
            mixer,
            hdr: None,
            metering: true,
            keep_alive: false,
            media: vec![vec![1, 2, 3]],
            factory: Arc::new(BuiltinPlugins),
        })
        .expect("create bus")
    }

    fn routed_connection() -> Connection {
        let mut conn = Connection::new(
            ConnectionId(1),
            NodeId::Voice(VoiceId(1)),
            BusNodeId(1),
            BusContext::global(BusId(1)),
            ConnectionType::Direct,
            ListenerId(0),
            None,
            false,
        );
        conn.update_volumes(1.0, 1.0, 0.0, false, -96.3);
        conn.prepare_first_frame(false);
        conn.reset_matrix_and_filters(ChannelConfig::stereo(), ChannelConfig::stereo())
            .expect("allocate matrix");
        if let Some(matrix) = conn.matrix_mut() {
            identity(matrix);
        }
        conn.set_skip_render(false);
        conn
    }

    fn identity(matrix: &mut MatrixRamp) {
        matrix.next.set(0, 0, 1.0);
        matrix.next.set(1, 1, 1.0);
        matrix.snap_prev_to_next();
    }

    fn source(value: f32) -> AudioBuffer {
        let mut buffer = AudioBuffer::try_new(ChannelConfig::stereo(), FRAMES).expect("allocate");
        buffer.channel_mut(0).fill(value);
        buffer.channel_mut(1).fill(value);
        buffer.set_valid_frames(FRAMES);
        buffer.set_state(BufferState::DataReady);
        buffer
    }

    #[test]
    fn inputs_accumulate_and_start_playback() {
        let mut node = bus(Vec::new(), None);
        let mut conn = routed_connection();
        node.consume_buffer(&mut source(0.25), &mut conn);
        node.consume_buffer(&mut source(0.25), &mut conn);
        assert_eq!(node.state(), NodeState::Play);
        let out = node.get_resulting_buffer();
        assert!(out.channel(0).iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert_eq!(out.state(), BufferState::DataReady);
        assert_eq!(node.meter().map(|m| m.len()), Some(2));
    }

    #[test]
    fn idle_after_a_frame_without_data() {
        let mut node = bus(Vec::new(), None);
        let mut conn = routed_connection();
        node.consume_buffer(&mut source(1.0), &mut conn);
        node.process();
        node.end_frame();
        assert_eq!(node.state(), NodeState::Play);
        node.process();
        node.end_frame();
        assert_eq!(node.state(), NodeState::Idle);
        assert!(node.is_destroyable());
    }

    #[test]
    fn short_sources_are_zero_padded() {
        let mut node = bus(Vec::new(), None);
        let mut conn = routed_connection();
        let mut input = source(1.0);
        input.set_valid_frames(3);
        input.set_state(BufferState::NoMoreData);
        node.consume_buffer(&mut input, &mut conn);
        let out = node.get_resulting_buffer();
        assert_eq!(out.channel(0)[2], 1.0);
        assert_eq!(out.channel(0)[3], 0.0);
    }

    #[test]
    fn insert_chain_runs_in_place_and_out_of_place() {
        let mut node = bus(
            vec![
                EffectSlotSettings::new("gain", json!({"gain": 0.5})),
                EffectSlotSettings::new("fold", json!({"channels": 1})),
            ],
            None,
        );
        let mut conn = routed_connection();
        node.consume_buffer(&mut source(1.0), &mut conn);
        let out = node.get_resulting_buffer();
        assert_eq!(out.num_channels(), 1);
        let expected = 2.0 * 0.5 / 2.0_f32.sqrt();
        assert!(out.channel(0).iter().all(|s| (*s - expected).abs() < 1e-5));
        assert_eq!(node.output_config().channels(), 1);
    }

    #[test]
    fn failed_effects_are_dropped() {
        let mut node = bus(
            vec![
                EffectSlotSettings::new("missing", serde_json::Value::Null),
                EffectSlotSettings::new("gain", json!({"gain": 2.0})),
            ],
            None,
        );
        let mut conn = routed_connection();
        node.consume_buffer(&mut source(0.25), &mut conn);
        let out = node.get_resulting_buffer();
        assert!(out.channel(1).iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert_eq!(node.plugin_errors(), 1);
    }

    #[test]
    fn bypass_rebuilds_the_chain() {
        let mut node = bus(vec![EffectSlotSettings::new("gain", json!({"gain": 0.0}))], None);
        let mut conn = routed_connection();
        node.consume_buffer(&mut source(1.0), &mut conn);
        assert_eq!(node.get_resulting_buffer().peak(), 0.0);
        node.end_frame();

        assert!(node.set_effect_bypass(0, true));
        node.consume_buffer(&mut source(1.0), &mut conn);
        assert_eq!(node.get_resulting_buffer().peak(), 1.0);
        assert!(!node.set_effect_bypass(7, true));
    }

    #[test]
    fn custom_mixer_replaces_accumulation() {
        let mixer = EffectSlotSettings::new("summing", serde_json::Value::Null);
        let mut node = bus(Vec::new(), Some(mixer));
        let mut conn = routed_connection();
        conn.filter.set_params(0.0, 0.0);
        node.consume_buffer(&mut source(0.5), &mut conn);
        let out = node.get_resulting_buffer();
        assert!(out.channel(0).iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn paused_buses_ignore_input() {
        let mut node = bus(Vec::new(), None);
        node.set_paused(true);
        let mut conn = routed_connection();
        node.consume_buffer(&mut source(1.0), &mut conn);
        assert_eq!(node.get_resulting_buffer().state(), BufferState::NoDataReady);
        node.set_paused(false);
        assert_eq!(node.state(), NodeState::Idle);
    }

    #[test]
    fn host_answers_from_cached_state() {
        let mut node = bus(Vec::new(), None);
        node.set_downstream_gain_db(-6.0);
        node.set_custom_game_data(2, vec![9]);
        assert!((node.host.downstream_gain() - db_to_linear(-6.0)).abs() < 1e-6);
        assert_eq!(node.host.media(0), Some(&[1_u8, 2, 3][..]));
        assert_eq!(node.host.custom_game_data(2), Some(&[9_u8][..]));
        assert_eq!(node.host.custom_game_data(1), Some(&[][..]));
        assert_eq!(node.host.parent_channel_config(), ChannelConfig::stereo());
    }
}

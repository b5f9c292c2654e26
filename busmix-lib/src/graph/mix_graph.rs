//! The mix graph: voices, bus instances and the connections between them.
//!
//! Connections are owned by their source node and listed by id in the
//! destination's input list. Every structural change goes through this type
//! so both sides stay in sync.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

use super::bus::{BusNode, BusNodeInit};
use super::connection::{Connection, ConnectionType, RouteOrigin};
use super::context::BusContext;
use super::mixable::{
    merge_route, ConnectionUpdate, DestinationLookup, Mixable, Route, VolumeParams,
};
use super::order::{processing_order, would_create_cycle};
use super::voice::VoiceNode;
use crate::audio::{AudioBuffer, ChannelConfig};
use crate::error::{MixError, Result};
use crate::ids::{
    BusId, BusNodeId, ConnectionId, DeviceId, GameObjectId, ListenerId, NodeId, VoiceId,
};
use crate::plugin::PluginFactory;
use crate::settings::{BusOutput, BusSettings, EngineSettings};
use crate::source::{SourceFrameParams, Spatialization, VoiceSource};
use crate::spatial::{Panner, SharedPanCache};

/// A device as the graph sees it: its mix bus and who it listens to.
#[derive(Debug, Clone)]
struct DeviceLink {
    bus: BusNodeId,
    listeners: Vec<ListenerId>,
    pan_cache: SharedPanCache,
}

impl DeviceLink {
    fn hears(&self, listener: ListenerId) -> bool {
        self.listeners.is_empty() || self.listeners.contains(&listener)
    }
}

/// Counters describing the graph after the last frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub voices: usize,
    pub audible_voices: usize,
    pub buses: usize,
    pub connections: usize,
    pub connections_collected: u64,
    pub buses_destroyed: u64,
}

struct BusLookup<'a> {
    buses: &'a BTreeMap<BusNodeId, BusNode>,
    devices: &'a BTreeMap<DeviceId, DeviceLink>,
}

impl DestinationLookup for BusLookup<'_> {
    fn destination(&self, bus: BusNodeId) -> Option<(ChannelConfig, Option<&SharedPanCache>)> {
        let node = self.buses.get(&bus)?;
        let cache = node
            .reaches_device()
            .and_then(|device| self.devices.get(&device))
            .map(|link| &link.pan_cache);
        Some((node.config(), cache))
    }
}

pub struct MixGraph {
    settings: EngineSettings,
    factory: Arc<dyn PluginFactory>,
    panner: Arc<dyn Panner>,
    bus_settings: BTreeMap<BusId, BusSettings>,
    voices: BTreeMap<VoiceId, VoiceNode>,
    buses: BTreeMap<BusNodeId, BusNode>,
    instances: HashMap<BusContext, BusNodeId>,
    devices: BTreeMap<DeviceId, DeviceLink>,
    main_device: Option<DeviceId>,
    connection_owners: HashMap<ConnectionId, NodeId>,
    order: Vec<BusNodeId>,
    downstream_db: HashMap<BusNodeId, f32>,
    topology_dirty: bool,
    next_bus: u32,
    next_bus_node: u32,
    next_voice: u32,
    next_connection: u32,
    connections_collected: u64,
    buses_destroyed: u64,
    scratch: FrameScratch,
}

/// Working storage for the frame passes, cleared but never freed so a steady
/// graph renders without allocating.
#[derive(Debug, Default)]
struct FrameScratch {
    voices: Vec<VoiceId>,
    buses: Vec<BusNodeId>,
    connections: Vec<ConnectionId>,
    hears: Vec<(DeviceId, bool)>,
    routes: Vec<Route>,
    reaches: HashMap<BusNodeId, Option<DeviceId>>,
    configs: HashMap<BusNodeId, ChannelConfig>,
}

impl std::fmt::Debug for MixGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixGraph")
            .field("voices", &self.voices.len())
            .field("buses", &self.buses.len())
            .field("connections", &self.connection_owners.len())
            .field("main_device", &self.main_device)
            .finish()
    }
}

impl MixGraph {
    pub fn new(
        settings: EngineSettings,
        factory: Arc<dyn PluginFactory>,
        panner: Arc<dyn Panner>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings: settings.sanitized(),
            factory,
            panner,
            bus_settings: BTreeMap::new(),
            voices: BTreeMap::new(),
            buses: BTreeMap::new(),
            instances: HashMap::new(),
            devices: BTreeMap::new(),
            main_device: None,
            connection_owners: HashMap::new(),
            order: Vec::new(),
            downstream_db: HashMap::new(),
            topology_dirty: false,
            next_bus: 1,
            next_bus_node: 1,
            next_voice: 1,
            next_connection: 1,
            connections_collected: 0,
            buses_destroyed: 0,
            scratch: FrameScratch::default(),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            voices: self.voices.len(),
            audible_voices: self
                .voices
                .values()
                .filter(|v| v.mixable().is_audible())
                .count(),
            buses: self.buses.len(),
            connections: self.connection_owners.len(),
            connections_collected: self.connections_collected,
            buses_destroyed: self.buses_destroyed,
        }
    }

    // Authored buses

    pub fn register_bus(&mut self, settings: BusSettings) -> Result<BusId> {
        settings.validate()?;
        let id = BusId(self.next_bus);
        self.next_bus += 1;
        log::debug!("registered {} \"{}\"", id, settings.name);
        self.bus_settings.insert(id, settings);
        Ok(id)
    }

    pub fn bus_settings(&self, bus: BusId) -> Option<&BusSettings> {
        self.bus_settings.get(&bus)
    }

    /// Change the volume of an authored bus and all of its live instances.
    pub fn set_bus_volume(&mut self, bus: BusId, volume_db: f32) -> Result<()> {
        let settings = self
            .bus_settings
            .get_mut(&bus)
            .ok_or(MixError::UnknownBus(bus))?;
        if !volume_db.is_finite() {
            return Err(MixError::InvalidSettings(format!(
                "volume of {} is not finite",
                bus
            )));
        }
        settings.volume_db = volume_db;
        for node in self.buses.values_mut() {
            if node.bus_id() == Some(bus) {
                node.set_volume_db(volume_db);
            }
        }
        Ok(())
    }

    /// The instance for `context`, creating it (and its parents) when missing.
    pub fn ensure_bus(&mut self, context: BusContext) -> Result<BusNodeId> {
        self.ensure_bus_instance(context, &mut Vec::new())
    }

    fn ensure_bus_instance(
        &mut self,
        context: BusContext,
        chain: &mut Vec<BusContext>,
    ) -> Result<BusNodeId> {
        if let Some(id) = self.instances.get(&context) {
            return Ok(*id);
        }
        let (bus, game_object) = match context {
            BusContext::Device { device } => return Err(MixError::UnknownDevice(device)),
            BusContext::Bus { bus, game_object } => (bus, game_object),
        };
        let settings = self
            .bus_settings
            .get(&bus)
            .cloned()
            .ok_or(MixError::UnknownBus(bus))?;
        if chain.contains(&context) {
            return Err(MixError::Topology(format!(
                "bus hierarchy loops through {}",
                context
            )));
        }

        let parent_context = match settings.output {
            BusOutput::MainDevice => {
                BusContext::device(self.main_device.ok_or(MixError::NoMainDevice)?)
            }
            BusOutput::Device { device } => BusContext::device(device),
            BusOutput::Parent { bus } => BusContext::bus(bus, game_object),
        };
        chain.push(context);
        let parent = self.ensure_bus_instance(parent_context, chain);
        chain.pop();
        let parent = parent?;
        let parent_node = self
            .buses
            .get(&parent)
            .ok_or(MixError::UnknownBusNode(parent))?;
        let parent_config = parent_node.config();
        let hdr_target = if parent_node.hdr().is_some() {
            Some(parent)
        } else {
            parent_node.hdr_target
        };
        let reaches_device = parent_node.reaches_device();

        let id = BusNodeId(self.next_bus_node);
        let mut node = BusNode::new(BusNodeInit {
            id,
            context,
            name: settings.name.clone(),
            config: settings.channels.unwrap_or(parent_config),
            parent_config,
            frame_length: self.settings.frame_length,
            sample_rate: self.settings.sample_rate,
            frame_rate: self.settings.frame_rate(),
            volume_db: settings.volume_db,
            effects: settings.effects.clone(),
            mixer: settings.mixer.clone(),
            hdr: settings.hdr.map(|hdr| hdr.sanitized()),
            metering: settings.metering,
            keep_alive: settings.keep_alive,
            media: settings.media.clone(),
            factory: Arc::clone(&self.factory),
        })?;
        self.next_bus_node += 1;
        node.hdr_target = hdr_target;
        node.reaches_device = reaches_device;
        node.routes = bus_routes(&settings, parent_context, game_object);

        log::debug!("instantiated {} as {}", context, id);
        self.buses.insert(id, node);
        self.instances.insert(context, id);
        self.topology_dirty = true;
        self.sync_bus_routes(id);
        Ok(id)
    }

    fn refresh_bus_routes(&mut self) {
        let main = self.main_device;
        for node in self.buses.values_mut() {
            let (Some(bus), BusContext::Bus { game_object, .. }) = (node.bus_id(), node.context())
            else {
                continue;
            };
            let Some(settings) = self.bus_settings.get(&bus) else {
                continue;
            };
            let parent = match settings.output {
                BusOutput::MainDevice => match main {
                    Some(device) => BusContext::device(device),
                    None => {
                        node.routes.clear();
                        continue;
                    }
                },
                BusOutput::Device { device } => BusContext::device(device),
                BusOutput::Parent { bus } => BusContext::bus(bus, game_object),
            };
            node.routes = bus_routes(settings, parent, game_object);
        }
    }

    // Devices

    /// Create the mix bus of an output device.
    pub fn attach_device(
        &mut self,
        device: DeviceId,
        config: ChannelConfig,
        listeners: Vec<ListenerId>,
        pan_cache: SharedPanCache,
    ) -> Result<BusNodeId> {
        config.validate()?;
        if self.devices.contains_key(&device) {
            return Err(MixError::Topology(format!("{} is already attached", device)));
        }
        let context = BusContext::device(device);
        let id = BusNodeId(self.next_bus_node);
        let mut node = BusNode::new(BusNodeInit {
            id,
            context,
            name: format!("{} mix", device),
            config,
            parent_config: config,
            frame_length: self.settings.frame_length,
            sample_rate: self.settings.sample_rate,
            frame_rate: self.settings.frame_rate(),
            volume_db: 0.0,
            effects: Vec::new(),
            mixer: None,
            hdr: None,
            metering: true,
            keep_alive: true,
            media: Vec::new(),
            factory: Arc::clone(&self.factory),
        })?;
        self.next_bus_node += 1;
        node.reaches_device = Some(device);
        self.buses.insert(id, node);
        self.instances.insert(context, id);
        self.devices.insert(
            device,
            DeviceLink {
                bus: id,
                listeners,
                pan_cache,
            },
        );
        self.topology_dirty = true;
        log::debug!("attached {} with mix bus {}", device, id);
        Ok(id)
    }

    /// Remove a device's mix bus and every connection into it.
    pub fn detach_device(&mut self, device: DeviceId) -> Result<()> {
        let link = self
            .devices
            .remove(&device)
            .ok_or(MixError::UnknownDevice(device))?;
        let inputs: Vec<ConnectionId> = self
            .buses
            .get(&link.bus)
            .map(|bus| bus.inputs().iter().map(|(id, _)| id).collect())
            .unwrap_or_default();
        for id in inputs {
            self.remove_connection(id);
        }
        self.destroy_bus(link.bus);
        if self.main_device == Some(device) {
            self.main_device = None;
            self.refresh_bus_routes();
        }
        log::debug!("detached {}", device);
        Ok(())
    }

    pub fn set_main_device(&mut self, device: Option<DeviceId>) -> Result<()> {
        if let Some(id) = device {
            if !self.devices.contains_key(&id) {
                return Err(MixError::UnknownDevice(id));
            }
        }
        if self.main_device != device {
            self.main_device = device;
            self.refresh_bus_routes();
        }
        Ok(())
    }

    pub fn main_device(&self) -> Option<DeviceId> {
        self.main_device
    }

    pub fn set_device_listeners(&mut self, device: DeviceId, listeners: Vec<ListenerId>) -> Result<()> {
        let link = self
            .devices
            .get_mut(&device)
            .ok_or(MixError::UnknownDevice(device))?;
        link.listeners = listeners;
        Ok(())
    }

    pub fn device_bus(&self, device: DeviceId) -> Option<&BusNode> {
        self.devices
            .get(&device)
            .and_then(|link| self.buses.get(&link.bus))
    }

    /// The device mix bus result of the frame being rendered.
    pub fn device_output(&self, device: DeviceId) -> Option<&AudioBuffer> {
        self.device_bus(device)
            .filter(|bus| bus.has_output())
            .map(BusNode::output)
    }

    // Voices

    pub fn add_voice(
        &mut self,
        source: Box<dyn VoiceSource>,
        params: SourceFrameParams,
    ) -> Result<VoiceId> {
        let id = VoiceId(self.next_voice);
        let voice = VoiceNode::new(id, source, params, self.settings.frame_length)?;
        self.next_voice += 1;
        self.voices.insert(id, voice);
        log::trace!("added {}", id);
        Ok(id)
    }

    pub fn set_voice_params(&mut self, id: VoiceId, params: SourceFrameParams) -> Result<()> {
        let voice = self.voices.get_mut(&id).ok_or(MixError::UnknownVoice(id))?;
        voice.params = params;
        Ok(())
    }

    /// Fade the voice out; it leaves the graph once its routes are silent.
    pub fn stop_voice(&mut self, id: VoiceId) -> Result<()> {
        self.voices
            .get_mut(&id)
            .ok_or(MixError::UnknownVoice(id))?
            .stop();
        Ok(())
    }

    pub fn voice(&self, id: VoiceId) -> Option<&VoiceNode> {
        self.voices.get(&id)
    }

    pub fn voices(&self) -> impl Iterator<Item = &VoiceNode> {
        self.voices.values()
    }

    // Buses and connections

    pub fn bus(&self, id: BusNodeId) -> Option<&BusNode> {
        self.buses.get(&id)
    }

    pub fn bus_instance(&self, context: BusContext) -> Option<&BusNode> {
        self.instances
            .get(&context)
            .and_then(|id| self.buses.get(id))
    }

    pub fn buses(&self) -> impl Iterator<Item = &BusNode> {
        self.buses.values()
    }

    pub fn processing_order(&self) -> &[BusNodeId] {
        &self.order
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        let owner = self.connection_owners.get(&id)?;
        self.mixable(*owner)?.connection(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connection_owners.len()
    }

    fn mixable(&self, node: NodeId) -> Option<&Mixable> {
        match node {
            NodeId::Voice(id) => self.voices.get(&id).map(|v| &v.mixable),
            NodeId::Bus(id) => self.buses.get(&id).map(|b| &b.mixable),
        }
    }

    fn mixable_mut(&mut self, node: NodeId) -> Option<&mut Mixable> {
        match node {
            NodeId::Voice(id) => self.voices.get_mut(&id).map(|v| &mut v.mixable),
            NodeId::Bus(id) => self.buses.get_mut(&id).map(|b| &mut b.mixable),
        }
    }

    /// Route `source` into `to` until [`MixGraph::remove_output_bus`] is called.
    pub fn add_output_bus(
        &mut self,
        source: NodeId,
        to: BusContext,
        kind: ConnectionType,
        control: f32,
    ) -> Result<ConnectionId> {
        if self.mixable(source).is_none() {
            return Err(MixError::UnknownNode(source));
        }
        let destination = self.ensure_bus(to)?;
        let route = Route::new(to, kind, ListenerId::default(), control.max(0.0));
        self.connect(
            source,
            destination,
            &route,
            RouteOrigin::Manual {
                removal_requested: false,
            },
        )
    }

    pub fn set_output_bus_volume(&mut self, id: ConnectionId, control: f32) -> Result<()> {
        let owner = *self
            .connection_owners
            .get(&id)
            .ok_or(MixError::UnknownConnection(id))?;
        let conn = self
            .mixable_mut(owner)
            .and_then(|m| m.connection_mut(id))
            .ok_or(MixError::UnknownConnection(id))?;
        conn.control = if control.is_finite() { control.max(0.0) } else { 0.0 };
        Ok(())
    }

    /// Fade a manual route out; it is collected once silent.
    pub fn remove_output_bus(&mut self, id: ConnectionId) -> Result<()> {
        let owner = *self
            .connection_owners
            .get(&id)
            .ok_or(MixError::UnknownConnection(id))?;
        self.mixable_mut(owner)
            .and_then(|m| m.connection_mut(id))
            .ok_or(MixError::UnknownConnection(id))?
            .request_removal();
        Ok(())
    }

    pub fn set_effect_bypass(&mut self, context: BusContext, slot: usize, bypass: bool) -> Result<()> {
        let node = self.bus_instance_mut(context)?;
        if !node.set_effect_bypass(slot, bypass) {
            return Err(MixError::InvalidSettings(format!(
                "{} has no effect slot {}",
                context, slot
            )));
        }
        Ok(())
    }

    pub fn pause_bus(&mut self, context: BusContext, paused: bool) -> Result<()> {
        self.bus_instance_mut(context)?.set_paused(paused);
        Ok(())
    }

    pub fn set_custom_game_data(&mut self, context: BusContext, index: usize, data: Vec<u8>) -> Result<()> {
        self.bus_instance_mut(context)?
            .set_custom_game_data(index, data);
        Ok(())
    }

    fn bus_instance_mut(&mut self, context: BusContext) -> Result<&mut BusNode> {
        let id = *self
            .instances
            .get(&context)
            .ok_or_else(|| MixError::Topology(format!("{} has no instance", context)))?;
        self.buses.get_mut(&id).ok_or(MixError::UnknownBusNode(id))
    }

    fn connect(
        &mut self,
        source: NodeId,
        destination: BusNodeId,
        route: &Route,
        origin: RouteOrigin,
    ) -> Result<ConnectionId> {
        let dest = self
            .buses
            .get(&destination)
            .ok_or(MixError::UnknownBusNode(destination))?;
        let hdr_bus = match source {
            NodeId::Voice(_) if dest.hdr().is_some() => Some(destination),
            NodeId::Voice(_) => dest.hdr_target,
            NodeId::Bus(_) => None,
        };
        if let NodeId::Bus(from) = source {
            if route.kind != ConnectionType::Feedback
                && would_create_cycle(&self.buses, from, destination)
            {
                return Err(MixError::RoutingCycle {
                    from: source,
                    to: NodeId::Bus(destination),
                });
            }
        }

        let id = ConnectionId(self.next_connection);
        let owner = self
            .mixable_mut(source)
            .ok_or(MixError::UnknownNode(source))?;
        let mut conn = Connection::new(
            id,
            source,
            destination,
            route.context,
            route.kind,
            route.listener,
            hdr_bus,
            !owner.is_first_frame(),
        )
        .with_origin(origin);
        conn.control = route.control;
        conn.filter.set_params(route.lpf, route.hpf);
        owner.push_connection(conn)?;

        self.next_connection = self.next_connection.wrapping_add(1).max(1);
        if let Some(dest) = self.buses.get_mut(&destination) {
            dest.inputs.insert(id, source);
        }
        self.connection_owners.insert(id, source);
        if let NodeId::Bus(from) = source {
            self.topology_dirty = true;
            self.refresh_feedback(from);
        }
        log::trace!("{}: {} -> {} ({:?})", id, source, destination, route.kind);
        Ok(id)
    }

    fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let owner = self.connection_owners.remove(&id)?;
        let conn = self.mixable_mut(owner)?.remove_connection(id)?;
        if let Some(dest) = self.buses.get_mut(&conn.destination()) {
            dest.inputs.remove(id);
        }
        if let NodeId::Bus(bus) = owner {
            self.topology_dirty = true;
            self.refresh_feedback(bus);
        }
        log::trace!("removed {}", id);
        Some(conn)
    }

    fn refresh_feedback(&mut self, bus: BusNodeId) {
        if let Some(node) = self.buses.get_mut(&bus) {
            let has_feedback = node
                .mixable
                .connections()
                .iter()
                .any(|c| c.kind() == ConnectionType::Feedback);
            node.enable_feedback_buffer(has_feedback);
        }
    }

    /// Drop a node's outgoing connections from the graph bookkeeping.
    fn forget_outgoing(&mut self, mixable: &Mixable) {
        for conn in mixable.connections() {
            self.connection_owners.remove(&conn.id());
            if let Some(dest) = self.buses.get_mut(&conn.destination()) {
                dest.inputs.remove(conn.id());
            }
        }
    }

    fn destroy_bus(&mut self, id: BusNodeId) {
        let Some(mut node) = self.buses.remove(&id) else {
            return;
        };
        node.stop();
        self.instances.remove(&node.context());
        let mixable = mem::take(&mut node.mixable);
        self.forget_outgoing(&mixable);
        self.topology_dirty = true;
        self.buses_destroyed += 1;
        log::debug!("destroyed {} ({})", id, node.context());
    }

    fn drop_voice(&mut self, id: VoiceId) {
        if let Some(voice) = self.voices.remove(&id) {
            self.forget_outgoing(&voice.mixable);
            log::trace!("dropped {}", id);
        }
    }

    // Frame passes

    /// Create missing routes and refresh the processing order.
    pub fn begin_frame(&mut self) {
        self.sync_routes();
        if self.topology_dirty {
            self.order = processing_order(&self.buses);
            self.topology_dirty = false;
        }
    }

    fn sync_routes(&mut self) {
        let mut scratch = mem::take(&mut self.scratch);

        scratch.voices.clear();
        scratch.voices.extend(self.voices.keys().copied());
        for id in scratch.voices.iter().copied() {
            let Some(voice) = self.voices.get_mut(&id) else {
                continue;
            };
            let listener = voice.listener();
            scratch.hears.clear();
            scratch.hears.extend(
                self.devices
                    .iter()
                    .map(|(device, link)| (*device, link.hears(listener))),
            );
            voice.rebuild_routes(&scratch.hears);
            scratch.routes.clear();
            scratch.routes.extend(
                voice
                    .routes
                    .iter()
                    .filter(|r| r.control > 0.0 && !voice.mixable.has_automatic_route(r))
                    .copied(),
            );
            for route in scratch.routes.iter().copied() {
                self.connect_route(NodeId::Voice(id), route);
            }
        }

        scratch.buses.clear();
        scratch.buses.extend(self.buses.keys().copied());
        for id in scratch.buses.iter().copied() {
            scratch.routes.clear();
            if let Some(bus) = self.buses.get(&id) {
                scratch.routes.extend(
                    bus.routes
                        .iter()
                        .filter(|r| r.control > 0.0 && !bus.mixable.has_automatic_route(r))
                        .copied(),
                );
            }
            for route in scratch.routes.iter().copied() {
                self.connect_route(NodeId::Bus(id), route);
            }
        }

        self.scratch = scratch;
    }

    fn sync_bus_routes(&mut self, id: BusNodeId) {
        let wanted: Vec<Route> = match self.buses.get(&id) {
            Some(bus) => bus
                .routes
                .iter()
                .filter(|r| r.control > 0.0 && !bus.mixable.has_automatic_route(r))
                .copied()
                .collect(),
            None => return,
        };
        for route in wanted {
            self.connect_route(NodeId::Bus(id), route);
        }
    }

    fn connect_route(&mut self, source: NodeId, route: Route) {
        let destination = match self.ensure_bus_instance(route.context, &mut Vec::new()) {
            Ok(id) => id,
            Err(err) => {
                log::debug!("{} cannot reach {}: {}", source, route.context, err);
                return;
            }
        };
        if let Err(err) = self.connect(source, destination, &route, RouteOrigin::Automatic) {
            log::debug!("{} not routed to {}: {}", source, route.context, err);
        }
    }

    /// Gains, HDR and speaker matrices for the coming frame.
    pub fn update(&mut self) {
        let threshold_db = self.settings.volume_threshold_db;
        let MixGraph {
            voices,
            buses,
            devices,
            order,
            downstream_db,
            panner,
            scratch,
            ..
        } = self;
        let panner: &dyn Panner = &**panner;
        let FrameScratch { reaches, configs, .. } = scratch;

        // Buses nearest the devices first so every destination's downstream
        // gain is known when its inputs are updated.
        downstream_db.clear();
        reaches.clear();
        configs.clear();
        for id in order.iter().rev() {
            let Some(bus) = buses.get_mut(id) else {
                continue;
            };
            let gain_db = if bus.is_device_bus() {
                0.0
            } else {
                let update = ConnectionUpdate {
                    behavioral_volume: bus.behavioral_volume(),
                    routes: &bus.routes,
                    rays: &[],
                    envelope_db: 0.0,
                    evaluate_audibility: false,
                    threshold_db,
                };
                bus.mixable.update_connections(
                    &update,
                    |dest| downstream_db.get(&dest).copied(),
                    |_, _| {},
                );
                let parent = bus
                    .mixable
                    .connections()
                    .iter()
                    .find(|c| c.kind() == ConnectionType::Direct)
                    .map(|c| c.destination());
                bus.reaches_device = parent.and_then(|p| reaches.get(&p).copied().flatten());
                if let Some(config) = parent.and_then(|p| configs.get(&p)) {
                    bus.set_parent_config(*config);
                }
                bus.mixable.max_downstream_gain_db()
            };
            bus.prepare();
            reaches.insert(*id, bus.reaches_device);
            configs.insert(*id, bus.config());
            downstream_db.insert(*id, gain_db);
            bus.set_downstream_gain_db(gain_db);
            if let Some(hdr) = bus.hdr.as_mut() {
                hdr.begin_frame(gain_db);
            }
        }

        for voice in voices.values_mut() {
            let update = ConnectionUpdate {
                behavioral_volume: voice.params.volume,
                routes: &voice.routes,
                rays: &voice.params.rays,
                envelope_db: voice.params.envelope_db,
                evaluate_audibility: true,
                threshold_db,
            };
            voice.mixable.update_connections(
                &update,
                |dest| downstream_db.get(&dest).copied(),
                |hdr_bus, peak_db| {
                    if let Some(hdr) = buses.get_mut(&hdr_bus).and_then(|b| b.hdr.as_mut()) {
                        hdr.push_effective_voice_volume(peak_db);
                    }
                },
            );
        }

        // Every peak is in before any window moves.
        for bus in buses.values_mut() {
            if let Some(hdr) = bus.hdr.as_mut() {
                hdr.compute_window_top();
            }
        }
        for voice in voices.values_mut() {
            voice.mixable.update_hdr(|hdr_bus| {
                buses
                    .get(&hdr_bus)
                    .and_then(BusNode::hdr)
                    .map(|hdr| (hdr.attenuation_db(), hdr.window_top_db()))
            });
        }

        let lookup = BusLookup {
            buses: &*buses,
            devices: &*devices,
        };
        for voice in voices.values_mut() {
            let input = voice.config();
            let params = VolumeParams {
                input,
                forced_virtual: voice.params.forced_virtual,
                start_with_fade_in: voice.params.start_with_fade_in,
                spatialization: voice.params.spatialization,
                rays: &voice.params.rays,
                panner,
            };
            voice.mixable.get_volumes(&params, &lookup);
        }

        for id in order.iter() {
            let (mut mixable, input) = match buses.get_mut(id) {
                Some(bus) => (mem::take(&mut bus.mixable), bus.output_config()),
                None => continue,
            };
            let params = VolumeParams {
                input,
                forced_virtual: false,
                start_with_fade_in: false,
                spatialization: Spatialization::default(),
                rays: &[],
                panner,
            };
            mixable.get_volumes(
                &params,
                &BusLookup {
                    buses: &*buses,
                    devices: &*devices,
                },
            );
            if let Some(bus) = buses.get_mut(id) {
                bus.mixable = mixable;
            }
        }
    }

    /// Pull voices and run every bus, upstream first.
    pub fn render(&mut self) {
        let MixGraph {
            voices,
            buses,
            order,
            ..
        } = self;

        // Feedback sends replay the previous frame.
        for id in order.iter() {
            let (mut mixable, mut feedback) = match buses.get_mut(id) {
                Some(bus) if bus.has_feedback() => (mem::take(&mut bus.mixable), bus.feedback.take()),
                _ => continue,
            };
            if let Some(buffer) = feedback.as_mut() {
                for conn in mixable
                    .connections_mut()
                    .iter_mut()
                    .filter(|c| c.kind() == ConnectionType::Feedback)
                {
                    if let Some(dest) = buses.get_mut(&conn.destination()) {
                        dest.consume_buffer(buffer, conn);
                    }
                }
            }
            if let Some(bus) = buses.get_mut(id) {
                bus.mixable = mixable;
                bus.feedback = feedback;
            }
        }

        for voice in voices.values_mut() {
            voice.render();
            if !voice.buffer.has_data() {
                continue;
            }
            for conn in voice.mixable.connections_mut() {
                if let Some(dest) = buses.get_mut(&conn.destination()) {
                    dest.consume_buffer(&mut voice.buffer, conn);
                }
            }
        }

        for id in order.iter() {
            let Some(bus) = buses.get_mut(id) else {
                continue;
            };
            bus.process();
            if !bus.has_output() || bus.mixable.connections().is_empty() {
                continue;
            }
            let mut output = bus.take_output();
            let mut mixable = mem::take(&mut bus.mixable);
            for conn in mixable
                .connections_mut()
                .iter_mut()
                .filter(|c| c.kind() != ConnectionType::Feedback)
            {
                if let Some(dest) = buses.get_mut(&conn.destination()) {
                    dest.consume_buffer(&mut output, conn);
                }
            }
            if let Some(bus) = buses.get_mut(id) {
                bus.restore_output(output);
                bus.mixable = mixable;
            }
        }
    }

    /// Run every pass up to (not including) device output.
    pub fn run_frame(&mut self) {
        self.begin_frame();
        self.update();
        self.render();
    }

    /// Release frame buffers and collect what is no longer needed.
    pub fn end_frame(&mut self) {
        for bus in self.buses.values_mut() {
            bus.end_frame();
        }

        let mut scratch = mem::take(&mut self.scratch);

        scratch.connections.clear();
        scratch.connections.extend(
            self.voices
                .values()
                .flat_map(|v| v.mixable.collectable())
                .chain(self.buses.values().flat_map(|b| b.mixable.collectable()))
                .map(|(id, _)| id),
        );
        for id in scratch.connections.iter().copied() {
            if self.remove_connection(id).is_some() {
                self.connections_collected += 1;
            }
        }

        scratch.voices.clear();
        scratch.voices.extend(
            self.voices
                .values()
                .filter(|v| v.is_done())
                .map(VoiceNode::id),
        );
        for id in scratch.voices.iter().copied() {
            self.drop_voice(id);
        }

        loop {
            scratch.buses.clear();
            scratch.buses.extend(
                self.buses
                    .values()
                    .filter(|b| b.is_destroyable())
                    .map(BusNode::id),
            );
            if scratch.buses.is_empty() {
                break;
            }
            for id in scratch.buses.iter().copied() {
                self.destroy_bus(id);
            }
        }

        self.scratch = scratch;
    }

    /// Check that connection owners, destination input lists and the
    /// instance index agree.
    pub fn validate_topology(&self) -> Result<()> {
        let mut seen = 0usize;
        let owners = self
            .voices
            .values()
            .map(|v| (NodeId::Voice(v.id()), &v.mixable))
            .chain(self.buses.values().map(|b| (NodeId::Bus(b.id()), &b.mixable)));
        for (owner, mixable) in owners {
            for conn in mixable.connections() {
                seen += 1;
                if conn.source() != owner {
                    return Err(topology(format!("{} is held by {} but names {}", conn.id(), owner, conn.source())));
                }
                if self.connection_owners.get(&conn.id()) != Some(&owner) {
                    return Err(topology(format!("{} has no owner entry for {}", conn.id(), owner)));
                }
                let Some(dest) = self.buses.get(&conn.destination()) else {
                    return Err(topology(format!("{} targets missing {}", conn.id(), conn.destination())));
                };
                if dest.inputs().source_of(conn.id()) != Some(owner) {
                    return Err(topology(format!("{} is missing from the inputs of {}", conn.id(), dest.id())));
                }
            }
        }
        if seen != self.connection_owners.len() {
            return Err(topology(format!(
                "{} connections owned but {} registered",
                seen,
                self.connection_owners.len()
            )));
        }

        for bus in self.buses.values() {
            for (id, source) in bus.inputs().iter() {
                let listed = self
                    .mixable(source)
                    .and_then(|m| m.connection(id))
                    .is_some_and(|c| c.destination() == bus.id());
                if !listed {
                    return Err(topology(format!("{} lists {} from {} which does not feed it", bus.id(), id, source)));
                }
            }
            if self.instances.get(&bus.context()) != Some(&bus.id()) {
                return Err(topology(format!("{} is not indexed by {}", bus.id(), bus.context())));
            }
        }
        if self.instances.len() != self.buses.len() {
            return Err(topology(format!(
                "{} instances indexed for {} buses",
                self.instances.len(),
                self.buses.len()
            )));
        }
        if !self.topology_dirty && self.order.len() != self.buses.len() {
            return Err(topology("processing order is out of date".into()));
        }
        Ok(())
    }
}

fn topology(message: String) -> MixError {
    MixError::Topology(message)
}

/// Routes an authored bus instance wants: its dry output plus aux sends on
/// the same game object.
fn bus_routes(settings: &BusSettings, parent: BusContext, game_object: GameObjectId) -> Vec<Route> {
    let mut routes = Vec::with_capacity(1 + settings.aux_sends.len());
    merge_route(
        &mut routes,
        Route::new(parent, ConnectionType::Direct, ListenerId::default(), 1.0),
    );
    for send in &settings.aux_sends {
        merge_route(
            &mut routes,
            Route::new(
                BusContext::bus(send.bus, game_object),
                send.kind,
                ListenerId::default(),
                send.level,
            ),
        );
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BufferState;
    use crate::graph::HdrState;
    use crate::plugin::BuiltinPlugins;
    use crate::settings::{BusAuxSend, HdrSettings};
    use crate::source::{AuxSend, ConstantSource};
    use crate::spatial::DefaultPanner;

    const MAIN: DeviceId = DeviceId(1);

    fn graph() -> MixGraph {
        let settings = EngineSettings {
            frame_length: 64,
            ..EngineSettings::default()
        };
        let mut graph = MixGraph::new(settings, Arc::new(BuiltinPlugins), Arc::new(DefaultPanner))
            .expect("graph");
        graph
            .attach_device(MAIN, ChannelConfig::mono(), Vec::new(), SharedPanCache::default())
            .expect("attach");
        graph.set_main_device(Some(MAIN)).expect("main");
        graph
    }

    fn constant(value: f32) -> Box<ConstantSource> {
        Box::new(ConstantSource::new(ChannelConfig::mono(), value))
    }

    fn frame(graph: &mut MixGraph) -> Option<f32> {
        graph.run_frame();
        let out = graph
            .device_output(MAIN)
            .filter(|b| b.state() != BufferState::NoDataReady)
            .map(|b| b.channel(0)[32]);
        graph.end_frame();
        graph.validate_topology().expect("topology");
        out
    }

    #[test]
    fn unrouted_voices_reach_the_main_device() {
        let mut graph = graph();
        graph
            .add_voice(constant(0.5), SourceFrameParams::default())
            .expect("voice");
        assert_eq!(frame(&mut graph), Some(0.5));
        assert_eq!(graph.stats().audible_voices, 1);
    }

    #[test]
    fn bus_instances_are_created_lazily_and_ordered_upstream_first() {
        let mut graph = graph();
        let music = graph.register_bus(BusSettings::named("music")).expect("bus");
        let mut stem = BusSettings::named("stem");
        stem.output = BusOutput::Parent { bus: music };
        stem.volume_db = -6.0;
        let stem = graph.register_bus(stem).expect("bus");
        assert!(graph.bus_instance(BusContext::global(stem)).is_none());

        graph
            .add_voice(constant(1.0), SourceFrameParams::routed_to(BusContext::global(stem)))
            .expect("voice");
        let out = frame(&mut graph).expect("output");
        assert!((out - crate::dsp::level::db_to_linear(-6.0)).abs() < 1e-4);

        let stem_node = graph.bus_instance(BusContext::global(stem)).expect("stem").id();
        let music_node = graph.bus_instance(BusContext::global(music)).expect("music").id();
        let order = graph.processing_order();
        let pos = |id| order.iter().position(|b| *b == id).expect("ordered");
        assert!(pos(stem_node) < pos(music_node));
    }

    #[test]
    fn non_feedback_cycles_are_rejected() {
        let mut graph = graph();
        let a = graph.register_bus(BusSettings::named("a")).expect("bus");
        let mut b = BusSettings::named("b");
        b.output = BusOutput::Parent { bus: a };
        let b = graph.register_bus(b).expect("bus");
        let b_node = graph.ensure_bus(BusContext::global(b)).expect("instance");
        let a_node = graph.bus_instance(BusContext::global(a)).expect("a").id();

        let err = graph
            .add_output_bus(NodeId::Bus(a_node), BusContext::global(b), ConnectionType::UserDefinedSend, 1.0)
            .expect_err("cycle");
        assert!(matches!(err, MixError::RoutingCycle { .. }));

        graph
            .add_output_bus(NodeId::Bus(a_node), BusContext::global(b), ConnectionType::Feedback, 0.5)
            .expect("feedback is allowed");
        assert!(graph.bus(a_node).expect("a").has_feedback());
        assert!(graph.bus(b_node).is_some());
        graph.validate_topology().expect("topology");
    }

    #[test]
    fn parent_loops_are_reported() {
        let mut graph = graph();
        let a = graph.register_bus(BusSettings::named("a")).expect("bus");
        let mut b = BusSettings::named("b");
        b.output = BusOutput::Parent { bus: a };
        let b = graph.register_bus(b).expect("bus");
        graph.bus_settings.get_mut(&a).expect("a").output = BusOutput::Parent { bus: b };
        let err = graph.ensure_bus(BusContext::global(a)).expect_err("loop");
        assert!(matches!(err, MixError::Topology(_)));
        graph.validate_topology().expect("unchanged");
    }

    #[test]
    fn finished_voices_and_idle_instances_are_collected() {
        let mut graph = graph();
        let sfx = graph.register_bus(BusSettings::named("sfx")).expect("bus");
        graph
            .add_voice(
                Box::new(ConstantSource::new(ChannelConfig::mono(), 0.25).with_length(100)),
                SourceFrameParams::routed_to(BusContext::global(sfx)),
            )
            .expect("voice");
        assert!(frame(&mut graph).is_some());
        assert!(frame(&mut graph).is_some());
        assert_eq!(graph.voices().count(), 0);

        for _ in 0..3 {
            frame(&mut graph);
        }
        assert!(graph.bus_instance(BusContext::global(sfx)).is_none());
        assert_eq!(graph.connection_count(), 0);
        assert!(graph.stats().buses_destroyed >= 1);
    }

    #[test]
    fn stopped_voices_fade_out_before_leaving() {
        let mut graph = graph();
        let id = graph
            .add_voice(constant(1.0), SourceFrameParams::default())
            .expect("voice");
        frame(&mut graph);
        graph.stop_voice(id).expect("stop");

        graph.run_frame();
        let out = graph.device_output(MAIN).expect("fade frame");
        assert!((out.channel(0)[0] - 1.0).abs() < 0.05);
        assert!(out.channel(0)[63] < 0.05);
        graph.end_frame();

        frame(&mut graph);
        assert!(graph.voice(id).is_none());
    }

    #[test]
    fn stopped_voices_release_manual_sends() {
        let mut graph = graph();
        let fx = graph.register_bus(BusSettings::named("fx")).expect("bus");
        let late = graph.register_bus(BusSettings::named("late")).expect("bus");
        let id = graph
            .add_voice(constant(1.0), SourceFrameParams::default())
            .expect("voice");
        graph
            .add_output_bus(NodeId::Voice(id), BusContext::global(fx), ConnectionType::UserDefinedSend, 1.0)
            .expect("send");
        frame(&mut graph);
        assert_eq!(graph.voice(id).expect("voice").mixable().connections().len(), 2);

        graph.stop_voice(id).expect("stop");
        graph
            .add_output_bus(NodeId::Voice(id), BusContext::global(late), ConnectionType::UserDefinedSend, 1.0)
            .expect("send after stop");
        for _ in 0..4 {
            frame(&mut graph);
        }
        assert!(graph.voice(id).is_none());
        assert_eq!(graph.stats().audible_voices, 0);

        for _ in 0..3 {
            frame(&mut graph);
        }
        assert!(graph.bus_instance(BusContext::global(fx)).is_none());
        assert!(graph.bus_instance(BusContext::global(late)).is_none());
        assert_eq!(graph.connection_count(), 0);
    }

    #[test]
    fn hdr_instances_outlive_their_voices_until_released() {
        let mut graph = graph();
        let mut settings = BusSettings::named("hdr");
        settings.hdr = Some(HdrSettings {
            threshold_db: -20.0,
            ratio: 1.0,
            release_ms: 20.0,
            active_range_db: 12.0,
        });
        let hdr = BusContext::global(graph.register_bus(settings).expect("bus"));
        graph
            .add_voice(
                Box::new(ConstantSource::new(ChannelConfig::mono(), 1.0).with_length(128)),
                SourceFrameParams {
                    envelope_db: 10.0,
                    ..SourceFrameParams::routed_to(hdr)
                },
            )
            .expect("voice");
        for _ in 0..4 {
            frame(&mut graph);
        }
        assert_eq!(graph.voices().count(), 0);

        let mut frames = 0;
        while let Some(node) = graph.bus_instance(hdr) {
            assert!(node.inputs().is_empty());
            assert!(
                node.hdr().is_some_and(HdrState::is_releasing),
                "released instance kept after frame {frames}"
            );
            frame(&mut graph);
            frames += 1;
            assert!(frames < 1000, "window never released");
        }
        assert!(frames > 20, "collected after {frames} frame(s)");
    }

    #[test]
    fn silent_aux_sends_are_collected() {
        let mut graph = graph();
        let reverb = graph.register_bus(BusSettings::named("reverb")).expect("bus");
        let send = AuxSend {
            bus: BusContext::global(reverb),
            listener: ListenerId(0),
            level: 0.5,
            kind: ConnectionType::GameDefinedSend,
            lpf: 0.0,
            hpf: 0.0,
        };
        let mut params = SourceFrameParams {
            aux_sends: vec![send],
            ..SourceFrameParams::default()
        };
        let voice = graph.add_voice(constant(1.0), params.clone()).expect("voice");
        frame(&mut graph);
        assert_eq!(graph.voice(voice).expect("voice").mixable().connections().len(), 2);

        params.aux_sends[0].level = 0.0;
        graph.set_voice_params(voice, params).expect("params");
        frame(&mut graph);
        frame(&mut graph);
        assert_eq!(graph.voice(voice).expect("voice").mixable().connections().len(), 1);
    }

    #[test]
    fn bus_aux_sends_follow_the_game_object() {
        let mut graph = graph();
        let verb = graph.register_bus(BusSettings::named("verb")).expect("bus");
        let mut dry = BusSettings::named("dry");
        dry.aux_sends = vec![BusAuxSend {
            bus: verb,
            level: 0.5,
            kind: ConnectionType::UserDefinedSend,
        }];
        let dry = graph.register_bus(dry).expect("bus");
        graph
            .add_voice(
                constant(1.0),
                SourceFrameParams::routed_to(BusContext::bus(dry, GameObjectId(7))),
            )
            .expect("voice");
        let out = frame(&mut graph).expect("output");
        assert!((out - 1.5).abs() < 1e-4);
        assert!(graph.bus_instance(BusContext::bus(verb, GameObjectId(7))).is_some());
    }

    #[test]
    fn hdr_buses_attenuate_their_voices() {
        let mut graph = graph();
        let mut hdr = BusSettings::named("hdr");
        hdr.hdr = Some(HdrSettings {
            threshold_db: -20.0,
            ratio: 1.0,
            release_ms: 0.0,
            active_range_db: 12.0,
        });
        let hdr = graph.register_bus(hdr).expect("bus");
        graph
            .add_voice(
                constant(1.0),
                SourceFrameParams {
                    envelope_db: 10.0,
                    ..SourceFrameParams::routed_to(BusContext::global(hdr))
                },
            )
            .expect("voice");
        frame(&mut graph);
        let out = frame(&mut graph).expect("output");
        // A 10 dB peak over a 0 dB path is pulled down by 10 dB.
        assert!((out - crate::dsp::level::db_to_linear(-10.0)).abs() < 1e-3);
        let node = graph.bus_instance(BusContext::global(hdr)).expect("hdr");
        assert!((node.hdr().expect("hdr state").window_top_db() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn detaching_a_device_drops_its_inputs() {
        let mut graph = graph();
        graph
            .add_voice(constant(0.5), SourceFrameParams::default())
            .expect("voice");
        frame(&mut graph);
        assert_eq!(graph.connection_count(), 1);
        graph.detach_device(MAIN).expect("detach");
        assert_eq!(graph.connection_count(), 0);
        assert_eq!(graph.main_device(), None);
        graph.validate_topology().expect("topology");
        assert_eq!(frame(&mut graph), None);
    }
}

//! Directed edges from a mixable node to a destination bus.

use serde::{Deserialize, Serialize};

use super::context::BusContext;
use crate::audio::{ChannelConfig, MatrixRamp};
use crate::constants::SILENCE_DB;
use crate::dsp::filter::EdgeFilter;
use crate::dsp::level::db_to_linear;
use crate::dsp::ramp::VolumeRamp;
use crate::error::Result;
use crate::ids::{BusNodeId, ConnectionId, ListenerId, NodeId};
use crate::source::Ray;

/// Kind of route a connection realizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Direct,
    GameDefinedSend,
    UserDefinedSend,
    /// Send rendered from the source's previous frame.
    Feedback,
    Reflections,
}

impl ConnectionType {
    pub fn is_aux(self) -> bool {
        matches!(
            self,
            ConnectionType::GameDefinedSend
                | ConnectionType::UserDefinedSend
                | ConnectionType::Reflections
        )
    }

    /// The per-ray gain that drives this kind of connection.
    pub fn ray_gain(self, ray: &Ray) -> f32 {
        match self {
            ConnectionType::Direct | ConnectionType::Feedback => ray.dry,
            ConnectionType::GameDefinedSend | ConnectionType::Reflections => ray.game_aux,
            ConnectionType::UserDefinedSend => ray.user_aux,
        }
    }
}

/// Maximum gain over the rays heard by `listener`; 1.0 when no rays exist.
pub fn ray_gain_for(kind: ConnectionType, listener: ListenerId, rays: &[Ray]) -> f32 {
    if rays.is_empty() {
        return 1.0;
    }
    rays.iter()
        .filter(|ray| ray.listener == listener)
        .map(|ray| kind.ray_gain(ray))
        .fold(0.0_f32, f32::max)
}

/// Lifecycle of a connection as seen by the graph's garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOrigin {
    /// Derived every frame from the owner's routing parameters.
    Automatic,
    /// Created explicitly and kept until removal is requested.
    Manual { removal_requested: bool },
}

/// An edge from a voice or bus into a bus.
///
/// Owned by its source; the destination only lists its id.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    source: NodeId,
    destination: BusNodeId,
    context: BusContext,
    kind: ConnectionType,
    listener: ListenerId,
    hdr_bus: Option<BusNodeId>,
    origin: RouteOrigin,
    pub(crate) control: f32,
    volume: VolumeRamp,
    ray_volume: VolumeRamp,
    hdr_gain: VolumeRamp,
    matrix: Option<MatrixRamp>,
    matrix_reallocated: bool,
    pub(crate) filter: EdgeFilter,
    downstream_gain_db: f32,
    prev_silent: bool,
    next_silent: bool,
    is_new: bool,
    stale: bool,
    skip_render: bool,
    window_top_db: f32,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnectionId,
        source: NodeId,
        destination: BusNodeId,
        context: BusContext,
        kind: ConnectionType,
        listener: ListenerId,
        hdr_bus: Option<BusNodeId>,
        start_silent: bool,
    ) -> Self {
        let initial = if start_silent { 0.0 } else { 1.0 };
        Self {
            id,
            source,
            destination,
            context,
            kind,
            listener,
            hdr_bus,
            origin: RouteOrigin::Automatic,
            control: 0.0,
            volume: VolumeRamp::constant(initial),
            ray_volume: VolumeRamp::constant(1.0),
            hdr_gain: VolumeRamp::constant(1.0),
            matrix: None,
            matrix_reallocated: false,
            filter: EdgeFilter::default(),
            downstream_gain_db: SILENCE_DB,
            prev_silent: start_silent,
            next_silent: start_silent,
            is_new: true,
            stale: false,
            skip_render: true,
            window_top_db: 0.0,
        }
    }

    pub(crate) fn with_origin(mut self, origin: RouteOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn destination(&self) -> BusNodeId {
        self.destination
    }

    pub fn context(&self) -> BusContext {
        self.context
    }

    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    pub fn hdr_bus(&self) -> Option<BusNodeId> {
        self.hdr_bus
    }

    pub fn origin(&self) -> RouteOrigin {
        self.origin
    }

    pub fn volume(&self) -> VolumeRamp {
        self.volume
    }

    pub fn ray_volume(&self) -> VolumeRamp {
        self.ray_volume
    }

    pub fn hdr_gain(&self) -> VolumeRamp {
        self.hdr_gain
    }

    /// Base, ray and HDR gains collapsed into one ramp.
    pub fn gain_ramp(&self) -> VolumeRamp {
        self.volume.scaled(self.ray_volume).scaled(self.hdr_gain)
    }

    pub fn matrix(&self) -> Option<&MatrixRamp> {
        self.matrix.as_ref()
    }

    pub(crate) fn matrix_mut(&mut self) -> Option<&mut MatrixRamp> {
        self.matrix.as_mut()
    }

    /// Filter, collapsed gain and matrix, borrowed for mixing.
    pub(crate) fn mix_parts(&mut self) -> Option<(&mut EdgeFilter, VolumeRamp, &MatrixRamp)> {
        let gain = self.gain_ramp();
        let matrix = self.matrix.as_ref()?;
        Some((&mut self.filter, gain, matrix))
    }

    pub fn downstream_gain_db(&self) -> f32 {
        self.downstream_gain_db
    }

    pub fn is_prev_silent(&self) -> bool {
        self.prev_silent
    }

    pub fn is_next_silent(&self) -> bool {
        self.next_silent
    }

    /// Silent on both edges of the current frame.
    pub fn is_silent(&self) -> bool {
        self.prev_silent && self.next_silent
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn window_top_db(&self) -> f32 {
        self.window_top_db
    }

    pub(crate) fn skips_render(&self) -> bool {
        self.skip_render || self.matrix.is_none()
    }

    pub(crate) fn set_skip_render(&mut self, skip: bool) {
        self.skip_render = skip;
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    pub(crate) fn request_removal(&mut self) {
        if let RouteOrigin::Manual { removal_requested } = &mut self.origin {
            *removal_requested = true;
        }
        self.stale = true;
    }

    /// True once the route is unused and confirmed silent on both edges.
    pub fn is_collectable(&self) -> bool {
        let unused = match self.origin {
            RouteOrigin::Automatic => self.stale || (self.kind.is_aux() && self.control <= 0.0),
            RouteOrigin::Manual { removal_requested } => removal_requested,
        };
        unused && self.is_silent()
    }

    /// Advance to a new frame and set the gains it ends on.
    ///
    /// `cumulative_downstream_db` is the dB sum of every gain between the
    /// source and the device. A zero gain makes the next edge silent
    /// unconditionally and the previous one too when it was already zero.
    pub(crate) fn update_volumes(
        &mut self,
        ray_gain: f32,
        connection_gain: f32,
        cumulative_downstream_db: f32,
        evaluate_audibility: bool,
        threshold_db: f32,
    ) {
        self.volume.rotate();
        self.ray_volume.rotate();
        self.hdr_gain.rotate();
        self.prev_silent = self.next_silent;

        let connection_gain = sanitize_gain(connection_gain);
        let ray_gain = sanitize_gain(ray_gain);
        self.volume.next = connection_gain;
        self.ray_volume.next = ray_gain;
        self.hdr_gain.next = 1.0;
        self.downstream_gain_db = cumulative_downstream_db;

        if connection_gain * ray_gain <= 0.0 {
            self.next_silent = true;
            if self.volume.prev * self.ray_volume.prev <= 0.0 {
                self.prev_silent = true;
            }
        } else if evaluate_audibility {
            self.next_silent = cumulative_downstream_db <= threshold_db;
        } else {
            self.next_silent = false;
        }
    }

    /// Fade to silence by the end of this frame.
    pub(crate) fn force_next_silent(&mut self) {
        self.volume.next = 0.0;
        self.next_silent = true;
    }

    /// First rendered frame: either jump straight to the target gain or
    /// fade in from silence.
    pub(crate) fn prepare_first_frame(&mut self, fade_in: bool) {
        if fade_in {
            self.volume.prev = 0.0;
            self.prev_silent = true;
        } else {
            self.volume.prev = self.volume.next;
            self.ray_volume.prev = self.ray_volume.next;
            self.hdr_gain.prev = self.hdr_gain.next;
            self.prev_silent = self.next_silent;
        }
    }

    pub(crate) fn mark_rendered(&mut self) {
        self.is_new = false;
    }

    /// Reuse the matrix when the layout is unchanged, otherwise reallocate it
    /// with a zeroed start state and reset the filters.
    pub(crate) fn reset_matrix_and_filters(
        &mut self,
        input: ChannelConfig,
        output: ChannelConfig,
    ) -> Result<()> {
        let dims = (input.channels(), output.channels());
        if let Some(matrix) = self.matrix.as_mut().filter(|m| m.dims() == dims) {
            matrix.rotate();
            self.matrix_reallocated = false;
            return Ok(());
        }
        self.matrix = None;
        self.matrix = Some(MatrixRamp::try_new(dims.0, dims.1)?);
        self.matrix_reallocated = true;
        self.filter.reset();
        Ok(())
    }

    pub(crate) fn matrix_reallocated(&self) -> bool {
        self.matrix_reallocated
    }

    /// Scale the frame's end gain by the HDR attenuation of its HDR bus.
    pub(crate) fn apply_hdr_attenuation(&mut self, attenuation_db: f32, window_top_db: f32) {
        self.hdr_gain.next = db_to_linear(attenuation_db);
        self.window_top_db = window_top_db;
    }
}

fn sanitize_gain(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.max(0.0)
    } else {
        0.0
    }
}

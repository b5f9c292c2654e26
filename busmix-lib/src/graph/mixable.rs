//! Outgoing-connection bookkeeping shared by voices and buses.

use super::connection::{ray_gain_for, Connection, ConnectionType, RouteOrigin};
use super::context::BusContext;
use crate::audio::ChannelConfig;
use crate::constants::SILENCE_DB;
use crate::dsp::level::linear_to_db;
use crate::error::{try_reserve, Result};
use crate::ids::{BusNodeId, ConnectionId, ListenerId};
use crate::source::{Ray, Spatialization};
use crate::spatial::{Panner, SharedPanCache};

/// A route the owner wants this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Route {
    pub context: BusContext,
    pub kind: ConnectionType,
    pub listener: ListenerId,
    /// Linear control value.
    pub control: f32,
    pub lpf: f32,
    pub hpf: f32,
}

impl Route {
    pub fn new(context: BusContext, kind: ConnectionType, listener: ListenerId, control: f32) -> Self {
        Self {
            context,
            kind,
            listener,
            control,
            lpf: 0.0,
            hpf: 0.0,
        }
    }

    fn matches(&self, connection: &Connection) -> bool {
        self.context == connection.context()
            && self.kind == connection.kind()
            && self.listener == connection.listener()
    }
}

/// Append `route`, summing its control into an existing route to the same
/// bus, kind and listener.
pub fn merge_route(routes: &mut Vec<Route>, route: Route) {
    if let Some(existing) = routes.iter_mut().find(|r| {
        r.context == route.context && r.kind == route.kind && r.listener == route.listener
    }) {
        existing.control += route.control;
        existing.lpf = existing.lpf.min(route.lpf);
        existing.hpf = existing.hpf.min(route.hpf);
        return;
    }
    routes.push(route);
}

/// Inputs to [`Mixable::update_connections`].
pub(crate) struct ConnectionUpdate<'a> {
    pub behavioral_volume: f32,
    pub routes: &'a [Route],
    pub rays: &'a [Ray],
    pub envelope_db: f32,
    pub evaluate_audibility: bool,
    pub threshold_db: f32,
}

/// Inputs to [`Mixable::get_volumes`].
pub(crate) struct VolumeParams<'a> {
    pub input: ChannelConfig,
    pub forced_virtual: bool,
    pub start_with_fade_in: bool,
    pub spatialization: Spatialization,
    pub rays: &'a [Ray],
    pub panner: &'a dyn Panner,
}

/// Resolves the layout and pan cache of a destination bus.
pub(crate) trait DestinationLookup {
    fn destination(&self, bus: BusNodeId) -> Option<(ChannelConfig, Option<&SharedPanCache>)>;
}

/// The outgoing side of a voice or bus.
#[derive(Debug, Clone)]
pub struct Mixable {
    connections: Vec<Connection>,
    behavioral_volume: f32,
    max_downstream_gain_db: f32,
    audible: bool,
    first_frame: bool,
    hdr_buses: Vec<BusNodeId>,
}

impl Default for Mixable {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            behavioral_volume: 1.0,
            max_downstream_gain_db: SILENCE_DB,
            audible: false,
            first_frame: true,
            hdr_buses: Vec::new(),
        }
    }
}

impl Mixable {
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub(crate) fn connections_mut(&mut self) -> &mut [Connection] {
        &mut self.connections
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id() == id)
    }

    pub(crate) fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.id() == id)
    }

    pub fn behavioral_volume(&self) -> f32 {
        self.behavioral_volume
    }

    pub fn max_downstream_gain_db(&self) -> f32 {
        self.max_downstream_gain_db
    }

    pub fn is_audible(&self) -> bool {
        self.audible
    }

    /// No frame has been rendered yet.
    pub(crate) fn is_first_frame(&self) -> bool {
        self.first_frame
    }

    pub(crate) fn has_automatic_route(&self, route: &Route) -> bool {
        self.connections
            .iter()
            .any(|c| c.origin() == RouteOrigin::Automatic && route.matches(c))
    }

    pub(crate) fn push_connection(&mut self, connection: Connection) -> Result<()> {
        try_reserve(&mut self.connections, 1, "connection")?;
        self.connections.push(connection);
        Ok(())
    }

    pub(crate) fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let index = self.connections.iter().position(|c| c.id() == id)?;
        Some(self.connections.swap_remove(index))
    }

    /// Ids of connections that are unused and silent on both edges.
    pub(crate) fn collectable(&self) -> impl Iterator<Item = (ConnectionId, BusNodeId)> + '_ {
        self.connections
            .iter()
            .filter(|c| c.is_collectable())
            .map(|c| (c.id(), c.destination()))
    }

    /// Recompute every connection's gain for the coming frame.
    ///
    /// `downstream` yields the cumulative downstream gain of a destination
    /// bus; `push_peak` receives HDR peaks when audibility is evaluated.
    pub(crate) fn update_connections(
        &mut self,
        update: &ConnectionUpdate<'_>,
        downstream: impl Fn(BusNodeId) -> Option<f32>,
        mut push_peak: impl FnMut(BusNodeId, f32),
    ) {
        self.behavioral_volume = sanitize_volume(update.behavioral_volume);
        self.hdr_buses.clear();
        let mut max_db = SILENCE_DB;

        for conn in self.connections.iter_mut() {
            let (control, lpf, hpf) = match conn.origin() {
                RouteOrigin::Manual { removal_requested } => {
                    let control = if removal_requested { 0.0 } else { conn.control };
                    (control, conn.filter.lpf(), conn.filter.hpf())
                }
                RouteOrigin::Automatic => match update.routes.iter().find(|r| r.matches(conn)) {
                    Some(route) => {
                        conn.set_stale(false);
                        (route.control, route.lpf, route.hpf)
                    }
                    None => {
                        conn.set_stale(true);
                        (0.0, conn.filter.lpf(), conn.filter.hpf())
                    }
                },
            };
            conn.control = control;
            conn.filter.set_params(lpf, hpf);

            let ray_gain = ray_gain_for(conn.kind(), conn.listener(), update.rays);
            let connection_gain = self.behavioral_volume * control;
            let combined = connection_gain * ray_gain;
            let destination_db = downstream(conn.destination()).unwrap_or(SILENCE_DB);
            let cumulative_db = if combined > 0.0 {
                linear_to_db(combined) + destination_db
            } else {
                SILENCE_DB
            };
            conn.update_volumes(
                ray_gain,
                connection_gain,
                cumulative_db,
                update.evaluate_audibility,
                update.threshold_db,
            );
            max_db = max_db.max(cumulative_db);

            if let Some(hdr) = conn.hdr_bus() {
                if update.evaluate_audibility && !conn.is_next_silent() {
                    push_peak(hdr, cumulative_db + update.envelope_db);
                }
                if !self.hdr_buses.contains(&hdr) {
                    self.hdr_buses.push(hdr);
                }
            }
        }

        self.max_downstream_gain_db = max_db;
    }

    /// Apply each HDR bus's attenuation to the connections feeding it.
    ///
    /// `lookup` yields `(attenuation_db, window_top_db)` per HDR bus.
    pub(crate) fn update_hdr(&mut self, lookup: impl Fn(BusNodeId) -> Option<(f32, f32)>) {
        for hdr in self.hdr_buses.iter().copied() {
            let Some((attenuation_db, window_top_db)) = lookup(hdr) else {
                continue;
            };
            for conn in self
                .connections
                .iter_mut()
                .filter(|c| c.hdr_bus() == Some(hdr))
            {
                conn.apply_hdr_attenuation(attenuation_db, window_top_db);
            }
        }
    }

    /// Decide audibility and prepare speaker matrices for rendering.
    pub(crate) fn get_volumes(
        &mut self,
        params: &VolumeParams<'_>,
        destinations: &dyn DestinationLookup,
    ) -> bool {
        let first_frame = self.first_frame;
        let fade_in = params.start_with_fade_in && first_frame;

        if params.forced_virtual {
            for conn in self.connections.iter_mut() {
                conn.force_next_silent();
            }
        }
        if first_frame {
            for conn in self.connections.iter_mut().filter(|c| c.is_new()) {
                conn.prepare_first_frame(fade_in);
            }
        }

        let audible = if first_frame {
            self.connections.iter().any(|c| !c.is_next_silent())
        } else {
            self.connections.iter().any(|c| !c.is_silent())
        };
        self.audible = audible;
        self.first_frame = false;

        if !audible || params.input.channels() == 0 {
            for conn in self.connections.iter_mut() {
                conn.set_skip_render(true);
            }
            return audible;
        }

        for conn in self.connections.iter_mut() {
            if conn.is_silent() {
                conn.set_skip_render(true);
                continue;
            }
            let Some((output, cache)) = destinations.destination(conn.destination()) else {
                conn.set_skip_render(true);
                continue;
            };
            if let Err(err) = conn.reset_matrix_and_filters(params.input, output) {
                log::error!("skipping {} this frame: {}", conn.id(), err);
                conn.set_skip_render(true);
                continue;
            }

            let gain_next = conn.volume().next * conn.ray_volume().next;
            let snap_prev = if conn.is_new() {
                !fade_in
            } else {
                conn.is_prev_silent() && !conn.matrix_reallocated()
            };
            let (kind, listener) = (conn.kind(), conn.listener());
            let Some(matrix) = conn.matrix_mut() else {
                continue;
            };
            if gain_next <= 0.0 {
                matrix.next.fill(0.0);
            } else {
                match params.spatialization {
                    Spatialization::ThreeD if !params.rays.is_empty() => params.panner.pan_3d(
                        params.rays,
                        kind,
                        listener,
                        params.input,
                        output,
                        cache,
                        &mut matrix.next,
                    ),
                    Spatialization::ThreeD => {
                        params.panner.pan_2d(0.0, params.input, output, &mut matrix.next)
                    }
                    Spatialization::TwoD { pan } => {
                        params.panner.pan_2d(pan, params.input, output, &mut matrix.next)
                    }
                }
            }
            if snap_prev {
                matrix.snap_prev_to_next();
            }
            conn.mark_rendered();
            conn.set_skip_render(false);
        }

        audible
    }
}

fn sanitize_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.max(0.0)
    } else {
        0.0
    }
}

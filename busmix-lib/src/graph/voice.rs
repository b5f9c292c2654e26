//! Voices: a sample source plus the connections it feeds.

use super::connection::{ConnectionType, RouteOrigin};
use super::context::BusContext;
use super::mixable::{merge_route, Mixable, Route};
use crate::audio::{AudioBuffer, BufferState, ChannelConfig};
use crate::error::Result;
use crate::ids::{DeviceId, ListenerId, VoiceId};
use crate::source::{SourceFrameParams, VoiceSource};

pub struct VoiceNode {
    id: VoiceId,
    source: Box<dyn VoiceSource>,
    config: ChannelConfig,
    pub(crate) params: SourceFrameParams,
    pub(crate) mixable: Mixable,
    pub(crate) routes: Vec<Route>,
    pub(crate) buffer: AudioBuffer,
    stopping: bool,
    ended: bool,
}

impl std::fmt::Debug for VoiceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceNode")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("connections", &self.mixable.connections().len())
            .field("stopping", &self.stopping)
            .field("ended", &self.ended)
            .finish()
    }
}

impl VoiceNode {
    pub(crate) fn new(
        id: VoiceId,
        source: Box<dyn VoiceSource>,
        params: SourceFrameParams,
        frame_length: usize,
    ) -> Result<Self> {
        let config = source.channel_config();
        config.validate()?;
        let buffer = AudioBuffer::try_new(config, frame_length)?;
        Ok(Self {
            id,
            source,
            config,
            params,
            mixable: Mixable::default(),
            routes: Vec::new(),
            buffer,
            stopping: false,
            ended: false,
        })
    }

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    pub fn params(&self) -> &SourceFrameParams {
        &self.params
    }

    pub fn mixable(&self) -> &Mixable {
        &self.mixable
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub(crate) fn stop(&mut self) {
        self.stopping = true;
        self.release_manual_routes();
    }

    fn release_manual_routes(&mut self) {
        for conn in self.mixable.connections_mut() {
            if matches!(conn.origin(), RouteOrigin::Manual { .. }) {
                conn.request_removal();
            }
        }
    }

    /// Ready to be dropped from the graph.
    pub(crate) fn is_done(&self) -> bool {
        self.ended || (self.stopping && self.mixable.connections().is_empty())
    }

    /// Rebuild this frame's wanted routes.
    ///
    /// Without an explicit output bus the dry path goes to every device mix
    /// bus that hears the voice's listener.
    pub(crate) fn rebuild_routes(&mut self, devices: &[(DeviceId, bool)]) {
        self.routes.clear();
        if self.stopping {
            // Sends added after the stop fade out with the rest.
            self.release_manual_routes();
            return;
        }
        let params = &self.params;
        let dry = |context: BusContext| Route {
            context,
            kind: ConnectionType::Direct,
            listener: params.listener,
            control: params.output_bus_volume,
            lpf: params.output_bus_lpf,
            hpf: params.output_bus_hpf,
        };
        match params.output_bus {
            Some(context) => merge_route(&mut self.routes, dry(context)),
            None => {
                for (device, hears) in devices {
                    if *hears {
                        merge_route(&mut self.routes, dry(BusContext::device(*device)));
                    }
                }
            }
        }
        for send in &params.aux_sends {
            merge_route(
                &mut self.routes,
                Route {
                    context: send.bus,
                    kind: send.kind,
                    listener: send.listener,
                    control: send.level,
                    lpf: send.lpf,
                    hpf: send.hpf,
                },
            );
        }
    }

    pub(crate) fn listener(&self) -> ListenerId {
        self.params.listener
    }

    /// Pull one frame from the source, or skip it while inaudible.
    pub(crate) fn render(&mut self) {
        if !self.mixable.is_audible() {
            self.buffer.clear();
            self.source.skip(self.buffer.max_frames());
            self.ended |= self.source.is_finished();
            return;
        }
        self.buffer.clear();
        self.source.render(&mut self.buffer);
        if self.buffer.state() == BufferState::NoMoreData || self.source.is_finished() {
            self.ended = true;
        }
    }
}

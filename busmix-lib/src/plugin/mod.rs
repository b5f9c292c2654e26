//! Interfaces between bus nodes and their insert effects / custom mixers.
//!
//! Plugins never see the graph. Everything they may ask about (downstream
//! gain, parent layout, media) is answered by a [`PluginContext`] built from
//! state the bus cached during the update pass.

mod fold;
mod gain;
mod low_pass;
mod summing;

pub use fold::{FoldEffect, FoldSettings};
pub use gain::{GainEffect, GainSettings};
pub use low_pass::{LowPassEffect, LowPassSettings};
pub use summing::SummingMixer;

use serde::de::DeserializeOwned;

use crate::audio::{AudioBuffer, ChannelConfig, MatrixRamp};
use crate::dsp::ramp::VolumeRamp;
use crate::error::PluginError;
use crate::graph::ConnectionType;
use crate::ids::{ListenerId, NodeId};
use crate::settings::EffectSlotSettings;

/// Host services available to a plugin while it runs.
pub trait PluginContext {
    fn sample_rate(&self) -> u32;

    /// Linear gain between the bus output and the device.
    fn downstream_gain(&self) -> f32;

    /// Layout of the bus this bus outputs to.
    fn parent_channel_config(&self) -> ChannelConfig;

    fn media(&self, index: usize) -> Option<&[u8]>;

    fn custom_game_data(&self, index: usize) -> Option<&[u8]>;

    fn post_monitor_message(&self, message: &str);

    fn post_error(&self, error: &PluginError);
}

/// Buffers an effect processes.
pub enum EffectIo<'a> {
    InPlace(&'a mut AudioBuffer),
    OutOfPlace {
        input: &'a AudioBuffer,
        output: &'a mut AudioBuffer,
    },
}

/// An insert effect on a bus.
pub trait EffectPlugin: Send {
    fn name(&self) -> &str;

    /// Prepare for `input` and return the layout the effect produces.
    fn init(
        &mut self,
        context: &dyn PluginContext,
        input: ChannelConfig,
    ) -> Result<ChannelConfig, PluginError>;

    /// In-place effects process the current buffer; others write their own.
    fn is_in_place(&self) -> bool {
        true
    }

    fn execute(&mut self, io: EffectIo<'_>, context: &dyn PluginContext);

    fn reset(&mut self) {}
}

/// One input as handed to a custom mixer: a filtered copy of the source and
/// the gains that have not been collapsed yet.
pub struct MixerInput<'a> {
    pub buffer: &'a AudioBuffer,
    pub source: NodeId,
    pub kind: ConnectionType,
    pub listener: ListenerId,
    pub volume: VolumeRamp,
    pub ray_volume: VolumeRamp,
    pub hdr_gain: VolumeRamp,
    pub matrix: &'a MatrixRamp,
}

impl MixerInput<'_> {
    pub fn collapsed_gain(&self) -> VolumeRamp {
        self.volume.scaled(self.ray_volume).scaled(self.hdr_gain)
    }
}

/// Replaces the built-in accumulation of a bus.
pub trait MixerPlugin: Send {
    fn name(&self) -> &str;

    fn init(&mut self, context: &dyn PluginContext, output: ChannelConfig)
        -> Result<(), PluginError>;

    fn consume_input(
        &mut self,
        input: &MixerInput<'_>,
        output: &mut AudioBuffer,
        context: &dyn PluginContext,
    );

    fn on_mix_done(&mut self, _output: &mut AudioBuffer, _context: &dyn PluginContext) {}

    fn on_effects_processed(&mut self, _output: &mut AudioBuffer, _context: &dyn PluginContext) {}

    fn on_frame_end(&mut self, _output: &mut AudioBuffer, _context: &dyn PluginContext) {}
}

/// Creates plugins by name.
pub trait PluginFactory: Send + Sync {
    fn create_effect(&self, slot: &EffectSlotSettings) -> Result<Box<dyn EffectPlugin>, PluginError>;

    fn create_mixer(&self, slot: &EffectSlotSettings) -> Result<Box<dyn MixerPlugin>, PluginError>;
}

/// Factory for the plugins shipped with the library.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinPlugins;

impl PluginFactory for BuiltinPlugins {
    fn create_effect(&self, slot: &EffectSlotSettings) -> Result<Box<dyn EffectPlugin>, PluginError> {
        match slot.plugin.as_str() {
            "gain" => Ok(Box::new(GainEffect::new(parse_params(slot)?))),
            "low_pass" | "lowpass" => Ok(Box::new(LowPassEffect::new(parse_params(slot)?))),
            "fold" | "downmix" => Ok(Box::new(FoldEffect::new(parse_params(slot)?))),
            other => Err(PluginError::UnknownPlugin(other.to_string())),
        }
    }

    fn create_mixer(&self, slot: &EffectSlotSettings) -> Result<Box<dyn MixerPlugin>, PluginError> {
        match slot.plugin.as_str() {
            "summing" | "sum" => Ok(Box::new(SummingMixer::default())),
            other => Err(PluginError::UnknownPlugin(other.to_string())),
        }
    }
}

/// Deserialize slot parameters, treating `null` as all defaults.
pub fn parse_params<T>(slot: &EffectSlotSettings) -> Result<T, PluginError>
where
    T: DeserializeOwned + Default,
{
    if slot.params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(slot.params.clone()).map_err(|err| PluginError::InvalidParams {
        plugin: slot.plugin.clone(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;

    /// Context answering with fixed values and recording posted messages.
    pub(crate) struct FixedContext {
        pub(crate) parent: ChannelConfig,
        pub(crate) messages: RefCell<Vec<String>>,
    }

    impl Default for FixedContext {
        fn default() -> Self {
            Self {
                parent: ChannelConfig::stereo(),
                messages: RefCell::new(Vec::new()),
            }
        }
    }

    impl PluginContext for FixedContext {
        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn downstream_gain(&self) -> f32 {
            1.0
        }

        fn parent_channel_config(&self) -> ChannelConfig {
            self.parent
        }

        fn media(&self, _index: usize) -> Option<&[u8]> {
            None
        }

        fn custom_game_data(&self, _index: usize) -> Option<&[u8]> {
            None
        }

        fn post_monitor_message(&self, message: &str) {
            self.messages.borrow_mut().push(message.to_string());
        }

        fn post_error(&self, error: &PluginError) {
            self.messages.borrow_mut().push(error.to_string());
        }
    }
}

//! Simple gain effect.

use serde::{Deserialize, Serialize};

use super::{EffectIo, EffectPlugin, PluginContext};
use crate::audio::ChannelConfig;
use crate::dsp::level::deserialize_linear_gain;
use crate::error::PluginError;

const DEFAULT_GAIN: f32 = 1.0;

/// Serialized configuration for gain parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GainSettings {
    #[serde(deserialize_with = "deserialize_linear_gain")]
    pub gain: f32,
}

impl GainSettings {
    /// Create a gain settings payload.
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl Default for GainSettings {
    fn default() -> Self {
        Self { gain: DEFAULT_GAIN }
    }
}

/// In-place gain effect.
#[derive(Debug, Clone, Default)]
pub struct GainEffect {
    pub settings: GainSettings,
}

impl GainEffect {
    pub fn new(settings: GainSettings) -> Self {
        Self { settings }
    }
}

impl EffectPlugin for GainEffect {
    fn name(&self) -> &str {
        "gain"
    }

    fn init(
        &mut self,
        _context: &dyn PluginContext,
        input: ChannelConfig,
    ) -> Result<ChannelConfig, PluginError> {
        Ok(input)
    }

    fn execute(&mut self, io: EffectIo<'_>, _context: &dyn PluginContext) {
        let gain = sanitize_gain(self.settings.gain);
        match io {
            EffectIo::InPlace(buffer) => {
                for ch in 0..buffer.num_channels() {
                    for sample in buffer.channel_mut(ch).iter_mut() {
                        *sample *= gain;
                    }
                }
            }
            EffectIo::OutOfPlace { input, output } => {
                output.copy_from(input);
                for ch in 0..output.num_channels() {
                    for sample in output.channel_mut(ch).iter_mut() {
                        *sample *= gain;
                    }
                }
            }
        }
    }
}

fn sanitize_gain(gain: f32) -> f32 {
    if gain.is_finite() {
        gain
    } else {
        DEFAULT_GAIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioBuffer;
    use crate::dsp::level::db_to_linear;
    use crate::plugin::test_support::FixedContext;

    #[test]
    fn gain_scales_samples() {
        let mut effect = GainEffect::new(GainSettings::new(2.0));
        let mut buffer = AudioBuffer::try_new(ChannelConfig::mono(), 4).expect("allocate buffer");
        buffer.channel_mut(0).copy_from_slice(&[0.25, -0.25, 0.5, -0.5]);
        effect.execute(EffectIo::InPlace(&mut buffer), &FixedContext::default());
        assert_eq!(buffer.channel(0), &[0.5, -0.5, 1.0, -1.0]);
    }

    #[test]
    fn gain_deserializes_db_strings() {
        let settings: GainSettings =
            serde_json::from_str(r#"{"gain":"-2db"}"#).expect("deserialize gain");
        assert!((settings.gain - db_to_linear(-2.0)).abs() < 1e-6);
    }

    #[test]
    fn non_finite_gain_passes_through() {
        let mut effect = GainEffect::new(GainSettings::new(f32::NAN));
        let mut buffer = AudioBuffer::try_new(ChannelConfig::mono(), 2).expect("allocate buffer");
        buffer.channel_mut(0).copy_from_slice(&[0.5, 0.5]);
        effect.execute(EffectIo::InPlace(&mut buffer), &FixedContext::default());
        assert_eq!(buffer.channel(0), &[0.5, 0.5]);
    }
}

//! Low-pass insert effect.

use serde::{Deserialize, Serialize};

use super::{EffectIo, EffectPlugin, PluginContext};
use crate::audio::ChannelConfig;
use crate::dsp::biquad::{BiquadKind, BiquadState};
use crate::error::PluginError;

const DEFAULT_FREQ_HZ: f32 = 1000.0;
const DEFAULT_Q: f32 = 0.5;

/// Serialized configuration for low-pass filter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LowPassSettings {
    #[serde(alias = "freq", alias = "frequency_hz")]
    pub freq_hz: f32,
    #[serde(alias = "bandwidth")]
    pub q: f32,
}

impl Default for LowPassSettings {
    fn default() -> Self {
        Self {
            freq_hz: DEFAULT_FREQ_HZ,
            q: DEFAULT_Q,
        }
    }
}

/// In-place biquad low-pass.
#[derive(Debug, Clone, Default)]
pub struct LowPassEffect {
    pub settings: LowPassSettings,
    state: Option<BiquadState>,
}

impl LowPassEffect {
    pub fn new(settings: LowPassSettings) -> Self {
        Self {
            settings,
            state: None,
        }
    }

    fn filter(&mut self, buffer: &mut crate::audio::AudioBuffer) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        for ch in 0..buffer.num_channels() {
            state.process_channel(ch, buffer.channel_mut(ch));
        }
    }
}

impl EffectPlugin for LowPassEffect {
    fn name(&self) -> &str {
        "low_pass"
    }

    fn init(
        &mut self,
        context: &dyn PluginContext,
        input: ChannelConfig,
    ) -> Result<ChannelConfig, PluginError> {
        self.state = Some(BiquadState::new(
            BiquadKind::LowPass,
            context.sample_rate(),
            input.channels(),
            self.settings.freq_hz,
            self.settings.q,
        ));
        Ok(input)
    }

    fn execute(&mut self, io: EffectIo<'_>, _context: &dyn PluginContext) {
        match io {
            EffectIo::InPlace(buffer) => self.filter(buffer),
            EffectIo::OutOfPlace { input, output } => {
                output.copy_from(input);
                self.filter(output);
            }
        }
    }

    fn reset(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.reset();
        }
    }
}

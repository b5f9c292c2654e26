//! Out-of-place channel fold (downmix/upmix to a fixed channel count).

use serde::{Deserialize, Serialize};

use super::{EffectIo, EffectPlugin, PluginContext};
use crate::audio::ChannelConfig;
use crate::constants::MAX_CHANNELS;
use crate::error::PluginError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FoldSettings {
    /// Output channel count; 0 follows the parent bus layout.
    pub channels: u16,
}

impl Default for FoldSettings {
    fn default() -> Self {
        Self { channels: 0 }
    }
}

/// Sums input channel `i` into output channel `i % out`, normalizing by the
/// number of inputs folded into each output.
#[derive(Debug, Clone, Default)]
pub struct FoldEffect {
    pub settings: FoldSettings,
    input_channels: usize,
    output_channels: usize,
}

impl FoldEffect {
    pub fn new(settings: FoldSettings) -> Self {
        Self {
            settings,
            input_channels: 0,
            output_channels: 0,
        }
    }
}

impl EffectPlugin for FoldEffect {
    fn name(&self) -> &str {
        "fold"
    }

    fn init(
        &mut self,
        context: &dyn PluginContext,
        input: ChannelConfig,
    ) -> Result<ChannelConfig, PluginError> {
        let output = match self.settings.channels {
            0 => context.parent_channel_config(),
            n if n <= MAX_CHANNELS => ChannelConfig::anonymous(n),
            n => {
                return Err(PluginError::UnsupportedChannels {
                    plugin: "fold".into(),
                    channels: n,
                })
            }
        };
        if !output.is_valid() {
            return Err(PluginError::UnsupportedChannels {
                plugin: "fold".into(),
                channels: output.num_channels,
            });
        }
        self.input_channels = input.channels();
        self.output_channels = output.channels();
        Ok(output)
    }

    fn is_in_place(&self) -> bool {
        false
    }

    fn execute(&mut self, io: EffectIo<'_>, context: &dyn PluginContext) {
        let EffectIo::OutOfPlace { input, output } = io else {
            context.post_monitor_message("fold requires its own output buffer");
            return;
        };
        let out_channels = output.num_channels();
        if out_channels == 0 {
            return;
        }
        let frames = output.max_frames().min(input.max_frames());
        for out_ch in 0..out_channels {
            output.channel_mut(out_ch).fill(0.0);
        }
        for in_ch in 0..input.num_channels() {
            let out_ch = in_ch % out_channels;
            let folded = (input.num_channels() + out_channels - 1 - out_ch) / out_channels;
            let scale = 1.0 / (folded.max(1) as f32).sqrt();
            let dest = &mut output.channel_mut(out_ch)[..frames];
            for (out, sample) in dest.iter_mut().zip(&input.channel(in_ch)[..frames]) {
                *out += sample * scale;
            }
        }
        output.set_valid_frames(input.valid_frames());
        output.set_state(input.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBuffer, BufferState};
    use crate::plugin::test_support::FixedContext;

    #[test]
    fn stereo_folds_to_mono_at_equal_power() {
        let context = FixedContext::default();
        let mut effect = FoldEffect::new(FoldSettings { channels: 1 });
        let out_config = effect
            .init(&context, ChannelConfig::stereo())
            .expect("init fold");
        assert_eq!(out_config.channels(), 1);

        let mut input = AudioBuffer::try_new(ChannelConfig::stereo(), 4).expect("allocate");
        input.channel_mut(0).fill(1.0);
        input.channel_mut(1).fill(1.0);
        input.set_valid_frames(4);
        input.set_state(BufferState::DataReady);
        let mut output = AudioBuffer::try_new(out_config, 4).expect("allocate");
        effect.execute(
            EffectIo::OutOfPlace {
                input: &input,
                output: &mut output,
            },
            &context,
        );
        let expected = 2.0 / 2.0_f32.sqrt();
        assert!(output.channel(0).iter().all(|s| (*s - expected).abs() < 1e-5));
        assert_eq!(output.state(), BufferState::DataReady);
    }

    #[test]
    fn zero_channels_follows_the_parent() {
        let context = FixedContext {
            parent: ChannelConfig::quad(),
            ..FixedContext::default()
        };
        let mut effect = FoldEffect::default();
        assert_eq!(
            effect.init(&context, ChannelConfig::stereo()),
            Ok(ChannelConfig::quad())
        );
    }

    #[test]
    fn oversized_layouts_are_rejected() {
        let mut effect = FoldEffect::new(FoldSettings { channels: 99 });
        assert!(effect
            .init(&FixedContext::default(), ChannelConfig::stereo())
            .is_err());
    }
}

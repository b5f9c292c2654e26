//! Custom mixer that reproduces the built-in accumulation and reports when
//! the number of inputs it mixes changes.

use super::{MixerInput, MixerPlugin, PluginContext};
use crate::audio::{AudioBuffer, ChannelConfig};
use crate::dsp::filter::EdgeFilter;
use crate::dsp::mix::mix_into;
use crate::error::PluginError;

#[derive(Debug, Default)]
pub struct SummingMixer {
    inputs_this_frame: usize,
    reported_inputs: usize,
    frames: u64,
    passthrough: EdgeFilter,
    scratch: Vec<f32>,
}

impl SummingMixer {
    pub fn inputs_this_frame(&self) -> usize {
        self.inputs_this_frame
    }
}

impl MixerPlugin for SummingMixer {
    fn name(&self) -> &str {
        "summing"
    }

    fn init(
        &mut self,
        _context: &dyn PluginContext,
        output: ChannelConfig,
    ) -> Result<(), PluginError> {
        if !output.is_valid() {
            return Err(PluginError::UnsupportedChannels {
                plugin: "summing".into(),
                channels: output.num_channels,
            });
        }
        Ok(())
    }

    fn consume_input(
        &mut self,
        input: &MixerInput<'_>,
        output: &mut AudioBuffer,
        _context: &dyn PluginContext,
    ) {
        mix_into(
            input.buffer,
            &mut self.passthrough,
            input.collapsed_gain(),
            input.matrix,
            output,
            &mut self.scratch,
        );
        self.inputs_this_frame += 1;
    }

    fn on_frame_end(&mut self, _output: &mut AudioBuffer, context: &dyn PluginContext) {
        self.frames += 1;
        if self.inputs_this_frame != self.reported_inputs {
            context.post_monitor_message(&format!(
                "frame {}: mixing {} input(s)",
                self.frames, self.inputs_this_frame
            ));
            self.reported_inputs = self.inputs_this_frame;
        }
        self.inputs_this_frame = 0;
    }
}

//! Built-in accumulation routine: filter, collapse gains, spread through the
//! speaker matrix and sum into the destination.

use super::filter::EdgeFilter;
use super::ramp::VolumeRamp;
use crate::audio::{AudioBuffer, MatrixRamp};

/// Accumulate `input` into `output`.
///
/// Each input channel is filtered (into `scratch` when a filter is active),
/// then added to every output channel with a gain interpolated from
/// `gain.prev * matrix.prev` to `gain.next * matrix.next` across the frame.
pub fn mix_into(
    input: &AudioBuffer,
    filter: &mut EdgeFilter,
    gain: VolumeRamp,
    matrix: &MatrixRamp,
    output: &mut AudioBuffer,
    scratch: &mut Vec<f32>,
) {
    let frames = output.max_frames().min(input.max_frames());
    if frames == 0 {
        return;
    }
    if scratch.len() < frames {
        scratch.resize(frames, 0.0);
    }
    let filtered = filter.is_active();
    let in_channels = input.num_channels().min(matrix.prev.in_channels());
    let out_channels = output.num_channels().min(matrix.prev.out_channels());

    for in_ch in 0..in_channels {
        let source: &[f32] = if filtered {
            let buf = &mut scratch[..frames];
            buf.copy_from_slice(&input.channel(in_ch)[..frames]);
            filter.process_channel(in_ch, buf);
            buf
        } else {
            &input.channel(in_ch)[..frames]
        };

        for out_ch in 0..out_channels {
            let start = gain.prev * matrix.prev.gain(in_ch, out_ch);
            let end = gain.next * matrix.next.gain(in_ch, out_ch);
            if start == 0.0 && end == 0.0 {
                continue;
            }
            let dest = &mut output.channel_mut(out_ch)[..frames];
            if start == end {
                for (out, sample) in dest.iter_mut().zip(source) {
                    *out += sample * start;
                }
            } else {
                let step = (end - start) / frames as f32;
                let mut g = start;
                for (out, sample) in dest.iter_mut().zip(source) {
                    *out += sample * g;
                    g += step;
                }
            }
        }
    }
}

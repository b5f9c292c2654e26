//! Speaker-matrix computation for 2D panning and ray-based 3D positioning.

mod cache;

pub use cache::{PanCache, SharedPanCache};

use std::f32::consts::{FRAC_PI_2, PI};

use crate::audio::channels::wrap_angle;
use crate::audio::{ChannelConfig, SpeakerMatrix};
use crate::constants::MAX_CHANNELS;
use crate::graph::ConnectionType;
use crate::ids::ListenerId;
use crate::source::Ray;

/// Azimuth a full 2D pan reaches (the stereo speaker angle).
const PAN_SPAN: f32 = PI / 6.0;

/// Fills speaker matrices for connections.
pub trait Panner: Send + Sync {
    /// Position a source with a left/right pan in `[-1, 1]`.
    fn pan_2d(
        &self,
        pan: f32,
        input: ChannelConfig,
        output: ChannelConfig,
        matrix: &mut SpeakerMatrix,
    );

    /// Position a source from the rays heard by `listener`.
    #[allow(clippy::too_many_arguments)]
    fn pan_3d(
        &self,
        rays: &[Ray],
        kind: ConnectionType,
        listener: ListenerId,
        input: ChannelConfig,
        output: ChannelConfig,
        cache: Option<&SharedPanCache>,
        matrix: &mut SpeakerMatrix,
    );
}

/// Pairwise constant-power panner over the output's speaker positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPanner;

impl Panner for DefaultPanner {
    fn pan_2d(
        &self,
        pan: f32,
        input: ChannelConfig,
        output: ChannelConfig,
        matrix: &mut SpeakerMatrix,
    ) {
        matrix.fill(0.0);
        let pan = if pan.is_finite() { pan.clamp(-1.0, 1.0) } else { 0.0 };
        let in_azimuths = input.speaker_azimuths();

        if input == output {
            let left = (1.0 - pan).min(1.0);
            let right = (1.0 + pan).min(1.0);
            for (ch, azimuth) in in_azimuths.iter().enumerate() {
                let gain = match azimuth {
                    Some(a) if *a < 0.0 => left,
                    Some(a) if *a > 0.0 => right,
                    _ => 1.0,
                };
                matrix.set(ch, ch, gain);
            }
            return;
        }

        let lfe_out = output.lfe_index();
        for (ch, azimuth) in in_azimuths.iter().enumerate() {
            match azimuth {
                None => {
                    if let Some(out) = lfe_out {
                        matrix.set(ch, out, 1.0);
                    }
                }
                Some(a) => {
                    let position = if input.channels() == 1 {
                        pan * PAN_SPAN
                    } else {
                        *a + pan * PAN_SPAN
                    };
                    speaker_gains(position, output, matrix.row_mut(ch));
                }
            }
        }
    }

    fn pan_3d(
        &self,
        rays: &[Ray],
        kind: ConnectionType,
        listener: ListenerId,
        input: ChannelConfig,
        output: ChannelConfig,
        cache: Option<&SharedPanCache>,
        matrix: &mut SpeakerMatrix,
    ) {
        matrix.fill(0.0);
        let loudest = rays
            .iter()
            .filter(|ray| ray.listener == listener)
            .map(|ray| kind.ray_gain(ray))
            .fold(0.0_f32, f32::max);
        if loudest <= 0.0 {
            return;
        }

        let in_azimuths = input.speaker_azimuths();
        let lfe_out = output.lfe_index();
        let mut guard = cache.map(|cache| cache.lock());
        let mut scratch = [0.0_f32; MAX_CHANNELS as usize];
        let out_channels = output.channels().min(scratch.len());

        for ray in rays.iter().filter(|ray| ray.listener == listener) {
            let weight = kind.ray_gain(ray) / loudest;
            if weight <= 0.0 {
                continue;
            }
            let spread = if ray.spread.is_finite() { ray.spread.clamp(0.0, 1.0) } else { 0.0 };
            for (ch, azimuth) in in_azimuths.iter().enumerate() {
                let Some(channel_azimuth) = azimuth else {
                    if let Some(out) = lfe_out {
                        let current = matrix.gain(ch, out);
                        matrix.set(ch, out, current.max(weight));
                    }
                    continue;
                };
                let position = wrap_angle(ray.azimuth + channel_azimuth * spread);
                let gains = &mut scratch[..out_channels];
                match guard.as_mut() {
                    Some(cache) => gains.copy_from_slice(&cache.gains(output, position)[..out_channels]),
                    None => speaker_gains(position, output, gains),
                }
                for (out, gain) in gains.iter().enumerate() {
                    let current = matrix.gain(ch, out);
                    matrix.set(ch, out, current + gain * weight);
                }
            }
        }

        for ch in 0..input.channels() {
            let row = matrix.row_mut(ch);
            let power: f32 = row.iter().map(|g| g * g).sum();
            if power > 1.0 {
                let norm = power.sqrt().recip();
                for gain in row.iter_mut() {
                    *gain *= norm;
                }
            }
        }
    }
}

/// Constant-power gains placing a point source at `azimuth` between the two
/// nearest output speakers.
pub fn speaker_gains(azimuth: f32, output: ChannelConfig, gains: &mut [f32]) {
    gains.fill(0.0);
    let mut positioned = [(0_usize, 0.0_f32); MAX_CHANNELS as usize];
    let mut count = 0;
    for (index, angle) in output.speaker_azimuths().iter().enumerate().take(gains.len()) {
        if let Some(angle) = angle {
            positioned[count] = (index, *angle);
            count += 1;
        }
    }
    let speakers = &mut positioned[..count];
    match speakers.len() {
        0 => return,
        1 => {
            gains[speakers[0].0] = 1.0;
            return;
        }
        _ => {}
    }
    speakers.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));

    let mut azimuth = wrap_angle(azimuth);
    let has_rear = speakers.iter().any(|(_, a)| a.abs() > FRAC_PI_2);
    if !has_rear {
        if azimuth.abs() > FRAC_PI_2 {
            azimuth = azimuth.signum() * (PI - azimuth.abs());
        }
        let (first, last) = (speakers[0], speakers[speakers.len() - 1]);
        if azimuth <= first.1 {
            gains[first.0] = 1.0;
            return;
        }
        if azimuth >= last.1 {
            gains[last.0] = 1.0;
            return;
        }
    }

    for i in 0..count {
        let (a_idx, a) = speakers[i];
        let (b_idx, b) = speakers[(i + 1) % count];
        let span = if i + 1 == count { b + 2.0 * PI - a } else { b - a };
        let mut offset = azimuth - a;
        if offset < 0.0 {
            offset += 2.0 * PI;
        }
        if span > 0.0 && offset <= span {
            let t = (offset / span) * FRAC_PI_2;
            gains[a_idx] = t.cos();
            gains[b_idx] = t.sin();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(input: ChannelConfig, output: ChannelConfig) -> SpeakerMatrix {
        SpeakerMatrix::try_zeroed(input.channels(), output.channels()).expect("allocate matrix")
    }

    #[test]
    fn mono_to_stereo_is_constant_power() {
        for step in -10..=10 {
            let pan = step as f32 / 10.0;
            let mut m = matrix(ChannelConfig::mono(), ChannelConfig::stereo());
            DefaultPanner.pan_2d(pan, ChannelConfig::mono(), ChannelConfig::stereo(), &mut m);
            let energy = m.gain(0, 0).powi(2) + m.gain(0, 1).powi(2);
            assert!((energy - 1.0).abs() < 1e-4, "pan {pan} energy {energy}");
        }
        let mut m = matrix(ChannelConfig::mono(), ChannelConfig::stereo());
        DefaultPanner.pan_2d(-1.0, ChannelConfig::mono(), ChannelConfig::stereo(), &mut m);
        assert!((m.gain(0, 0) - 1.0).abs() < 1e-5);
        assert!(m.gain(0, 1).abs() < 1e-5);
    }

    #[test]
    fn matching_layouts_use_identity_with_balance() {
        let stereo = ChannelConfig::stereo();
        let mut m = matrix(stereo, stereo);
        DefaultPanner.pan_2d(0.0, stereo, stereo, &mut m);
        assert_eq!(m.row(0), &[1.0, 0.0]);
        assert_eq!(m.row(1), &[0.0, 1.0]);
        DefaultPanner.pan_2d(0.5, stereo, stereo, &mut m);
        assert_eq!(m.gain(0, 0), 0.5);
        assert_eq!(m.gain(1, 1), 1.0);
    }

    #[test]
    fn surround_lfe_routes_to_lfe() {
        let surround = ChannelConfig::surround_5_1();
        let mut m = matrix(ChannelConfig::stereo(), surround);
        DefaultPanner.pan_2d(0.0, ChannelConfig::stereo(), surround, &mut m);
        assert!((m.gain(0, 0) - 1.0).abs() < 1e-5);
        assert!((m.gain(1, 1) - 1.0).abs() < 1e-5);
        assert_eq!(m.gain(0, 3), 0.0);
    }

    #[test]
    fn rear_sources_fold_to_the_front_on_stereo() {
        let mut gains = [0.0; 2];
        speaker_gains(PI - 0.1, ChannelConfig::stereo(), &mut gains);
        assert!(gains[1] > gains[0]);
    }

    #[test]
    fn rays_position_sources_and_weight_by_gain() {
        let stereo = ChannelConfig::stereo();
        let rays = vec![
            Ray {
                azimuth: -PAN_SPAN,
                dry: 1.0,
                ..Ray::default()
            },
            Ray {
                azimuth: PAN_SPAN,
                dry: 0.0,
                ..Ray::default()
            },
        ];
        let cache = SharedPanCache::default();
        let mut m = matrix(ChannelConfig::mono(), stereo);
        DefaultPanner.pan_3d(
            &rays,
            ConnectionType::Direct,
            ListenerId(0),
            ChannelConfig::mono(),
            stereo,
            Some(&cache),
            &mut m,
        );
        assert!((m.gain(0, 0) - 1.0).abs() < 1e-5);
        assert!(m.gain(0, 1).abs() < 1e-5);
        assert_eq!(cache.lock().misses(), 1);
    }

    #[test]
    fn rays_for_other_listeners_are_ignored() {
        let stereo = ChannelConfig::stereo();
        let rays = vec![Ray {
            listener: ListenerId(3),
            ..Ray::default()
        }];
        let mut m = matrix(ChannelConfig::mono(), stereo);
        DefaultPanner.pan_3d(
            &rays,
            ConnectionType::Direct,
            ListenerId(0),
            ChannelConfig::mono(),
            stereo,
            None,
            &mut m,
        );
        assert!(m.is_zero());
    }
}

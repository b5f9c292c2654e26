//! Speaker/channel configurations.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_CHANNELS;
use crate::error::{MixError, Result};

pub const SPEAKER_FRONT_LEFT: u32 = 0x1;
pub const SPEAKER_FRONT_RIGHT: u32 = 0x2;
pub const SPEAKER_FRONT_CENTER: u32 = 0x4;
pub const SPEAKER_LOW_FREQUENCY: u32 = 0x8;
pub const SPEAKER_BACK_LEFT: u32 = 0x10;
pub const SPEAKER_BACK_RIGHT: u32 = 0x20;
pub const SPEAKER_SIDE_LEFT: u32 = 0x200;
pub const SPEAKER_SIDE_RIGHT: u32 = 0x400;

/// Channel count plus an optional speaker mask.
///
/// A zero mask denotes an anonymous layout: channels have no positions and
/// are laid out evenly around the listener when panned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(alias = "channels")]
    pub num_channels: u16,
    #[serde(default)]
    pub channel_mask: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::stereo()
    }
}

impl ChannelConfig {
    pub fn new(num_channels: u16, channel_mask: u32) -> Self {
        Self {
            num_channels,
            channel_mask,
        }
    }

    pub fn mono() -> Self {
        Self::new(1, SPEAKER_FRONT_CENTER)
    }

    pub fn stereo() -> Self {
        Self::new(2, SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT)
    }

    pub fn quad() -> Self {
        Self::new(
            4,
            SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT | SPEAKER_BACK_LEFT | SPEAKER_BACK_RIGHT,
        )
    }

    pub fn surround_5_1() -> Self {
        Self::new(
            6,
            SPEAKER_FRONT_LEFT
                | SPEAKER_FRONT_RIGHT
                | SPEAKER_FRONT_CENTER
                | SPEAKER_LOW_FREQUENCY
                | SPEAKER_SIDE_LEFT
                | SPEAKER_SIDE_RIGHT,
        )
    }

    pub fn anonymous(num_channels: u16) -> Self {
        Self::new(num_channels, 0)
    }

    pub fn channels(&self) -> usize {
        self.num_channels as usize
    }

    pub fn is_valid(&self) -> bool {
        self.num_channels > 0 && self.num_channels <= MAX_CHANNELS
    }

    pub fn validate(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(MixError::InvalidChannelConfig(format!(
                "{} channel(s), expected 1..={}",
                self.num_channels, MAX_CHANNELS
            )));
        }
        if self.channel_mask != 0 && self.channel_mask.count_ones() != self.num_channels as u32 {
            return Err(MixError::InvalidChannelConfig(format!(
                "mask {:#x} does not describe {} channel(s)",
                self.channel_mask, self.num_channels
            )));
        }
        Ok(())
    }

    pub fn has_lfe(&self) -> bool {
        self.channel_mask & SPEAKER_LOW_FREQUENCY != 0
    }

    /// Azimuth of every channel in radians (0 = front, positive = right).
    /// The LFE channel has no position and yields `None`.
    pub fn speaker_azimuths(&self) -> SpeakerAzimuths {
        let mut out = SpeakerAzimuths::default();
        if self.channel_mask == 0 {
            let n = self.channels();
            match n {
                0 => {}
                1 => out.push(Some(0.0)),
                2 => {
                    out.push(Some((-30.0_f32).to_radians()));
                    out.push(Some(30.0_f32.to_radians()));
                }
                _ => {
                    let step = std::f32::consts::TAU / n as f32;
                    for i in 0..n {
                        out.push(Some(wrap_angle(i as f32 * step)));
                    }
                }
            }
            return out;
        }
        for bit in 0..32 {
            let flag = 1_u32 << bit;
            if self.channel_mask & flag != 0 {
                out.push(mask_azimuth_degrees(flag).map(f32::to_radians));
            }
        }
        out
    }

    /// Index of the LFE channel, if the mask has one.
    pub fn lfe_index(&self) -> Option<usize> {
        self.speaker_azimuths().iter().position(Option::is_none)
    }
}

/// Per-channel speaker azimuths held inline, at most [`MAX_CHANNELS`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerAzimuths {
    angles: [Option<f32>; MAX_CHANNELS as usize],
    len: usize,
}

impl Default for SpeakerAzimuths {
    fn default() -> Self {
        Self {
            angles: [None; MAX_CHANNELS as usize],
            len: 0,
        }
    }
}

impl SpeakerAzimuths {
    fn push(&mut self, azimuth: Option<f32>) {
        if let Some(slot) = self.angles.get_mut(self.len) {
            *slot = azimuth;
            self.len += 1;
        }
    }
}

impl std::ops::Deref for SpeakerAzimuths {
    type Target = [Option<f32>];

    fn deref(&self) -> &Self::Target {
        &self.angles[..self.len]
    }
}

fn mask_azimuth_degrees(flag: u32) -> Option<f32> {
    match flag {
        SPEAKER_FRONT_LEFT => Some(-30.0),
        SPEAKER_FRONT_RIGHT => Some(30.0),
        SPEAKER_FRONT_CENTER => Some(0.0),
        SPEAKER_LOW_FREQUENCY => None,
        SPEAKER_BACK_LEFT => Some(-135.0),
        SPEAKER_BACK_RIGHT => Some(135.0),
        SPEAKER_SIDE_LEFT => Some(-110.0),
        SPEAKER_SIDE_RIGHT => Some(110.0),
        _ => Some(0.0),
    }
}

/// Wrap an angle into `(-PI, PI]`.
pub fn wrap_angle(angle: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let mut a = angle % TAU;
    if a > PI {
        a -= TAU;
    } else if a <= -PI {
        a += TAU;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_layouts_validate() {
        for config in [
            ChannelConfig::mono(),
            ChannelConfig::stereo(),
            ChannelConfig::quad(),
            ChannelConfig::surround_5_1(),
            ChannelConfig::anonymous(3),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        assert!(ChannelConfig::anonymous(0).validate().is_err());
        assert!(ChannelConfig::anonymous(MAX_CHANNELS + 1).validate().is_err());
        assert!(ChannelConfig::new(2, SPEAKER_FRONT_CENTER).validate().is_err());
    }

    #[test]
    fn surround_lfe_has_no_position() {
        let azimuths = ChannelConfig::surround_5_1().speaker_azimuths();
        assert_eq!(azimuths.len(), 6);
        assert_eq!(azimuths[3], None);
        assert!(ChannelConfig::surround_5_1().has_lfe());
        assert_eq!(ChannelConfig::surround_5_1().lfe_index(), Some(3));
        assert_eq!(ChannelConfig::stereo().lfe_index(), None);
    }

    #[test]
    fn stereo_speakers_sit_left_and_right() {
        let azimuths = ChannelConfig::stereo().speaker_azimuths();
        assert!(azimuths[0].unwrap_or_default() < 0.0);
        assert!(azimuths[1].unwrap_or_default() > 0.0);
    }

    #[test]
    fn anonymous_layouts_ring_the_listener() {
        let azimuths = ChannelConfig::anonymous(4).speaker_azimuths();
        assert_eq!(azimuths.len(), 4);
        assert_eq!(azimuths[0], Some(0.0));
        assert!((azimuths[2].unwrap_or_default().abs() - std::f32::consts::PI).abs() < 1e-5);
        let widest = ChannelConfig::anonymous(MAX_CHANNELS).speaker_azimuths();
        assert_eq!(widest.len(), MAX_CHANNELS as usize);
    }

    #[test]
    fn config_deserializes_with_default_mask() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"channels":4}"#).expect("deserialize config");
        assert_eq!(config, ChannelConfig::anonymous(4));
    }
}

//! Serializable configuration for the engine, authored buses and devices.
//!
//! Every struct uses `#[serde(default)]` so partial JSON is accepted. Gain
//! fields take numbers or strings such as `"-6db"`. Values are sanitized when
//! applied; structurally invalid settings are rejected by `validate`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::ChannelConfig;
use crate::constants::*;
use crate::dsp::level::{deserialize_db_gain, deserialize_linear_gain};
use crate::error::{MixError, Result};
use crate::graph::ConnectionType;
use crate::ids::{BusId, DeviceId, ListenerId, SharesetId};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub sample_rate: u32,
    #[serde(alias = "frame_size")]
    pub frame_length: usize,
    #[serde(alias = "volume_threshold", deserialize_with = "deserialize_db_gain")]
    pub volume_threshold_db: f32,
    pub activation_phase_ticks: u64,
    pub activation_retries: u32,
    pub starve_tick_limit: u32,
    pub silent_mode_wake_ms: u64,
    pub hdr_defaults: HdrSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_length: DEFAULT_FRAME_LENGTH,
            volume_threshold_db: DEFAULT_VOLUME_THRESHOLD_DB,
            activation_phase_ticks: DEFAULT_ACTIVATION_PHASE_TICKS,
            activation_retries: DEFAULT_ACTIVATION_RETRIES,
            starve_tick_limit: DEFAULT_STARVE_TICK_LIMIT,
            silent_mode_wake_ms: DEFAULT_SILENT_MODE_WAKE_MS,
            hdr_defaults: HdrSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Reject settings the engine cannot run with at all.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(MixError::InvalidSettings("sample_rate must be > 0".into()));
        }
        if self.frame_length == 0 {
            return Err(MixError::InvalidSettings("frame_length must be > 0".into()));
        }
        Ok(())
    }

    /// Copy with out-of-range values clamped.
    pub fn sanitized(&self) -> Self {
        Self {
            sample_rate: self.sample_rate,
            frame_length: self.frame_length,
            volume_threshold_db: if self.volume_threshold_db.is_finite() {
                self.volume_threshold_db.min(0.0)
            } else {
                DEFAULT_VOLUME_THRESHOLD_DB
            },
            activation_phase_ticks: self.activation_phase_ticks.max(1),
            activation_retries: self.activation_retries.max(1),
            starve_tick_limit: self.starve_tick_limit.max(1),
            silent_mode_wake_ms: self.silent_mode_wake_ms.max(1),
            hdr_defaults: self.hdr_defaults.sanitized(),
        }
    }

    /// Audio frames per second.
    pub fn frame_rate(&self) -> f32 {
        self.sample_rate as f32 / self.frame_length.max(1) as f32
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_length as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn silent_mode_interval(&self) -> Duration {
        Duration::from_millis(self.silent_mode_wake_ms)
    }
}

/// HDR gain-computer settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdrSettings {
    #[serde(alias = "threshold", deserialize_with = "deserialize_db_gain")]
    pub threshold_db: f32,
    pub ratio: f32,
    #[serde(alias = "release")]
    pub release_ms: f32,
    #[serde(alias = "active_range", deserialize_with = "deserialize_db_gain")]
    pub active_range_db: f32,
}

impl Default for HdrSettings {
    fn default() -> Self {
        Self {
            threshold_db: DEFAULT_HDR_THRESHOLD_DB,
            ratio: DEFAULT_HDR_RATIO,
            release_ms: DEFAULT_HDR_RELEASE_MS,
            active_range_db: DEFAULT_HDR_ACTIVE_RANGE_DB,
        }
    }
}

impl HdrSettings {
    pub fn sanitized(&self) -> Self {
        Self {
            threshold_db: if self.threshold_db.is_finite() {
                self.threshold_db
            } else {
                DEFAULT_HDR_THRESHOLD_DB
            },
            ratio: if self.ratio.is_finite() {
                self.ratio.clamp(0.0, 1.0)
            } else {
                DEFAULT_HDR_RATIO
            },
            release_ms: if self.release_ms.is_finite() {
                self.release_ms.max(0.0)
            } else {
                DEFAULT_HDR_RELEASE_MS
            },
            active_range_db: if self.active_range_db.is_finite() {
                self.active_range_db.abs()
            } else {
                DEFAULT_HDR_ACTIVE_RANGE_DB
            },
        }
    }
}

/// Where an authored bus sends its dry output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusOutput {
    #[default]
    MainDevice,
    Device { device: DeviceId },
    Parent { bus: BusId },
}

/// Auxiliary send from an authored bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusAuxSend {
    pub bus: BusId,
    #[serde(default = "unity", deserialize_with = "deserialize_linear_gain")]
    pub level: f32,
    #[serde(default = "user_send")]
    pub kind: ConnectionType,
}

fn unity() -> f32 {
    1.0
}

fn user_send() -> ConnectionType {
    ConnectionType::UserDefinedSend
}

/// One insert-effect slot on a bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EffectSlotSettings {
    pub plugin: String,
    pub params: serde_json::Value,
    pub bypass: bool,
}

impl EffectSlotSettings {
    pub fn new(plugin: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            plugin: plugin.into(),
            params,
            bypass: false,
        }
    }
}

/// An authored bus, instantiated lazily per game object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub name: String,
    /// Mix layout; `None` inherits the parent's layout.
    pub channels: Option<ChannelConfig>,
    pub output: BusOutput,
    #[serde(alias = "volume", deserialize_with = "deserialize_db_gain")]
    pub volume_db: f32,
    pub aux_sends: Vec<BusAuxSend>,
    pub effects: Vec<EffectSlotSettings>,
    pub mixer: Option<EffectSlotSettings>,
    pub hdr: Option<HdrSettings>,
    pub metering: bool,
    /// Keep instances alive even when idle.
    pub keep_alive: bool,
    pub media: Vec<Vec<u8>>,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            channels: None,
            output: BusOutput::MainDevice,
            volume_db: 0.0,
            aux_sends: Vec::new(),
            effects: Vec::new(),
            mixer: None,
            hdr: None,
            metering: false,
            keep_alive: false,
            media: Vec::new(),
        }
    }
}

impl BusSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(config) = self.channels {
            config.validate()?;
        }
        if !self.volume_db.is_finite() {
            return Err(MixError::InvalidSettings(format!(
                "bus \"{}\" volume is not finite",
                self.name
            )));
        }
        Ok(())
    }
}

/// An output device and the sink it should open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub name: String,
    pub shareset: SharesetId,
    pub channels: ChannelConfig,
    /// Listeners routed to this device; empty means all listeners.
    pub listeners: Vec<ListenerId>,
    #[serde(alias = "volume", deserialize_with = "deserialize_db_gain")]
    pub volume_db: f32,
    /// Never open a real sink for this device.
    pub forced_dummy: bool,
    /// Capture ring capacity in frames; `None` disables capture.
    pub capture_frames: Option<usize>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: "main".into(),
            shareset: SharesetId(0),
            channels: ChannelConfig::stereo(),
            listeners: Vec::new(),
            volume_db: 0.0,
            forced_dummy: false,
            capture_frames: None,
        }
    }
}

impl DeviceSettings {
    pub fn validate(&self) -> Result<()> {
        self.channels.validate()
    }
}

//! Scene files: everything `busmix render` needs to drive an engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

use busmix_lib::audio::ChannelConfig;
use busmix_lib::graph::{BusContext, ConnectionType};
use busmix_lib::ids::{BusId, ListenerId};
use busmix_lib::settings::{
    BusAuxSend, BusOutput, BusSettings, DeviceSettings, EffectSlotSettings, EngineSettings,
    HdrSettings,
};
use busmix_lib::source::{ConstantSource, SineSource, SourceFrameParams, VoiceSource};

use crate::error::CliError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scene {
    pub engine: EngineSettings,
    /// Device ticks to run when `--ticks` is not given.
    pub ticks: u64,
    /// Frame blocks every in-memory sink asks for per tick.
    pub blocks_per_tick: u32,
    pub main_device: DeviceSettings,
    pub devices: Vec<DeviceSettings>,
    /// Authored buses, numbered from 1 in file order.
    pub buses: Vec<BusSettings>,
    pub voices: Vec<SceneVoice>,
    pub events: Vec<SceneEvent>,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            ticks: 10,
            blocks_per_tick: 1,
            main_device: DeviceSettings::default(),
            devices: Vec::new(),
            buses: Vec::new(),
            voices: Vec::new(),
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SceneSource {
    Sine { frequency: f32, amplitude: f32 },
    Constant { value: f32 },
    Silence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneVoice {
    pub source: SceneSource,
    #[serde(default = "ChannelConfig::mono")]
    pub channels: ChannelConfig,
    /// Stop producing after this many sample frames.
    #[serde(default)]
    pub length_frames: Option<usize>,
    #[serde(default)]
    pub start_tick: u64,
    #[serde(default)]
    pub params: SourceFrameParams,
}

impl SceneVoice {
    pub fn build_source(&self, sample_rate: u32) -> Box<dyn VoiceSource> {
        match self.source {
            SceneSource::Sine {
                frequency,
                amplitude,
            } => {
                let sine = SineSource::new(self.channels, frequency, amplitude, sample_rate);
                match self.length_frames {
                    Some(frames) => Box::new(sine.with_length(frames)),
                    None => Box::new(sine),
                }
            }
            SceneSource::Constant { value } => self.constant(value),
            SceneSource::Silence => self.constant(0.0),
        }
    }

    fn constant(&self, value: f32) -> Box<dyn VoiceSource> {
        let source = ConstantSource::new(self.channels, value);
        match self.length_frames {
            Some(frames) => Box::new(source.with_length(frames)),
            None => Box::new(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEvent {
    pub tick: u64,
    #[serde(flatten)]
    pub action: SceneAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SceneAction {
    /// Index into `voices`.
    StopVoice { voice: usize },
    SetBusVolume { bus: BusId, volume_db: f32 },
    /// Device by name.
    SetDeviceVolume { device: String, volume_db: f32 },
    /// Make the device's sink report a failure.
    FailDevice { device: String },
}

impl Scene {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let scene: Scene = serde_json::from_str(&text)?;
        Ok(scene)
    }

    /// A small scene showing buses, sends, HDR and a second device.
    pub fn template() -> Self {
        let music = BusSettings {
            volume_db: -3.0,
            effects: vec![EffectSlotSettings::new(
                "low_pass",
                serde_json::json!({ "freq_hz": 8000.0 }),
            )],
            ..BusSettings::named("music")
        };
        let reverb = BusSettings {
            effects: vec![EffectSlotSettings::new("gain", serde_json::json!({ "gain": 0.5 }))],
            ..BusSettings::named("reverb")
        };
        let sfx = BusSettings {
            hdr: Some(HdrSettings::default()),
            aux_sends: vec![BusAuxSend {
                bus: BusId(2),
                level: 0.3,
                kind: ConnectionType::UserDefinedSend,
            }],
            ..BusSettings::named("sfx")
        };
        let footsteps = BusSettings {
            output: BusOutput::Parent { bus: BusId(3) },
            ..BusSettings::named("footsteps")
        };

        Self {
            main_device: DeviceSettings {
                name: "speakers".into(),
                listeners: vec![ListenerId(0)],
                capture_frames: Some(4096),
                ..DeviceSettings::default()
            },
            devices: vec![DeviceSettings {
                name: "controller".into(),
                channels: ChannelConfig::mono(),
                listeners: vec![ListenerId(1)],
                ..DeviceSettings::default()
            }],
            buses: vec![music, reverb, sfx, footsteps],
            voices: vec![
                SceneVoice {
                    source: SceneSource::Sine {
                        frequency: 220.0,
                        amplitude: 0.4,
                    },
                    channels: ChannelConfig::stereo(),
                    length_frames: None,
                    start_tick: 0,
                    params: SourceFrameParams::routed_to(BusContext::global(BusId(1))),
                },
                SceneVoice {
                    source: SceneSource::Sine {
                        frequency: 880.0,
                        amplitude: 0.8,
                    },
                    channels: ChannelConfig::mono(),
                    length_frames: Some(4096),
                    start_tick: 2,
                    params: SourceFrameParams {
                        envelope_db: -3.0,
                        ..SourceFrameParams::routed_to(BusContext::global(BusId(4)))
                    },
                },
                SceneVoice {
                    source: SceneSource::Constant { value: 0.1 },
                    channels: ChannelConfig::mono(),
                    length_frames: None,
                    start_tick: 0,
                    params: SourceFrameParams {
                        listener: ListenerId(1),
                        ..SourceFrameParams::default()
                    },
                },
            ],
            events: vec![SceneEvent {
                tick: 6,
                action: SceneAction::StopVoice { voice: 0 },
            }],
            ..Self::default()
        }
    }
}

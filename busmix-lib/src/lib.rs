//! # Busmix
//!
//! Real-time mix core for game audio: voices feed authored bus instances
//! through ramped connections, buses run their effect chains and the result
//! is delivered to one or more output devices.
//!
//! The [`MixEngine`] owns everything; call [`MixEngine::render_tick`] from
//! the audio thread.

pub mod audio;
pub mod constants;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ids;
pub mod output;
pub mod plugin;
pub mod settings;
pub mod source;
pub mod spatial;

pub use engine::{DeviceReport, MixEngine, TickReport};
pub use error::{MixError, Result};

//! Audio data carried through the graph: channel layouts, planar frame
//! buffers and speaker matrices.

pub mod buffer;
pub mod channels;
pub mod matrix;

pub use buffer::{AudioBuffer, BufferState};
pub use channels::{ChannelConfig, SpeakerAzimuths};
pub use matrix::{MatrixRamp, SpeakerMatrix};

//! DSP building blocks shared by connections and buses: gain conversion,
//! two-point ramps, per-edge filters and the built-in mix routine.

pub(crate) mod biquad;
pub mod filter;
pub mod level;
pub mod mix;
pub mod ramp;

pub use filter::EdgeFilter;
pub use level::{db_to_linear, linear_to_db};
pub use ramp::VolumeRamp;

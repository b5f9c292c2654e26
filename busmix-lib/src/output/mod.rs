//! Output devices, their sinks and the per-tick device management.

mod capture;
mod device;
mod manager;
#[cfg(feature = "rodio-sink")]
mod rodio_sink;
mod silent_mode;
mod sink;

pub use capture::{CaptureHandle, CaptureRing, CaptureSink, RingCapture};
pub use device::{Device, DeviceState};
pub use manager::OutputManager;
#[cfg(feature = "rodio-sink")]
pub use rodio_sink::{RodioSink, RodioSinkFactory};
pub use silent_mode::SilentModeTicker;
pub use sink::{
    BufferSink, BufferSinkFactory, BufferSinkHandle, DataNeeded, DummySink, Sink, SinkFactory,
    SinkFormat,
};

//! Device capture: a copy of what the device sent to its sink.

use dasp_ring_buffer::Bounded;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::audio::AudioBuffer;
use crate::dsp::ramp::GainRamp;
use crate::error::CaptureError;

pub trait CaptureSink: Send {
    /// Receive one block with the device's master volume already applied.
    fn write(&mut self, buffer: &AudioBuffer) -> Result<(), CaptureError>;
}

pub type CaptureRing = Arc<Mutex<Bounded<Vec<f32>>>>;

/// Keeps the most recent interleaved samples in a fixed ring.
#[derive(Debug)]
pub struct RingCapture {
    ring: CaptureRing,
    closed: Arc<Mutex<bool>>,
}

/// Reader side of a [`RingCapture`].
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    ring: CaptureRing,
    closed: Arc<Mutex<bool>>,
    channels: usize,
}

impl RingCapture {
    pub fn new(capacity_frames: usize, channels: usize) -> (Self, CaptureHandle) {
        let capacity = capacity_frames.max(1) * channels.max(1);
        let ring = Arc::new(Mutex::new(Bounded::from(vec![0.0; capacity])));
        let closed = Arc::new(Mutex::new(false));
        (
            Self {
                ring: Arc::clone(&ring),
                closed: Arc::clone(&closed),
            },
            CaptureHandle {
                ring,
                closed,
                channels,
            },
        )
    }
}

impl CaptureSink for RingCapture {
    fn write(&mut self, buffer: &AudioBuffer) -> Result<(), CaptureError> {
        if *self.closed.lock() {
            return Err(CaptureError::Closed);
        }
        let mut ring = self.ring.lock();
        for frame in 0..buffer.max_frames() {
            for ch in 0..buffer.num_channels() {
                // Full rings drop their oldest sample.
                let _ = ring.push(buffer.channel(ch)[frame]);
            }
        }
        Ok(())
    }
}

impl CaptureHandle {
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything captured so far, oldest first.
    pub fn drain(&self) -> Vec<f32> {
        self.ring.lock().drain().collect()
    }

    /// Make further writes fail with [`CaptureError::Closed`].
    pub fn close(&self) {
        *self.closed.lock() = true;
    }
}

/// Write `buffer` scaled by `ramp` to `capture` through `scratch`.
pub(crate) fn write_with_ramp(
    capture: &mut dyn CaptureSink,
    buffer: &AudioBuffer,
    ramp: GainRamp,
    scratch: &mut AudioBuffer,
) -> Result<(), CaptureError> {
    if scratch.config() != buffer.config() || scratch.max_frames() != buffer.max_frames() {
        scratch
            .reconfigure(buffer.config(), buffer.max_frames())
            .map_err(|err| CaptureError::Write(err.to_string()))?;
    }
    scratch.copy_from(buffer);
    scratch.apply_gain_ramp(ramp);
    capture.write(scratch)
}

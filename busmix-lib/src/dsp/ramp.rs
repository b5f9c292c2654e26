//! Two-point linear gain ramps interpolated across one audio frame.

/// Gain at the start (`prev`) and end (`next`) of a frame.
///
/// Every frame the ramp is rotated so the new frame starts where the last one
/// ended; samples in between are linearly interpolated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRamp {
    pub prev: f32,
    pub next: f32,
}

/// Ramp handed to sinks together with a rendered buffer.
pub type GainRamp = VolumeRamp;

impl Default for VolumeRamp {
    fn default() -> Self {
        Self::constant(1.0)
    }
}

impl VolumeRamp {
    pub fn new(prev: f32, next: f32) -> Self {
        Self { prev, next }
    }

    pub fn constant(value: f32) -> Self {
        Self {
            prev: value,
            next: value,
        }
    }

    pub fn silent() -> Self {
        Self::constant(0.0)
    }

    /// Move the end of the last frame to the start of the next one.
    pub fn rotate(&mut self) {
        self.prev = self.next;
    }

    pub fn is_silent(&self) -> bool {
        self.prev == 0.0 && self.next == 0.0
    }

    pub fn is_constant(&self) -> bool {
        self.prev == self.next
    }

    /// Component-wise product of two ramps.
    pub fn scaled(self, other: VolumeRamp) -> VolumeRamp {
        VolumeRamp {
            prev: self.prev * other.prev,
            next: self.next * other.next,
        }
    }

    /// Gain at sample `index` of a frame of `len` samples.
    pub fn at(&self, index: usize, len: usize) -> f32 {
        if len == 0 {
            return self.next;
        }
        let t = index as f32 / len as f32;
        self.prev + (self.next - self.prev) * t
    }

    /// Per-sample increment across a frame of `len` samples.
    pub fn step(&self, len: usize) -> f32 {
        if len == 0 {
            return 0.0;
        }
        (self.next - self.prev) / len as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_starts_where_the_last_frame_ended() {
        let mut ramp = VolumeRamp::new(0.2, 0.8);
        ramp.rotate();
        ramp.next = 0.4;
        assert_eq!(ramp, VolumeRamp::new(0.8, 0.4));
    }

    #[test]
    fn interpolation_spans_the_frame() {
        let ramp = VolumeRamp::new(0.0, 1.0);
        assert_eq!(ramp.at(0, 4), 0.0);
        assert_eq!(ramp.at(2, 4), 0.5);
        assert_eq!(ramp.step(4), 0.25);
        assert_eq!(ramp.at(3, 0), 1.0);
    }

    #[test]
    fn scaled_multiplies_both_edges() {
        let ramp = VolumeRamp::new(0.5, 1.0).scaled(VolumeRamp::new(0.5, 0.25));
        assert_eq!(ramp, VolumeRamp::new(0.25, 0.25));
        assert!(ramp.is_constant());
        assert!(VolumeRamp::silent().is_silent());
    }
}

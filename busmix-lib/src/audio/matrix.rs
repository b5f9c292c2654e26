//! Input-by-output speaker gain matrices.

use crate::error::{try_reserve, Result};

/// Gain from every input channel to every output channel, row-major by input.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeakerMatrix {
    in_channels: usize,
    out_channels: usize,
    gains: Vec<f32>,
}

impl SpeakerMatrix {
    /// Allocate a zeroed matrix, reporting allocation failure.
    pub fn try_zeroed(in_channels: usize, out_channels: usize) -> Result<Self> {
        let mut gains = Vec::new();
        try_reserve(&mut gains, in_channels * out_channels, "speaker matrix")?;
        gains.resize(in_channels * out_channels, 0.0);
        Ok(Self {
            in_channels,
            out_channels,
            gains,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn gain(&self, input: usize, output: usize) -> f32 {
        self.gains
            .get(input * self.out_channels + output)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set(&mut self, input: usize, output: usize, gain: f32) {
        if let Some(slot) = self.gains.get_mut(input * self.out_channels + output) {
            *slot = gain;
        }
    }

    /// Output gains for one input channel.
    pub fn row(&self, input: usize) -> &[f32] {
        let start = input * self.out_channels;
        self.gains.get(start..start + self.out_channels).unwrap_or(&[])
    }

    pub fn row_mut(&mut self, input: usize) -> &mut [f32] {
        let start = input * self.out_channels;
        let end = start + self.out_channels;
        self.gains.get_mut(start..end).unwrap_or(&mut [])
    }

    pub fn fill(&mut self, value: f32) {
        self.gains.fill(value);
    }

    pub fn scale(&mut self, factor: f32) {
        for gain in self.gains.iter_mut() {
            *gain *= factor;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.gains.iter().all(|gain| *gain == 0.0)
    }

    /// Copy gains from a matrix with identical dimensions.
    pub fn copy_from(&mut self, other: &SpeakerMatrix) {
        if self.gains.len() == other.gains.len() {
            self.gains.copy_from_slice(&other.gains);
        }
    }
}

/// Matrix at the start (`prev`) and end (`next`) of a frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatrixRamp {
    pub prev: SpeakerMatrix,
    pub next: SpeakerMatrix,
}

impl MatrixRamp {
    pub fn try_new(in_channels: usize, out_channels: usize) -> Result<Self> {
        Ok(Self {
            prev: SpeakerMatrix::try_zeroed(in_channels, out_channels)?,
            next: SpeakerMatrix::try_zeroed(in_channels, out_channels)?,
        })
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.next.in_channels(), self.next.out_channels())
    }

    /// Last frame's end becomes this frame's start.
    pub fn rotate(&mut self) {
        std::mem::swap(&mut self.prev, &mut self.next);
        self.next.copy_from(&self.prev);
    }

    /// Start this frame exactly where it ends.
    pub fn snap_prev_to_next(&mut self) {
        self.prev.copy_from(&self.next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_address_input_channels() {
        let mut matrix = SpeakerMatrix::try_zeroed(2, 3).expect("allocate matrix");
        matrix.set(1, 2, 0.5);
        assert_eq!(matrix.row(1), &[0.0, 0.0, 0.5]);
        assert_eq!(matrix.gain(1, 2), 0.5);
        assert_eq!(matrix.gain(5, 5), 0.0);
        assert!(!matrix.is_zero());
    }

    #[test]
    fn rotate_keeps_the_previous_end_as_start() {
        let mut ramp = MatrixRamp::try_new(1, 2).expect("allocate ramp");
        ramp.next.set(0, 0, 1.0);
        ramp.rotate();
        assert_eq!(ramp.prev.gain(0, 0), 1.0);
        ramp.next.set(0, 0, 0.25);
        assert_eq!(ramp.prev.gain(0, 0), 1.0);
        assert_eq!(ramp.dims(), (1, 2));
    }

    #[test]
    fn new_ramps_start_silent() {
        let ramp = MatrixRamp::try_new(2, 2).expect("allocate ramp");
        assert!(ramp.prev.is_zero());
        assert!(ramp.next.is_zero());
    }
}

//! Biquad low/high-pass sections with planar per-channel state.

use std::f32::consts::PI;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BiquadKind {
    LowPass,
    HighPass,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BiquadCoefficients {
    pub(crate) b0: f32,
    pub(crate) b1: f32,
    pub(crate) b2: f32,
    pub(crate) a1: f32,
    pub(crate) a2: f32,
}

#[derive(Clone, Copy, Debug, Default)]
struct ChannelHistory {
    x_n1: f32,
    x_n2: f32,
    y_n1: f32,
    y_n2: f32,
}

#[derive(Clone, Debug)]
pub(crate) struct BiquadState {
    kind: BiquadKind,
    sample_rate: u32,
    freq: f32,
    q: f32,
    coeffs: BiquadCoefficients,
    history: Vec<ChannelHistory>,
}

impl BiquadState {
    pub(crate) fn new(kind: BiquadKind, sample_rate: u32, channels: usize, freq: f32, q: f32) -> Self {
        let freq = sanitize_freq(freq, sample_rate);
        let q = sanitize_q(q);
        let coeffs = coefficients(kind, sample_rate, freq, q);
        Self {
            kind,
            sample_rate,
            freq,
            q,
            coeffs,
            history: vec![ChannelHistory::default(); channels.max(1)],
        }
    }

    pub(crate) fn channels(&self) -> usize {
        self.history.len()
    }

    pub(crate) fn freq(&self) -> f32 {
        self.freq
    }

    /// Recompute coefficients when the cutoff moved, keeping channel history.
    pub(crate) fn retune(&mut self, sample_rate: u32, freq: f32) {
        let freq = sanitize_freq(freq, sample_rate);
        if self.sample_rate == sample_rate && (self.freq - freq).abs() < f32::EPSILON {
            return;
        }
        self.sample_rate = sample_rate;
        self.freq = freq;
        self.coeffs = coefficients(self.kind, sample_rate, freq, self.q);
    }

    /// Filter one planar channel in place.
    pub(crate) fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        let Some(state) = self.history.get_mut(channel) else {
            return;
        };
        let c = self.coeffs;
        for sample in samples.iter_mut() {
            let x = *sample;
            let y = c.b0 * x + c.b1 * state.x_n1 + c.b2 * state.x_n2
                - c.a1 * state.y_n1
                - c.a2 * state.y_n2;
            state.x_n2 = state.x_n1;
            state.x_n1 = x;
            state.y_n2 = state.y_n1;
            state.y_n1 = y;
            *sample = y;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.history.fill(ChannelHistory::default());
    }
}

fn sanitize_freq(freq: f32, sample_rate: u32) -> f32 {
    let nyquist = sample_rate as f32 / 2.0;
    if nyquist <= 2.0 {
        return 1.0;
    }
    if !freq.is_finite() {
        return nyquist - 1.0;
    }
    freq.clamp(1.0, nyquist - 1.0)
}

fn sanitize_q(q: f32) -> f32 {
    if !q.is_finite() {
        return std::f32::consts::FRAC_1_SQRT_2;
    }
    q.clamp(0.1, 10.0)
}

fn coefficients(kind: BiquadKind, sample_rate: u32, freq: f32, q: f32) -> BiquadCoefficients {
    let w0 = 2.0 * PI * freq / sample_rate.max(1) as f32;
    let cos_w0 = w0.cos();
    let alpha = w0.sin() / (2.0 * q);

    let (b0, b1, b2) = match kind {
        BiquadKind::LowPass => {
            let b1 = 1.0 - cos_w0;
            (b1 / 2.0, b1, b1 / 2.0)
        }
        BiquadKind::HighPass => {
            let b0 = (1.0 + cos_w0) / 2.0;
            (b0, -1.0 - cos_w0, b0)
        }
    };
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;

    BiquadCoefficients {
        b0: b0 / a0,
        b1: b1 / a0,
        b2: b2 / a0,
        a1: a1 / a0,
        a2: a2 / a0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settle(state: &mut BiquadState, value: f32) -> f32 {
        let mut block = vec![value; 4096];
        state.process_channel(0, &mut block);
        block[block.len() - 1]
    }

    #[test]
    fn low_pass_passes_dc() {
        let mut state = BiquadState::new(BiquadKind::LowPass, 48_000, 1, 1_000.0, 0.707);
        assert!((settle(&mut state, 1.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn high_pass_blocks_dc() {
        let mut state = BiquadState::new(BiquadKind::HighPass, 48_000, 1, 1_000.0, 0.707);
        assert!(settle(&mut state, 1.0).abs() < 1e-3);
    }

    #[test]
    fn channels_keep_independent_history() {
        let mut state = BiquadState::new(BiquadKind::LowPass, 48_000, 2, 500.0, 0.707);
        let mut left = vec![1.0; 64];
        let mut right = vec![0.0; 64];
        state.process_channel(0, &mut left);
        state.process_channel(1, &mut right);
        assert!(left[63] > 0.0);
        assert!(right.iter().all(|sample| *sample == 0.0));
    }

    #[test]
    fn frequencies_are_clamped_below_nyquist() {
        let state = BiquadState::new(BiquadKind::LowPass, 48_000, 1, 90_000.0, f32::NAN);
        assert!(state.freq() < 24_000.0);
    }
}

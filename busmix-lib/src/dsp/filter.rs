//! Per-connection low/high-pass filtering.
//!
//! Filter amounts are expressed as 0–100 values; 0 bypasses the section and
//! 100 moves the cutoff to the far end of the audible range.

use super::biquad::{BiquadKind, BiquadState};

const MIN_CUTOFF_HZ: f32 = 20.0;
const MAX_CUTOFF_HZ: f32 = 20_000.0;
const EDGE_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Cutoff frequency for a low-pass amount.
pub fn lpf_cutoff_hz(value: f32) -> f32 {
    let t = sanitize_amount(value) / 100.0;
    MAX_CUTOFF_HZ * (MIN_CUTOFF_HZ / MAX_CUTOFF_HZ).powf(t)
}

/// Cutoff frequency for a high-pass amount.
pub fn hpf_cutoff_hz(value: f32) -> f32 {
    let t = sanitize_amount(value) / 100.0;
    MIN_CUTOFF_HZ * (MAX_CUTOFF_HZ / MIN_CUTOFF_HZ).powf(t)
}

/// LPF/HPF parameters plus the biquad state that realizes them.
#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    lpf_value: f32,
    hpf_value: f32,
    lpf: Option<BiquadState>,
    hpf: Option<BiquadState>,
}

impl EdgeFilter {
    pub fn set_params(&mut self, lpf: f32, hpf: f32) {
        self.lpf_value = sanitize_amount(lpf);
        self.hpf_value = sanitize_amount(hpf);
    }

    pub fn lpf(&self) -> f32 {
        self.lpf_value
    }

    pub fn hpf(&self) -> f32 {
        self.hpf_value
    }

    pub fn is_active(&self) -> bool {
        self.lpf_value > 0.0 || self.hpf_value > 0.0
    }

    /// Bring the biquad sections in line with the current parameters.
    pub fn update_coefficients(&mut self, sample_rate: u32, channels: usize) {
        update_section(
            &mut self.lpf,
            BiquadKind::LowPass,
            self.lpf_value,
            lpf_cutoff_hz(self.lpf_value),
            sample_rate,
            channels,
        );
        update_section(
            &mut self.hpf,
            BiquadKind::HighPass,
            self.hpf_value,
            hpf_cutoff_hz(self.hpf_value),
            sample_rate,
            channels,
        );
    }

    pub fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        if let Some(lpf) = self.lpf.as_mut() {
            lpf.process_channel(channel, samples);
        }
        if let Some(hpf) = self.hpf.as_mut() {
            hpf.process_channel(channel, samples);
        }
    }

    /// Clear filter history (used when the channel layout changes).
    pub fn reset(&mut self) {
        self.lpf = None;
        self.hpf = None;
    }
}

fn update_section(
    section: &mut Option<BiquadState>,
    kind: BiquadKind,
    amount: f32,
    cutoff: f32,
    sample_rate: u32,
    channels: usize,
) {
    if amount <= 0.0 {
        *section = None;
        return;
    }
    match section {
        Some(state) if state.channels() == channels.max(1) => state.retune(sample_rate, cutoff),
        _ => *section = Some(BiquadState::new(kind, sample_rate, channels, cutoff, EDGE_Q)),
    }
}

fn sanitize_amount(value: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_map_across_the_audible_range() {
        assert!((lpf_cutoff_hz(0.0) - MAX_CUTOFF_HZ).abs() < 1.0);
        assert!((lpf_cutoff_hz(100.0) - MIN_CUTOFF_HZ).abs() < 0.1);
        assert!((hpf_cutoff_hz(0.0) - MIN_CUTOFF_HZ).abs() < 0.1);
        assert!(lpf_cutoff_hz(50.0) < lpf_cutoff_hz(25.0));
    }

    #[test]
    fn inactive_filter_is_a_passthrough() {
        let mut filter = EdgeFilter::default();
        filter.set_params(0.0, f32::NAN);
        filter.update_coefficients(48_000, 2);
        assert!(!filter.is_active());
        let mut samples = vec![0.5, -0.5, 0.25];
        filter.process_channel(0, &mut samples);
        assert_eq!(samples, vec![0.5, -0.5, 0.25]);
    }

    #[test]
    fn heavy_low_pass_attenuates_alternating_signal() {
        let mut filter = EdgeFilter::default();
        filter.set_params(80.0, 0.0);
        filter.update_coefficients(48_000, 1);
        let mut samples: Vec<f32> = (0..512)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        filter.process_channel(0, &mut samples);
        let tail_peak = samples[256..].iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
        assert!(tail_peak < 0.01);
    }
}

//! HDR window: a bus-wide gain computer fed by the peaks of upstream voices.
//!
//! Voices push their effective peak during the update pass; once every voice
//! has pushed, the window top is computed and each voice applies
//! `downstream_gain - window_top` (never above 0 dB) to its connections into
//! the bus.

use crate::settings::HdrSettings;

/// Window tops closer than this to the threshold count as fully released.
const RELEASED_EPSILON_DB: f32 = 0.01;

#[derive(Debug, Clone)]
pub struct HdrState {
    settings: HdrSettings,
    release_coeff: f32,
    window_top_db: f32,
    pending_top_db: Option<f32>,
    downstream_gain_db: f32,
}

impl HdrState {
    /// `frame_rate` is the number of audio frames per second.
    pub fn new(settings: HdrSettings, frame_rate: f32) -> Self {
        let settings = settings.sanitized();
        Self {
            release_coeff: time_to_coeff(settings.release_ms, frame_rate),
            window_top_db: settings.threshold_db,
            pending_top_db: None,
            downstream_gain_db: 0.0,
            settings,
        }
    }

    pub fn settings(&self) -> HdrSettings {
        self.settings
    }

    pub fn window_top_db(&self) -> f32 {
        self.window_top_db
    }

    pub fn downstream_gain_db(&self) -> f32 {
        self.downstream_gain_db
    }

    /// Start a frame with the bus's own cumulative downstream gain.
    pub fn begin_frame(&mut self, downstream_gain_db: f32) {
        self.downstream_gain_db = downstream_gain_db;
        self.pending_top_db = None;
    }

    /// Window top a voice peaking at `peak_db` asks for.
    pub fn get_max_voice_window_top(&self, peak_db: f32) -> f32 {
        let relative = peak_db - self.downstream_gain_db;
        compute_window_top(relative, self.settings.threshold_db, self.settings.ratio)
    }

    /// True when a voice peaking at `peak_db` can still move the window.
    pub fn is_in_active_range(&self, peak_db: f32) -> bool {
        let relative = peak_db - self.downstream_gain_db;
        relative > self.window_top_db - self.settings.active_range_db
    }

    pub fn push_effective_voice_volume(&mut self, peak_db: f32) {
        if !peak_db.is_finite() || !self.is_in_active_range(peak_db) {
            return;
        }
        let top = self.get_max_voice_window_top(peak_db);
        self.pending_top_db = Some(match self.pending_top_db {
            Some(current) => current.max(top),
            None => top,
        });
    }

    /// Fold the pushed peaks into the window: instant attack, one-pole
    /// release toward the threshold.
    pub fn compute_window_top(&mut self) {
        let floor = self.settings.threshold_db;
        let released = floor + (self.window_top_db - floor) * self.release_coeff;
        let pushed = self.pending_top_db.unwrap_or(floor);
        self.window_top_db = released.max(pushed).max(floor);
    }

    /// Gain applied to every input of the bus: `downstream - window_top`,
    /// capped at 0 dB. The window only ever attenuates.
    pub fn attenuation_db(&self) -> f32 {
        (self.downstream_gain_db - self.window_top_db).min(0.0)
    }

    /// The window is above its floor and still decaying.
    pub fn is_releasing(&self) -> bool {
        self.window_top_db - self.settings.threshold_db > RELEASED_EPSILON_DB
    }
}

fn compute_window_top(level_db: f32, threshold_db: f32, ratio: f32) -> f32 {
    if level_db <= threshold_db {
        threshold_db
    } else {
        threshold_db + (level_db - threshold_db) * ratio
    }
}

fn time_to_coeff(time_ms: f32, frame_rate: f32) -> f32 {
    if time_ms <= 0.0 || !time_ms.is_finite() || frame_rate <= 0.0 {
        return 0.0;
    }
    let t = time_ms / 1000.0;
    (-1.0 / (t * frame_rate)).exp()
}

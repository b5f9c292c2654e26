//! Shared constants for mixing and device-management defaults.

/// Default sample rate used by the engine (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default number of sample frames rendered per audio frame.
pub const DEFAULT_FRAME_LENGTH: usize = 1024;

/// Highest channel count a bus or device may be configured with.
pub const MAX_CHANNELS: u16 = 16;

/// Downstream gain (dB) at or below which a voice connection counts as silent.
pub const DEFAULT_VOLUME_THRESHOLD_DB: f32 = -96.3;

/// Floor used when a gain collapses to zero.
pub const SILENCE_DB: f32 = -200.0;

/// Device activation is retried on ticks that are multiples of this value.
pub const DEFAULT_ACTIVATION_PHASE_TICKS: u64 = 8;

/// Sink creation attempts per aligned tick.
pub const DEFAULT_ACTIVATION_RETRIES: u32 = 2;

/// Ticks a secondary device may go without needing data before it is reset.
pub const DEFAULT_STARVE_TICK_LIMIT: u32 = 64;

/// Wake interval of the silent-mode ticker thread (ms).
pub const DEFAULT_SILENT_MODE_WAKE_MS: u64 = 20;

pub const DEFAULT_HDR_THRESHOLD_DB: f32 = 0.0;
pub const DEFAULT_HDR_RATIO: f32 = 1.0;
pub const DEFAULT_HDR_RELEASE_MS: f32 = 1000.0;
pub const DEFAULT_HDR_ACTIVE_RANGE_DB: f32 = 12.0;

/// Game object that owns globally scoped bus instances.
pub const GLOBAL_GAME_OBJECT: u64 = 0;

/// Attempts to open the default output stream before a sink reports failure.
pub const OUTPUT_STREAM_OPEN_RETRIES: usize = 3;

/// Delay between output stream open attempts (ms).
pub const OUTPUT_STREAM_OPEN_RETRY_MS: u64 = 200;

/// Frame blocks a hardware sink keeps queued ahead of playback.
pub const SINK_QUEUE_BLOCKS: usize = 3;

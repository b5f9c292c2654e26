//! Per-device memo of speaker gains by quantized azimuth.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::speaker_gains;
use crate::audio::ChannelConfig;

const MAX_ENTRIES: usize = 4096;

/// Gains per (output layout, azimuth in whole degrees).
///
/// Written by the render thread; sinks and profiling code may read it.
#[derive(Debug, Default)]
pub struct PanCache {
    entries: HashMap<(ChannelConfig, i32), Vec<f32>>,
    hits: u64,
    misses: u64,
}

/// Pan cache shared between the render thread and its readers.
#[derive(Debug, Clone, Default)]
pub struct SharedPanCache(Arc<Mutex<PanCache>>);

impl SharedPanCache {
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, PanCache> {
        self.0.lock()
    }
}

impl PanCache {
    /// Gains for `azimuth` (radians) on `output`, computed on first use.
    pub fn gains(&mut self, output: ChannelConfig, azimuth: f32) -> &[f32] {
        let key = (output, azimuth.to_degrees().round() as i32);
        if self.entries.contains_key(&key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            if self.entries.len() >= MAX_ENTRIES {
                log::debug!("pan cache full ({} entries), clearing", self.entries.len());
                self.entries.clear();
            }
            let mut gains = vec![0.0; output.channels()];
            speaker_gains((key.1 as f32).to_radians(), output, &mut gains);
            self.entries.insert(key, gains);
        }
        self.entries.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_lookups_hit_the_cache() {
        let mut cache = PanCache::default();
        let first = cache.gains(ChannelConfig::stereo(), 0.1).to_vec();
        let second = cache.gains(ChannelConfig::stereo(), 0.1001).to_vec();
        assert_eq!(first, second);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn shared_cache_is_usable_across_threads() {
        let cache = SharedPanCache::default();
        let reader = cache.clone();
        let handle = std::thread::spawn(move || reader.lock().len());
        cache.lock().gains(ChannelConfig::quad(), 1.0);
        let _ = handle.join().expect("join reader");
        assert_eq!(cache.lock().len(), 1);
    }
}

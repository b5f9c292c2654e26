//! Helpers for parsing and converting linear and dB gain values.

use serde::de::{Error as DeError, Visitor};
use serde::Deserializer;
use std::fmt;

use crate::constants::SILENCE_DB;

/// Convert a dB value to linear gain.
pub fn db_to_linear(db: f32) -> f32 {
    if db <= SILENCE_DB {
        return 0.0;
    }
    10.0_f32.powf(db / 20.0)
}

/// Convert a linear gain to dB, flooring at [`SILENCE_DB`].
pub fn linear_to_db(value: f32) -> f32 {
    if value.is_nan() || value <= 0.0 {
        return SILENCE_DB;
    }
    (20.0 * value.log10()).max(SILENCE_DB)
}

/// Deserialize a linear gain; strings like `"-6db"` are converted.
pub fn deserialize_linear_gain<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(GainVisitor(GainUnit::Linear))
}

/// Deserialize a dB gain; plain numbers in strings are read as linear.
pub fn deserialize_db_gain<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(GainVisitor(GainUnit::Db))
}

#[derive(Clone, Copy)]
enum GainUnit {
    Linear,
    Db,
}

impl GainUnit {
    fn parse(self, text: &str) -> Option<f32> {
        let text = text.trim().to_ascii_lowercase();
        match (text.strip_suffix("db"), self) {
            (Some(db), GainUnit::Linear) => db.trim().parse().ok().map(db_to_linear),
            (Some(db), GainUnit::Db) => db.trim().parse().ok(),
            (None, GainUnit::Linear) => text.parse().ok(),
            (None, GainUnit::Db) => text.parse().ok().map(linear_to_db),
        }
    }
}

struct GainVisitor(GainUnit);

impl<'de> Visitor<'de> for GainVisitor {
    type Value = f32;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a number or a string like \"-6db\"")
    }

    fn visit_f64<E: DeError>(self, value: f64) -> Result<f32, E> {
        Ok(value as f32)
    }

    fn visit_i64<E: DeError>(self, value: i64) -> Result<f32, E> {
        Ok(value as f32)
    }

    fn visit_u64<E: DeError>(self, value: u64) -> Result<f32, E> {
        Ok(value as f32)
    }

    fn visit_str<E: DeError>(self, value: &str) -> Result<f32, E> {
        self.0
            .parse(value)
            .ok_or_else(|| E::custom(format!("invalid gain value \"{}\"", value)))
    }
}

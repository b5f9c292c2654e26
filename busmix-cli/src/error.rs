use thiserror::Error;

use busmix_lib::MixError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scene: {0}")]
    Scene(#[from] serde_json::Error),

    #[error("Scene event at tick {tick}: {reason}")]
    Event { tick: u64, reason: String },

    #[error(transparent)]
    Engine(#[from] MixError),
}

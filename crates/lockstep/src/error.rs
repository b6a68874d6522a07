use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Pipeline '{pipeline}': {source}")]
    Step {
        pipeline: String,
        #[source]
        source: lockstep_core::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading configurations and checkpoints.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("unsupported configuration: {0}")]
    Config(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl FusionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<FusionError> for candle_core::Error {
    fn from(err: FusionError) -> Self {
        match err {
            FusionError::Candle(inner) => inner,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}

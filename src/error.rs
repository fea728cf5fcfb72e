//! Error types for ddpm-rs.

/// Result type alias using [`DiffusionError`].
pub type Result<T> = std::result::Result<T, DiffusionError>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    /// Invalid schedule or engine configuration.
    #[error("config: {0}")]
    Config(String),

    /// A sample tensor disagrees with the configured shape or with its pair.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },

    /// The noise predictor raised or returned a malformed result.
    #[error("noise predictor: {0}")]
    Collaborator(String),

    /// A random-draw provider could not satisfy a request.
    #[error("noise source: {0}")]
    Noise(String),

    /// tch tensor error.
    #[error("tch: {0}")]
    Tch(#[from] tch::TchError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error.
    #[error("toml: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl DiffusionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DiffusionError::Config(msg.into())
    }

    pub(crate) fn shape(expected: &[i64], actual: &[i64]) -> Self {
        DiffusionError::ShapeMismatch { expected: expected.to_vec(), actual: actual.to_vec() }
    }
}

// Unknown schedule kinds and malformed fields are configuration faults.
impl From<toml::de::Error> for DiffusionError {
    fn from(error: toml::de::Error) -> Self {
        DiffusionError::Config(error.to_string())
    }
}

//! Error types for gammafold

use thiserror::Error;

/// gammafold error type
///
/// Domain-boundary conditions (a coordinate outside a geometry, an energy
/// outside an axis) are never reported through this type; they are encoded as
/// NaN or invalid-index sentinels by the map layer.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Invalid numeric range for an axis or a binning
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Bad construction parameters (pixel size, width, kernel normalization, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Two operands that must share a geometry do not
    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// Axis name not present in a geometry
    #[error("Unknown axis: {0}")]
    UnknownAxis(String),

    /// Datasets that cannot be stacked together
    #[error("Stack error: {0}")]
    Stack(String),

    /// Persisted document is missing required content or is inconsistent
    #[error("Format error: {0}")]
    Format(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

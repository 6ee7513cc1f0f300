//! Error types for afinar

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed record at index {index}: {reason}")]
    MalformedRecord { index: usize, reason: String },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Distributed setup error: {0}")]
    Distributed(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON: {e}"))
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Error::Serialization(format!("SafeTensors: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

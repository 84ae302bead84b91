//! Error types for the playground.

use thiserror::Error;

/// Every failure a generation or chat request can surface.
#[derive(Error, Debug)]
pub enum Error {
    /// A request parameter was outside its documented bound. Raised before
    /// the model is touched.
    #[error("invalid parameter: {0}")]
    Validation(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("weight loading error: {0}")]
    WeightLoad(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error was raised by parameter validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

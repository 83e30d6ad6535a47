//! Error types for Fornax

use thiserror::Error;

/// Result type alias using Fornax's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Fornax operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed model file: {0}")]
    MalformedModel(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("No free KV cache blocks")]
    NoFreeBlocks,

    #[error("Invalid block id: {0}")]
    InvalidBlockId(usize),

    #[error("Sequence position {0} exceeds the model's maximum sequence length")]
    SequenceOverflow(usize),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

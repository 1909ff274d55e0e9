//! Error types for the generation store.

use keel_core::{Generation, PolicyError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{codec} encode failed for {subject}: {reason}")]
    Encode {
        codec: &'static str,
        subject: String,
        reason: String,
    },

    #[error("{codec} decode failed for '{source_name}': {reason}")]
    Decode {
        codec: &'static str,
        source_name: String,
        reason: String,
    },

    #[error("IO error while {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("generation {0} is already stored")]
    DuplicateGeneration(Generation),

    #[error("stored generation is not a valid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            operation: operation.into(),
            source,
        }
    }
}

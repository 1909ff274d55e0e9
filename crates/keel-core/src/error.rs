//! Error types for the object model.

use thiserror::Error;

use crate::object::ObjectKey;

/// Errors raised while building or validating a policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Clusters and ACL rules may only be added to the system namespace.
    #[error("object '{key}' can only be defined in the 'system' namespace")]
    NotInSystemNamespace { key: ObjectKey },

    /// The object itself is malformed (empty name, bad component, ...).
    #[error("invalid object '{key}': {reason}")]
    InvalidObject { key: ObjectKey, reason: String },

    /// The policy graph as a whole is invalid (dangling reference, cycle, ...).
    #[error("policy validation failed at '{key}': {reason}")]
    Validation { key: ObjectKey, reason: String },

    #[error("unknown object kind '{0}'")]
    UnknownKind(String),

    #[error("invalid object key '{0}', expected namespace/kind/name")]
    InvalidKey(String),

    #[error("invalid generation '{0}', expected a number or 'last'")]
    InvalidGeneration(String),
}

impl PolicyError {
    pub fn validation(key: ObjectKey, reason: impl Into<String>) -> Self {
        Self::Validation {
            key,
            reason: reason.into(),
        }
    }

    pub fn invalid_object(key: ObjectKey, reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            key,
            reason: reason.into(),
        }
    }

    /// Key of the offending object, when the error concerns one.
    pub fn object_key(&self) -> Option<&ObjectKey> {
        match self {
            PolicyError::NotInSystemNamespace { key }
            | PolicyError::InvalidObject { key, .. }
            | PolicyError::Validation { key, .. } => Some(key),
            _ => None,
        }
    }
}

//! Access control error types.
//!
//! ACL errors always carry the identity needed to act on them: the user and, when the error is
//! about an object, the object key.

use keel_core::{ObjectKey, PolicyError};
use std::fmt;

/// Error type for access control failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclError {
    /// The kind of ACL error.
    pub kind: AclErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// The user the decision was made for.
    pub user: Option<String>,
    /// The object the decision was about.
    pub object: Option<ObjectKey>,
}

impl AclError {
    /// Create a new ACL error.
    pub fn new(kind: AclErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            user: None,
            object: None,
        }
    }

    // =========================================================================
    // PRIVILEGE ERRORS
    // =========================================================================

    /// User may not view the object.
    pub fn view_denied(user: &str, object: &ObjectKey) -> Self {
        Self {
            user: Some(user.to_string()),
            object: Some(object.clone()),
            ..Self::new(
                AclErrorKind::ViewDenied,
                format!(
                    "user '{}' doesn't have ACL permissions to view object '{}'",
                    user, object
                ),
            )
        }
    }

    /// User may not add, remove or modify the object.
    pub fn manage_denied(user: &str, object: &ObjectKey) -> Self {
        Self {
            user: Some(user.to_string()),
            object: Some(object.clone()),
            ..Self::new(
                AclErrorKind::ManageDenied,
                format!(
                    "user '{}' doesn't have ACL permissions to manage object '{}'",
                    user, object
                ),
            )
        }
    }

    /// User may not create claims in the service's namespace.
    pub fn consume_denied(user: &str, service: &ObjectKey) -> Self {
        Self {
            user: Some(user.to_string()),
            object: Some(service.clone()),
            ..Self::new(
                AclErrorKind::ConsumeDenied,
                format!(
                    "user '{}' doesn't have ACL permissions to consume service '{}/{}'",
                    user, service.namespace, service.name
                ),
            )
        }
    }

    // =========================================================================
    // RULE ERRORS
    // =========================================================================

    /// An ACL rule or static grant cannot be evaluated.
    pub fn malformed_rule(source: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            AclErrorKind::MalformedRule,
            format!("malformed ACL rule '{}': {}", source, reason),
        )
    }
}

impl fmt::Display for AclError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AclError {}

/// Categories of ACL errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclErrorKind {
    /// View privilege missing.
    ViewDenied,
    /// Manage privilege missing.
    ManageDenied,
    /// Claim creation in the service's namespace not allowed.
    ConsumeDenied,
    /// ACL rule definition cannot be evaluated.
    MalformedRule,
}

/// Errors returned by mutating [`crate::PolicyView`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    #[error(transparent)]
    Acl(#[from] AclError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

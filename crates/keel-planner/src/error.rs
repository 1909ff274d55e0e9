//! Resolution errors.
//!
//! Resolution errors are per claim: they are recorded in the resolution state and never abort
//! the resolution of other claims.

use keel_core::ObjectKey;

use crate::state::ComponentInstanceKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("user '{user}' not found in the user directory")]
    UnknownUser { user: String },

    #[error("service '{namespace}/{name}' not found")]
    UnknownService { namespace: String, name: String },

    #[error("claim rejected by rule '{rule}'")]
    Rejected { rule: ObjectKey },

    #[error("no cluster selected: label 'cluster' is not set")]
    NoCluster,

    #[error("cluster '{name}' not found")]
    UnknownCluster { name: String },

    #[error("service '{service}' needs context label '{label}'")]
    MissingContextLabel { service: String, label: String },

    #[error("component '{component}' parameters reference unknown label '{label}'")]
    MissingLabel { component: String, label: String },

    #[error("service composition cycle: {path}")]
    CompositionCycle { path: String },

    #[error("component dependency cycle in service '{service}'")]
    ComponentCycle { service: String },

    #[error("component '{component}' of service '{service}' not found")]
    UnknownComponent { service: String, component: String },

    #[error("instance '{key}' is already resolved with different parameters")]
    ConflictingParameters { key: ComponentInstanceKey },
}

/// Errors in the shape of a plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The listed actions wait on each other, directly or through a chain of prerequisites.
    #[error("ordering cycle between actions: {}", .actions.join(", "))]
    Cycle { actions: Vec<String> },
}

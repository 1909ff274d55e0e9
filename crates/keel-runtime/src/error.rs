//! Runtime error types.

use keel_core::PolicyError;
use keel_planner::ComponentInstanceKey;
use keel_policy::{AclError, ViewError};
use keel_store::StoreError;
use std::time::Duration;

/// Errors raised by plugins or by plugin lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("no driver registered for cluster type '{0}'")]
    UnknownClusterType(String),

    #[error("cluster type '{cluster_type}' does not support code type '{code_type}'")]
    UnsupportedCodeType {
        cluster_type: String,
        code_type: String,
    },

    #[error("{0}")]
    Failed(String),
}

/// Errors from applying a single action.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("instance '{key}': cluster '{cluster}' is not in the policy")]
    UnknownCluster {
        key: ComponentInstanceKey,
        cluster: String,
    },

    #[error("instance '{key}': {source}")]
    Plugin {
        key: ComponentInstanceKey,
        #[source]
        source: PluginError,
    },

    #[error("instance '{key}': plugin call timed out after {after:?}")]
    Timeout {
        key: ComponentInstanceKey,
        after: Duration,
    },

    #[error("instance '{key}' is not deployed")]
    NotDeployed { key: ComponentInstanceKey },
}

impl ApplyError {
    /// Key of the instance the failed action targeted.
    pub fn key(&self) -> &ComponentInstanceKey {
        match self {
            ApplyError::UnknownCluster { key, .. }
            | ApplyError::Plugin { key, .. }
            | ApplyError::Timeout { key, .. }
            | ApplyError::NotDeployed { key } => key,
        }
    }
}

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("user '{0}' not found")]
    UnknownUser(String),

    #[error(transparent)]
    Acl(#[from] AclError),

    #[error("policy validation failed: {0}")]
    Policy(#[from] PolicyError),

    #[error("cluster '{cluster}' failed validation: {source}")]
    ClusterValidation {
        cluster: String,
        #[source]
        source: PluginError,
    },

    #[error("cluster '{cluster}' still hosts {instances} deployed instance(s)")]
    ClusterInUse { cluster: String, instances: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ViewError> for EngineError {
    fn from(err: ViewError) -> Self {
        match err {
            ViewError::Acl(e) => EngineError::Acl(e),
            ViewError::Policy(e) => EngineError::Policy(e),
        }
    }
}

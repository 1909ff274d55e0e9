//! Keel object model.
//!
//! Policy objects are a closed set of kinds (services, clusters, rules, ACL rules and claims),
//! each identified by `(namespace, kind, name)`. A [`Policy`] is the full object graph of one
//! [`Generation`]; generations are immutable once committed by the store.

// Configuration types shared across all Keel crates
pub mod config;
pub mod error;
pub mod generation;
pub mod object;
pub mod policy;
pub mod user;

pub use config::{ConfigError, KeelConfig};
pub use error::PolicyError;
pub use generation::{Generation, GenerationRef};
pub use object::{
    AclRule, Claim, Cluster, Code, Component, Criteria, Labels, Metadata, ObjectKey, ObjectKind,
    PolicyObject, Rule, RuleActions, Service, UpdateStrategy, CLUSTER_LABEL, SYSTEM_NAMESPACE,
};
pub use policy::Policy;
pub use user::{ExternalData, RoleGrant, RoleId, StaticUserDirectory, User, UserDirectory};

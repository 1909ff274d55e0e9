//! Policy object types.
//!
//! Every object is one variant of [`PolicyObject`] and carries [`Metadata`] with its namespace
//! and name. Objects are immutable once they are part of a generation: replacing an object means
//! adding a new one with the same [`ObjectKey`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PolicyError;
use crate::user::RoleGrant;

/// Reserved namespace for clusters, ACL rules and global rules.
pub const SYSTEM_NAMESPACE: &str = "system";

/// Label carrying the name of the cluster a claim resolves onto.
pub const CLUSTER_LABEL: &str = "cluster";

/// Free-form string labels attached to services, users and claims.
pub type Labels = BTreeMap<String, String>;

/// The fixed set of object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Service,
    Cluster,
    Rule,
    AclRule,
    Claim,
}

impl ObjectKind {
    /// All kinds, in key order.
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::Service,
        ObjectKind::Cluster,
        ObjectKind::Rule,
        ObjectKind::AclRule,
        ObjectKind::Claim,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Service => "service",
            ObjectKind::Cluster => "cluster",
            ObjectKind::Rule => "rule",
            ObjectKind::AclRule => "aclrule",
            ObjectKind::Claim => "claim",
        }
    }

    /// Whether objects of this kind may only live in the system namespace.
    pub fn is_system_only(&self) -> bool {
        matches!(self, ObjectKind::Cluster | ObjectKind::AclRule)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PolicyError::UnknownKind(s.to_string()))
    }
}

/// Canonical object identity: `namespace/kind/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ObjectKey {
    pub namespace: String,
    pub kind: ObjectKind,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [namespace, kind, name] if !namespace.is_empty() && !name.is_empty() => {
                let kind = kind
                    .parse()
                    .map_err(|_| PolicyError::InvalidKey(s.to_string()))?;
                Ok(ObjectKey::new(*namespace, kind, *name))
            }
            _ => Err(PolicyError::InvalidKey(s.to_string())),
        }
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Namespace and name of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub namespace: String,
    pub name: String,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// A service: a named set of components that claims can consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub metadata: Metadata,

    /// Labels merged into every claim resolved against this service.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,

    /// Label names whose values distinguish separate instances of this service.
    /// Claims agreeing on all of them share the same component instances.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_keys: Vec<String>,

    #[serde(default)]
    pub components: Vec<Component>,
}

/// One component of a service. Exactly one of `code` or `service` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Code>,

    /// Reference to another service, either `name` (same namespace) or `namespace/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Names of sibling components this one consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Deployable code attached to a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    #[serde(rename = "type")]
    pub code_type: String,

    /// Parameter template. String values may reference labels as `{{ label }}`.
    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default)]
    pub update: UpdateStrategy,
}

/// How a code executor handles parameter changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Parameters are updated on the running instance.
    #[default]
    InPlace,
    /// The instance is destroyed and deployed again.
    Recreate,
}

/// A deployment target. Lives in the system namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: Metadata,

    #[serde(rename = "type")]
    pub cluster_type: String,

    #[serde(default)]
    pub config: serde_json::Value,
}

/// Label criteria shared by global rules and ACL rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    /// Labels that must all be present with the given value (`*` matches any value).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub require_all: Labels,

    /// Labels that must not be present with the given value (`*` matches any value).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub require_none: Labels,

    /// Service names the criteria is restricted to. Empty means any service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// Effects of a matching global rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_labels: Labels,

    #[serde(default)]
    pub reject: bool,
}

/// A global rule applied to claims during resolution (e.g. cluster selection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub metadata: Metadata,

    /// Lower weights are applied first.
    #[serde(default)]
    pub weight: i32,

    #[serde(default)]
    pub criteria: Criteria,

    #[serde(default)]
    pub actions: RuleActions,
}

/// Grants a role to every user whose labels match `criteria`. Lives in the system namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclRule {
    pub metadata: Metadata,

    #[serde(default)]
    pub weight: i32,

    #[serde(default)]
    pub criteria: Criteria,

    pub grant: RoleGrant,
}

/// A consumer's declaration that it wants a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub metadata: Metadata,

    /// Name of the user on whose behalf the service is consumed.
    pub user: String,

    /// Service reference, either `name` (claim namespace) or `namespace/name`.
    pub service: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,

    #[serde(default)]
    pub disabled: bool,
}

impl Claim {
    pub fn is_active(&self) -> bool {
        !self.disabled
    }

    /// Namespace and name of the claimed service.
    pub fn service_ref(&self) -> (String, String) {
        split_service_ref(&self.service, &self.metadata.namespace)
    }
}

/// Split a `name` or `namespace/name` service reference.
pub fn split_service_ref(reference: &str, default_namespace: &str) -> (String, String) {
    match reference.split_once('/') {
        Some((namespace, name)) => (namespace.to_string(), name.to_string()),
        None => (default_namespace.to_string(), reference.to_string()),
    }
}

/// Compile a namespace pattern. `*` matches every namespace; anything else is an anchored regex.
pub fn namespace_matcher(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern == "*" {
        return Regex::new(".*");
    }
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Any typed, namespaced policy object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicyObject {
    Service(Service),
    Cluster(Cluster),
    Rule(Rule),
    AclRule(AclRule),
    Claim(Claim),
}

impl PolicyObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            PolicyObject::Service(_) => ObjectKind::Service,
            PolicyObject::Cluster(_) => ObjectKind::Cluster,
            PolicyObject::Rule(_) => ObjectKind::Rule,
            PolicyObject::AclRule(_) => ObjectKind::AclRule,
            PolicyObject::Claim(_) => ObjectKind::Claim,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            PolicyObject::Service(o) => &o.metadata,
            PolicyObject::Cluster(o) => &o.metadata,
            PolicyObject::Rule(o) => &o.metadata,
            PolicyObject::AclRule(o) => &o.metadata,
            PolicyObject::Claim(o) => &o.metadata,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.kind(), self.name())
    }
}

impl From<Service> for PolicyObject {
    fn from(value: Service) -> Self {
        PolicyObject::Service(value)
    }
}

impl From<Cluster> for PolicyObject {
    fn from(value: Cluster) -> Self {
        PolicyObject::Cluster(value)
    }
}

impl From<Rule> for PolicyObject {
    fn from(value: Rule) -> Self {
        PolicyObject::Rule(value)
    }
}

impl From<AclRule> for PolicyObject {
    fn from(value: AclRule) -> Self {
        PolicyObject::AclRule(value)
    }
}

impl From<Claim> for PolicyObject {
    fn from(value: Claim) -> Self {
        PolicyObject::Claim(value)
    }
}

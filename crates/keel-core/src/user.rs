//! Users, role grants and the external user directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::object::Labels;

/// Built-in roles understood by the ACL resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleId {
    DomainAdmin,
    NamespaceAdmin,
    ServiceConsumer,
    Viewer,
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleId::DomainAdmin => write!(f, "domain-admin"),
            RoleId::NamespaceAdmin => write!(f, "namespace-admin"),
            RoleId::ServiceConsumer => write!(f, "service-consumer"),
            RoleId::Viewer => write!(f, "viewer"),
        }
    }
}

/// A role held over a set of namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub role: RoleId,

    /// Namespace patterns (`*` or an anchored regex).
    #[serde(default = "all_namespaces")]
    pub namespaces: Vec<String>,
}

impl RoleGrant {
    pub fn new(role: RoleId, namespaces: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            role,
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }
}

fn all_namespaces() -> Vec<String> {
    vec!["*".to_string()]
}

/// An identity known to the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,

    #[serde(default)]
    pub labels: Labels,

    /// Roles granted statically by the directory, in addition to ACL rules.
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            roles: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_role(mut self, grant: RoleGrant) -> Self {
        self.roles.push(grant);
        self
    }
}

/// Source of user identities, external to the policy.
pub trait UserDirectory: Send + Sync {
    fn get_user(&self, name: &str) -> Option<User>;
}

/// In-memory user directory, typically loaded from the users file.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    users: BTreeMap<String, User>,
}

impl StaticUserDirectory {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.name.clone(), u)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl UserDirectory for StaticUserDirectory {
    fn get_user(&self, name: &str) -> Option<User> {
        self.users.get(name).cloned()
    }
}

/// External data the resolver reads besides the policy itself.
#[derive(Clone)]
pub struct ExternalData {
    pub users: Arc<dyn UserDirectory>,
}

impl ExternalData {
    pub fn new(users: Arc<dyn UserDirectory>) -> Self {
        Self { users }
    }
}

impl fmt::Debug for ExternalData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalData").finish_non_exhaustive()
    }
}

//! Typed plan actions.
//!
//! Each action carries the instance data needed to apply it, so applying never re-resolves the
//! policy.

use keel_core::ObjectKey;
use serde::Serialize;
use std::fmt;

use crate::state::{ComponentInstance, ComponentInstanceKey};

/// Kinds of actions, in the order plans render them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Delete,
    Create,
    Update,
    AttachClaim,
    DetachClaim,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Delete => "delete",
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::AttachClaim => "attach-claim",
            ActionKind::DetachClaim => "detach-claim",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Action {
    /// Deploy a new instance.
    Create { instance: ComponentInstance },
    /// Change a deployed instance in place.
    Update {
        previous: ComponentInstance,
        instance: ComponentInstance,
    },
    /// Destroy a deployed instance.
    Delete { instance: ComponentInstance },
    /// Record that a claim now reaches an instance.
    AttachClaim {
        key: ComponentInstanceKey,
        claim: ObjectKey,
    },
    /// Record that a claim no longer reaches an instance.
    DetachClaim {
        key: ComponentInstanceKey,
        claim: ObjectKey,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create { .. } => ActionKind::Create,
            Action::Update { .. } => ActionKind::Update,
            Action::Delete { .. } => ActionKind::Delete,
            Action::AttachClaim { .. } => ActionKind::AttachClaim,
            Action::DetachClaim { .. } => ActionKind::DetachClaim,
        }
    }

    /// Instance key the action targets.
    pub fn key(&self) -> &ComponentInstanceKey {
        match self {
            Action::Create { instance } | Action::Delete { instance } => &instance.key,
            Action::Update { instance, .. } => &instance.key,
            Action::AttachClaim { key, .. } | Action::DetachClaim { key, .. } => key,
        }
    }

    /// Instance data for actions that deploy or destroy.
    pub fn instance(&self) -> Option<&ComponentInstance> {
        match self {
            Action::Create { instance }
            | Action::Delete { instance }
            | Action::Update { instance, .. } => Some(instance),
            Action::AttachClaim { .. } | Action::DetachClaim { .. } => None,
        }
    }

    /// Unique identifier of the action within a plan.
    pub fn id(&self) -> String {
        match self {
            Action::AttachClaim { key, claim } | Action::DetachClaim { key, claim } => {
                format!("{}#{}#{}", self.kind(), key, claim)
            }
            _ => format!("{}#{}", self.kind(), self.key()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::AttachClaim { key, claim } | Action::DetachClaim { key, claim } => {
                write!(f, "{} {} {}", self.kind(), claim, key)
            }
            _ => write!(f, "{} {}", self.kind(), self.key()),
        }
    }
}

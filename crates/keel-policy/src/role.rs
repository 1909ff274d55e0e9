//! Built-in roles and their privilege tables.
//!
//! Each role has two tables indexed by object kind:
//! - **namespace** privileges apply to objects in namespaces the grant covers
//! - **global** privileges apply to objects in the system namespace, whatever the grant covers
//!
//! Manage always implies view in these tables.

use keel_core::{ObjectKind, RoleId};
use serde::Serialize;

/// What a user may do with one object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Privilege {
    pub view: bool,
    pub manage: bool,
}

impl Privilege {
    pub const NONE: Privilege = Privilege {
        view: false,
        manage: false,
    };
    pub const VIEW: Privilege = Privilege {
        view: true,
        manage: false,
    };
    pub const FULL: Privilege = Privilege {
        view: true,
        manage: true,
    };

    /// Combine two privileges. Grants only ever add up.
    pub fn union(self, other: Privilege) -> Privilege {
        Privilege {
            view: self.view || other.view,
            manage: self.manage || other.manage,
        }
    }
}

/// Per-kind privilege table, in [`ObjectKind::ALL`] order.
#[derive(Debug, Clone, Copy)]
struct KindTable([Privilege; 5]);

impl KindTable {
    const fn uniform(p: Privilege) -> Self {
        KindTable([p; 5])
    }

    fn get(&self, kind: ObjectKind) -> Privilege {
        let idx = match kind {
            ObjectKind::Service => 0,
            ObjectKind::Cluster => 1,
            ObjectKind::Rule => 2,
            ObjectKind::AclRule => 3,
            ObjectKind::Claim => 4,
        };
        self.0[idx]
    }
}

/// A built-in role.
#[derive(Debug, Clone, Copy)]
pub struct Role {
    pub id: RoleId,
    namespace: KindTable,
    global: KindTable,
}

const DOMAIN_ADMIN: Role = Role {
    id: RoleId::DomainAdmin,
    namespace: KindTable::uniform(Privilege::FULL),
    global: KindTable::uniform(Privilege::FULL),
};

const NAMESPACE_ADMIN: Role = Role {
    id: RoleId::NamespaceAdmin,
    //                   service          cluster          rule             aclrule          claim
    namespace: KindTable([Privilege::FULL, Privilege::VIEW, Privilege::FULL, Privilege::VIEW, Privilege::FULL]),
    global: KindTable::uniform(Privilege::VIEW),
};

const SERVICE_CONSUMER: Role = Role {
    id: RoleId::ServiceConsumer,
    namespace: KindTable([Privilege::VIEW, Privilege::NONE, Privilege::VIEW, Privilege::NONE, Privilege::FULL]),
    global: KindTable([Privilege::VIEW, Privilege::VIEW, Privilege::VIEW, Privilege::NONE, Privilege::NONE]),
};

const VIEWER: Role = Role {
    id: RoleId::Viewer,
    namespace: KindTable::uniform(Privilege::VIEW),
    global: KindTable::uniform(Privilege::VIEW),
};

impl Role {
    /// Look up the definition of a built-in role.
    pub fn builtin(id: RoleId) -> &'static Role {
        match id {
            RoleId::DomainAdmin => &DOMAIN_ADMIN,
            RoleId::NamespaceAdmin => &NAMESPACE_ADMIN,
            RoleId::ServiceConsumer => &SERVICE_CONSUMER,
            RoleId::Viewer => &VIEWER,
        }
    }

    /// Privilege over an object of `kind` in a namespace this role is granted for.
    pub fn namespace_privilege(&self, kind: ObjectKind) -> Privilege {
        self.namespace.get(kind)
    }

    /// Privilege over an object of `kind` in the system namespace.
    pub fn global_privilege(&self, kind: ObjectKind) -> Privilege {
        self.global.get(kind)
    }
}

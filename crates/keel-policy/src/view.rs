//! Per-user policy views.
//!
//! A [`PolicyView`] wraps a policy for one user. Read operations work over any `Borrow<Policy>`
//! (a shared snapshot); mutating operations need `BorrowMut<Policy>`, typically a working copy
//! that the store commits afterwards. Every operation asks the [`AclResolver`] first and never
//! touches the policy when the check fails.

use std::borrow::{Borrow, BorrowMut};

use keel_core::{
    Claim, Metadata, ObjectKey, ObjectKind, Policy, PolicyObject, Service, User,
};
use tracing::debug;

use crate::acl::AclResolver;
use crate::error::{AclError, ViewError};
use crate::role::Privilege;

/// A user's ACL-checked view of a policy.
pub struct PolicyView<'a, P> {
    policy: P,
    user: &'a User,
    resolver: &'a AclResolver,
}

impl<'a, P: Borrow<Policy>> PolicyView<'a, P> {
    pub fn new(policy: P, user: &'a User, resolver: &'a AclResolver) -> Self {
        Self {
            policy,
            user,
            resolver,
        }
    }

    pub fn user(&self) -> &User {
        self.user
    }

    pub fn policy(&self) -> &Policy {
        self.policy.borrow()
    }

    /// Release the wrapped policy.
    pub fn into_inner(self) -> P {
        self.policy
    }

    /// Privilege of the view's user over `key`.
    pub fn privileges(&self, key: &ObjectKey) -> Result<Privilege, AclError> {
        self.resolver.get_user_privileges(self.user, key)
    }

    /// Require view privilege over `obj`.
    pub fn view_object(&self, obj: &PolicyObject) -> Result<(), AclError> {
        self.require_view(&obj.key())
    }

    /// Require manage privilege over `obj`.
    pub fn manage_object(&self, obj: &PolicyObject) -> Result<(), AclError> {
        self.require_manage(&obj.key())
    }

    /// Whether the user may consume `service`, i.e. create a claim in its namespace.
    pub fn can_consume(&self, service: &Service) -> Result<bool, AclError> {
        let probe = PolicyObject::Claim(Claim {
            metadata: Metadata::new(service.metadata.namespace.clone(), "consume-probe"),
            user: self.user.name.clone(),
            service: service.metadata.name.clone(),
            labels: Default::default(),
            disabled: false,
        });
        Ok(self.privileges(&probe.key())?.manage)
    }

    /// Look up an object the user is allowed to see.
    pub fn get_object(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<&PolicyObject>, AclError> {
        match self.policy().get_object(kind, name, namespace) {
            Some(obj) => {
                self.view_object(obj)?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// Objects of `kind` the user is allowed to see, in key order.
    pub fn visible_objects(&self, kind: ObjectKind) -> Result<Vec<&PolicyObject>, AclError> {
        let mut visible = Vec::new();
        for obj in self.policy().get_objects_by_kind(kind) {
            if self.privileges(&obj.key())?.view {
                visible.push(obj);
            }
        }
        Ok(visible)
    }

    fn require_view(&self, key: &ObjectKey) -> Result<(), AclError> {
        if self.privileges(key)?.view {
            Ok(())
        } else {
            Err(AclError::view_denied(&self.user.name, key))
        }
    }

    fn require_manage(&self, key: &ObjectKey) -> Result<(), AclError> {
        if self.privileges(key)?.manage {
            Ok(())
        } else {
            Err(AclError::manage_denied(&self.user.name, key))
        }
    }
}

impl<'a, P: BorrowMut<Policy>> PolicyView<'a, P> {
    /// Add or replace an object. Requires manage privilege over it.
    ///
    /// Claims additionally require the user to be able to consume the claimed service when it
    /// exists in the policy.
    pub fn add_object(&mut self, obj: PolicyObject) -> Result<Option<PolicyObject>, ViewError> {
        self.manage_object(&obj)?;

        if let PolicyObject::Claim(claim) = &obj {
            let (namespace, name) = claim.service_ref();
            if let Some(service) = self.policy().service(&namespace, &name) {
                if !self.can_consume(service)? {
                    let key = ObjectKey::new(namespace, ObjectKind::Service, name);
                    return Err(AclError::consume_denied(&self.user.name, &key).into());
                }
            }
        }

        debug!(user = %self.user.name, object = %obj.key(), "Adding object");
        Ok(self.policy.borrow_mut().add_object(obj)?)
    }

    /// Remove an object. Requires manage privilege over it; absent objects are a no-op.
    pub fn remove_object(&mut self, key: &ObjectKey) -> Result<Option<PolicyObject>, ViewError> {
        self.require_manage(key)?;
        debug!(user = %self.user.name, object = %key, "Removing object");
        Ok(self.policy.borrow_mut().remove_object(key))
    }
}

//! ACL resolution.
//!
//! A user's effective grants are the static grants from the user directory plus the grants of
//! every ACL rule whose criteria match the user's labels. Privilege over an object is the union,
//! across grants, of:
//! - the role's namespace privilege, when a grant pattern matches the object's namespace
//! - the role's global privilege, when the object lives in the system namespace
//!
//! Anything not granted is denied.

use keel_core::object::namespace_matcher;
use keel_core::{AclRule, ObjectKey, ObjectKind, Policy, RoleGrant, RoleId, User, SYSTEM_NAMESPACE};
use regex::Regex;
use tracing::trace;

use crate::error::AclError;
use crate::role::{Privilege, Role};
use crate::rules::criteria_matches;

/// A role grant with compiled namespace patterns.
#[derive(Debug, Clone)]
struct CompiledGrant {
    role: RoleId,
    namespaces: Vec<Regex>,
}

impl CompiledGrant {
    fn compile(source: &str, grant: &RoleGrant) -> Result<Self, AclError> {
        let namespaces = grant
            .namespaces
            .iter()
            .map(|pattern| {
                namespace_matcher(pattern).map_err(|e| AclError::malformed_rule(source, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            role: grant.role,
            namespaces,
        })
    }

    fn covers(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|re| re.is_match(namespace))
    }

    fn privilege(&self, key: &ObjectKey) -> Privilege {
        let role = Role::builtin(self.role);
        let mut privilege = Privilege::NONE;
        if self.covers(&key.namespace) {
            privilege = privilege.union(role.namespace_privilege(key.kind));
        }
        if key.namespace == SYSTEM_NAMESPACE {
            privilege = privilege.union(role.global_privilege(key.kind));
        }
        privilege
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    key: ObjectKey,
    weight: i32,
    rule: AclRule,
    grant: CompiledGrant,
}

/// Computes user privileges from built-in roles and a policy's ACL rules.
#[derive(Debug, Clone, Default)]
pub struct AclResolver {
    rules: Vec<CompiledRule>,
}

impl AclResolver {
    /// Build a resolver from the ACL rules of a policy.
    ///
    /// Fails if any rule has a namespace pattern that does not compile.
    pub fn new(policy: &Policy) -> Result<Self, AclError> {
        Self::from_rules(policy.acl_rules())
    }

    /// Build a resolver from explicit ACL rules.
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a AclRule>) -> Result<Self, AclError> {
        let mut compiled = rules
            .into_iter()
            .map(|rule| {
                let key = ObjectKey::new(
                    rule.metadata.namespace.clone(),
                    ObjectKind::AclRule,
                    rule.metadata.name.clone(),
                );
                let grant = CompiledGrant::compile(&key.to_string(), &rule.grant)?;
                Ok(CompiledRule {
                    key,
                    weight: rule.weight,
                    rule: rule.clone(),
                    grant,
                })
            })
            .collect::<Result<Vec<_>, AclError>>()?;
        compiled.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.key.cmp(&b.key)));
        Ok(Self { rules: compiled })
    }

    /// All role grants in effect for `user`, static grants first.
    pub fn user_grants(&self, user: &User) -> Vec<RoleGrant> {
        let mut grants = user.roles.clone();
        for rule in &self.rules {
            if criteria_matches(&rule.rule.criteria, &user.labels, None) {
                grants.push(rule.rule.grant.clone());
            }
        }
        grants
    }

    fn compiled_grants(&self, user: &User) -> Result<Vec<CompiledGrant>, AclError> {
        let mut grants = user
            .roles
            .iter()
            .map(|grant| CompiledGrant::compile(&format!("user:{}", user.name), grant))
            .collect::<Result<Vec<_>, _>>()?;
        grants.extend(
            self.rules
                .iter()
                .filter(|rule| criteria_matches(&rule.rule.criteria, &user.labels, None))
                .map(|rule| rule.grant.clone()),
        );
        Ok(grants)
    }

    /// Privilege of `user` over the object identified by `key`.
    pub fn get_user_privileges(&self, user: &User, key: &ObjectKey) -> Result<Privilege, AclError> {
        let privilege = self
            .compiled_grants(user)?
            .iter()
            .fold(Privilege::NONE, |acc, grant| acc.union(grant.privilege(key)));
        trace!(
            user = %user.name,
            object = %key,
            view = privilege.view,
            manage = privilege.manage,
            "Resolved privileges"
        );
        Ok(privilege)
    }

    /// Whether `user` may create claims in `namespace`.
    pub fn can_consume(&self, user: &User, namespace: &str) -> Result<bool, AclError> {
        let claim_key = ObjectKey::new(namespace, ObjectKind::Claim, "*");
        Ok(self.get_user_privileges(user, &claim_key)?.manage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Criteria, Metadata};

    fn key(ns: &str, kind: ObjectKind, name: &str) -> ObjectKey {
        ObjectKey::new(ns, kind, name)
    }

    fn acl_rule(name: &str, weight: i32, team: &str, grant: RoleGrant) -> AclRule {
        AclRule {
            metadata: Metadata::new(SYSTEM_NAMESPACE, name),
            weight,
            criteria: Criteria {
                require_all: [("team".to_string(), team.to_string())].into(),
                ..Default::default()
            },
            grant,
        }
    }

    #[test]
    fn no_grants_means_no_privileges() {
        let resolver = AclResolver::default();
        let user = User::new("nobody");
        let p = resolver
            .get_user_privileges(&user, &key("ns1", ObjectKind::Service, "web"))
            .unwrap();
        assert_eq!(p, Privilege::NONE);
    }

    #[test]
    fn static_grants_are_namespace_scoped() {
        let resolver = AclResolver::default();
        let user = User::new("alice").with_role(RoleGrant::new(RoleId::NamespaceAdmin, ["ns1"]));

        let own = resolver
            .get_user_privileges(&user, &key("ns1", ObjectKind::Service, "web"))
            .unwrap();
        assert_eq!(own, Privilege::FULL);

        let other = resolver
            .get_user_privileges(&user, &key("ns2", ObjectKind::Service, "web"))
            .unwrap();
        assert_eq!(other, Privilege::NONE);

        // Global objects are visible but not manageable.
        let cluster = resolver
            .get_user_privileges(&user, &key(SYSTEM_NAMESPACE, ObjectKind::Cluster, "c1"))
            .unwrap();
        assert_eq!(cluster, Privilege::VIEW);
    }

    #[test]
    fn acl_rules_grant_roles_by_user_labels() {
        let rules = [acl_rule(
            "web-team",
            10,
            "web",
            RoleGrant::new(RoleId::ServiceConsumer, ["team-.*"]),
        )];
        let resolver = AclResolver::from_rules(rules.iter()).unwrap();

        let member = User::new("bob").with_label("team", "web");
        let outsider = User::new("eve").with_label("team", "db");

        assert!(resolver.can_consume(&member, "team-web").unwrap());
        assert!(!resolver.can_consume(&member, "prod").unwrap());
        assert!(!resolver.can_consume(&outsider, "team-web").unwrap());
        assert_eq!(resolver.user_grants(&member).len(), 1);
    }

    #[test]
    fn privileges_union_across_grants() {
        let user = User::new("carol")
            .with_role(RoleGrant::new(RoleId::Viewer, ["*"]))
            .with_role(RoleGrant::new(RoleId::ServiceConsumer, ["ns1"]));
        let resolver = AclResolver::default();

        let claim = resolver
            .get_user_privileges(&user, &key("ns1", ObjectKind::Claim, "c"))
            .unwrap();
        assert_eq!(claim, Privilege::FULL);

        let service = resolver
            .get_user_privileges(&user, &key("ns1", ObjectKind::Service, "s"))
            .unwrap();
        assert_eq!(service, Privilege::VIEW);
    }

    #[test]
    fn malformed_rule_pattern_is_reported() {
        let rules = [acl_rule(
            "broken",
            0,
            "web",
            RoleGrant::new(RoleId::Viewer, ["("]),
        )];
        let err = AclResolver::from_rules(rules.iter()).unwrap_err();
        assert_eq!(err.kind, crate::AclErrorKind::MalformedRule);
        assert!(err.message.contains("system/aclrule/broken"));
    }

    #[test]
    fn malformed_static_grant_is_reported_on_evaluation() {
        let user = User::new("dave").with_role(RoleGrant::new(RoleId::Viewer, ["[z-a]"]));
        let err = AclResolver::default()
            .get_user_privileges(&user, &key("ns1", ObjectKind::Service, "s"))
            .unwrap_err();
        assert_eq!(err.kind, crate::AclErrorKind::MalformedRule);
    }
}

//! Resolution state: component instances keyed by a stable instance key.
//!
//! The same type describes desired state (recomputed on every resolution) and actual state
//! (mutated only by successfully applied actions).

use keel_core::{ObjectKey, UpdateStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::error::ResolveError;

/// Identity of one deployable unit: `cluster#namespace#service#context#component`.
///
/// `%` and `#` inside a field are percent-encoded, so distinct coordinates never share a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentInstanceKey(String);

impl ComponentInstanceKey {
    pub fn new(cluster: &str, namespace: &str, service: &str, context: &str, component: &str) -> Self {
        Self(format!(
            "{}#{}#{}#{}#{}",
            escape(cluster),
            escape(namespace),
            escape(service),
            escape(context),
            escape(component)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape(field: &str) -> Cow<'_, str> {
    if field.contains(['%', '#']) {
        Cow::Owned(field.replace('%', "%25").replace('#', "%23"))
    } else {
        Cow::Borrowed(field)
    }
}

impl fmt::Display for ComponentInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved component instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub key: ComponentInstanceKey,
    pub namespace: String,
    pub service: String,
    pub component: String,
    pub context: String,
    pub cluster: String,
    pub code_type: String,
    /// Parameters with all label templates substituted.
    pub params: serde_json::Value,
    pub update: UpdateStrategy,
    /// Name the instance is deployed under. Two instances with the same deploy name occupy the
    /// same deployment slot.
    pub deploy_name: String,
    /// Claims that reach this instance.
    #[serde(default)]
    pub claims: BTreeSet<ObjectKey>,
    /// Instances this one consumes.
    #[serde(default)]
    pub dependencies: BTreeSet<ComponentInstanceKey>,
}

impl ComponentInstance {
    /// Whether `other` would be deployed identically.
    pub fn same_configuration(&self, other: &ComponentInstance) -> bool {
        self.cluster == other.cluster
            && self.code_type == other.code_type
            && self.params == other.params
            && self.deploy_name == other.deploy_name
    }
}

/// Hex digits of the key digest appended to every deploy name.
const DEPLOY_SUFFIX_LEN: usize = 10;

/// Build the deploy name of an instance: its coordinates lowercased, with anything other than
/// ASCII alphanumerics collapsed to single dashes, followed by a digest of the instance key.
/// Distinct keys get distinct names even when their coordinates sanitize alike.
pub fn deploy_name(
    key: &ComponentInstanceKey,
    namespace: &str,
    service: &str,
    context: &str,
    component: &str,
) -> String {
    let raw = format!("{}-{}-{}-{}", namespace, service, context, component);
    let mut name = String::with_capacity(raw.len() + DEPLOY_SUFFIX_LEN + 1);
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    let mut name = name.trim_matches('-').to_string();
    let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
    name.push('-');
    name.push_str(&digest[..DEPLOY_SUFFIX_LEN]);
    name
}

/// Whether `to` can be reached from `from` by following dependency edges.
fn reaches(
    instances: &BTreeMap<ComponentInstanceKey, ComponentInstance>,
    from: &ComponentInstanceKey,
    to: &ComponentInstanceKey,
) -> bool {
    let mut stack = vec![from];
    let mut seen = BTreeSet::new();
    while let Some(key) = stack.pop() {
        if key == to {
            return true;
        }
        if seen.insert(key) {
            if let Some(instance) = instances.get(key) {
                stack.extend(instance.dependencies.iter());
            }
        }
    }
    false
}

/// Add dependency edges to `key`, skipping any edge that would close a cycle: the instance
/// itself, and instances that already depend on it directly or transitively.
pub(crate) fn extend_dependencies(
    instances: &mut BTreeMap<ComponentInstanceKey, ComponentInstance>,
    key: &ComponentInstanceKey,
    candidates: impl IntoIterator<Item = ComponentInstanceKey>,
) {
    for dep in candidates {
        if reaches(instances, &dep, key) {
            debug!(instance = %key, dependency = %dep, "Skipping dependency that would form a cycle");
            continue;
        }
        if let Some(instance) = instances.get_mut(key) {
            instance.dependencies.insert(dep);
        }
    }
}

/// Outcome of detaching a claim from an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Other claims still reference the instance.
    StillReferenced(usize),
    /// The detached claim was the last one.
    LastReference,
    /// The claim was not attached (or the instance does not exist).
    NotAttached,
}

/// Component instances plus per-claim resolution failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionState {
    instances: BTreeMap<ComponentInstanceKey, ComponentInstance>,
    claim_errors: BTreeMap<ObjectKey, ResolveError>,
}

impl ResolutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ComponentInstanceKey) -> Option<&ComponentInstance> {
        self.instances.get(key)
    }

    pub fn contains(&self, key: &ComponentInstanceKey) -> bool {
        self.instances.contains_key(key)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ComponentInstance> {
        self.instances.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ComponentInstanceKey> {
        self.instances.keys()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Add dependency edges to an existing instance without ever forming a cycle.
    pub fn extend_dependencies(
        &mut self,
        key: &ComponentInstanceKey,
        candidates: impl IntoIterator<Item = ComponentInstanceKey>,
    ) {
        extend_dependencies(&mut self.instances, key, candidates);
    }

    /// Instances hosted on `cluster`.
    pub fn instances_on_cluster<'a>(
        &'a self,
        cluster: &'a str,
    ) -> impl Iterator<Item = &'a ComponentInstance> + 'a {
        self.instances.values().filter(move |i| i.cluster == cluster)
    }

    /// Insert or replace an instance, returning the previous one.
    pub fn upsert(&mut self, instance: ComponentInstance) -> Option<ComponentInstance> {
        self.instances.insert(instance.key.clone(), instance)
    }

    pub fn remove(&mut self, key: &ComponentInstanceKey) -> Option<ComponentInstance> {
        self.instances.remove(key)
    }

    /// Record that `claim` reaches `key`. Returns false if the instance does not exist.
    pub fn attach_claim(&mut self, key: &ComponentInstanceKey, claim: &ObjectKey) -> bool {
        match self.instances.get_mut(key) {
            Some(instance) => {
                instance.claims.insert(claim.clone());
                true
            }
            None => false,
        }
    }

    /// Record that `claim` no longer reaches `key`.
    pub fn detach_claim(&mut self, key: &ComponentInstanceKey, claim: &ObjectKey) -> Detached {
        let Some(instance) = self.instances.get_mut(key) else {
            return Detached::NotAttached;
        };
        if !instance.claims.remove(claim) {
            return Detached::NotAttached;
        }
        match instance.claims.len() {
            0 => Detached::LastReference,
            n => Detached::StillReferenced(n),
        }
    }

    pub fn claim_errors(&self) -> &BTreeMap<ObjectKey, ResolveError> {
        &self.claim_errors
    }

    pub fn record_claim_error(&mut self, claim: ObjectKey, error: ResolveError) {
        self.claim_errors.insert(claim, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ObjectKind;

    fn instance(key: &str) -> ComponentInstance {
        ComponentInstance {
            key: ComponentInstanceKey(key.to_string()),
            namespace: "ns1".to_string(),
            service: "web".to_string(),
            component: "app".to_string(),
            context: "default".to_string(),
            cluster: "c1".to_string(),
            code_type: "fake".to_string(),
            params: serde_json::json!({}),
            update: UpdateStrategy::InPlace,
            deploy_name: key.to_string(),
            claims: BTreeSet::new(),
            dependencies: BTreeSet::new(),
        }
    }

    fn name_of(cluster: &str, ns: &str, service: &str, context: &str, component: &str) -> String {
        let key = ComponentInstanceKey::new(cluster, ns, service, context, component);
        deploy_name(&key, ns, service, context, component)
    }

    #[test]
    fn deploy_names_are_sanitized() {
        let name = name_of("c1", "ns1", "Web", "team=a,env=prod", "front_end");
        let (readable, suffix) = name.rsplit_once('-').unwrap();
        assert_eq!(readable, "ns1-web-team-a-env-prod-front-end");
        assert_eq!(suffix.len(), DEPLOY_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, name_of("c1", "ns1", "Web", "team=a,env=prod", "front_end"));
    }

    #[test]
    fn deploy_names_do_not_collide_when_sanitized_alike() {
        assert_ne!(
            name_of("c1", "team-a", "web", "default", "app"),
            name_of("c1", "team", "a-web", "default", "app")
        );
        assert_ne!(
            name_of("c1", "ns1", "Web", "default", "app"),
            name_of("c1", "ns1", "web", "default", "app")
        );
    }

    #[test]
    fn key_fields_containing_separators_stay_distinct() {
        let a = ComponentInstanceKey::new("c1", "ns1", "a", "default#c", "x");
        let b = ComponentInstanceKey::new("c1", "ns1", "a#default", "c", "x");
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "c1#ns1#a#default%23c#x");
    }

    #[test]
    fn dependency_edges_never_close_a_cycle() {
        let mut state = ResolutionState::new();
        let a = ComponentInstanceKey("a".to_string());
        let b = ComponentInstanceKey("b".to_string());
        let c = ComponentInstanceKey("c".to_string());
        for key in ["a", "b", "c"] {
            state.upsert(instance(key));
        }
        state.extend_dependencies(&b, [a.clone()]);
        state.extend_dependencies(&c, [b.clone()]);

        // a -> c would close c -> b -> a; a -> a is a self edge
        state.extend_dependencies(&a, [c.clone(), a.clone()]);
        assert!(state.get(&a).unwrap().dependencies.is_empty());
        assert!(reaches(&state.instances, &c, &a));
        assert!(!reaches(&state.instances, &a, &c));
    }

    #[test]
    fn detach_reports_last_reference() {
        let mut state = ResolutionState::new();
        let key = ComponentInstanceKey("k".to_string());
        state.upsert(instance("k"));

        let c1 = ObjectKey::new("ns1", ObjectKind::Claim, "c1");
        let c2 = ObjectKey::new("ns1", ObjectKind::Claim, "c2");
        assert!(state.attach_claim(&key, &c1));
        assert!(state.attach_claim(&key, &c2));

        assert_eq!(state.detach_claim(&key, &c1), Detached::StillReferenced(1));
        assert_eq!(state.detach_claim(&key, &c1), Detached::NotAttached);
        assert_eq!(state.detach_claim(&key, &c2), Detached::LastReference);
    }

    #[test]
    fn attach_to_missing_instance_fails() {
        let mut state = ResolutionState::new();
        let claim = ObjectKey::new("ns1", ObjectKind::Claim, "c1");
        assert!(!state.attach_claim(&ComponentInstanceKey("nope".to_string()), &claim));
    }
}

//! The policy object graph of one generation.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::PolicyError;
use crate::object::{
    namespace_matcher, split_service_ref, AclRule, Claim, Cluster, ObjectKey, ObjectKind,
    PolicyObject, Rule, Service, CLUSTER_LABEL, SYSTEM_NAMESPACE,
};

/// All policy objects of one generation, indexed by `(namespace, kind, name)`.
///
/// Because keys order by namespace first, a namespace is a contiguous range of the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    objects: BTreeMap<ObjectKey, PolicyObject>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a policy from a batch of objects. Later objects replace earlier ones with the same key.
    pub fn from_objects(
        objects: impl IntoIterator<Item = PolicyObject>,
    ) -> Result<Self, PolicyError> {
        let mut policy = Self::new();
        for obj in objects {
            policy.add_object(obj)?;
        }
        Ok(policy)
    }

    /// Add or replace an object, returning the object it replaced.
    pub fn add_object(&mut self, obj: PolicyObject) -> Result<Option<PolicyObject>, PolicyError> {
        let key = obj.key();
        if key.namespace.is_empty() || key.name.is_empty() {
            return Err(PolicyError::invalid_object(
                key,
                "namespace and name must not be empty",
            ));
        }
        if key.name.contains('/') || key.namespace.contains('/') {
            return Err(PolicyError::invalid_object(
                key,
                "namespace and name must not contain '/'",
            ));
        }
        if key.kind.is_system_only() && key.namespace != SYSTEM_NAMESPACE {
            return Err(PolicyError::NotInSystemNamespace { key });
        }
        Ok(self.objects.insert(key, obj))
    }

    pub fn remove_object(&mut self, key: &ObjectKey) -> Option<PolicyObject> {
        self.objects.remove(key)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&PolicyObject> {
        self.objects.get(key)
    }

    pub fn get_object(&self, kind: ObjectKind, name: &str, namespace: &str) -> Option<&PolicyObject> {
        self.objects.get(&ObjectKey::new(namespace, kind, name))
    }

    pub fn get_objects_by_kind(&self, kind: ObjectKind) -> Vec<&PolicyObject> {
        self.objects.values().filter(|o| o.kind() == kind).collect()
    }

    pub fn objects(&self) -> impl Iterator<Item = &PolicyObject> {
        self.objects.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.objects.keys()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<&Service> {
        match self.get_object(ObjectKind::Service, name, namespace) {
            Some(PolicyObject::Service(s)) => Some(s),
            _ => None,
        }
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        match self.get_object(ObjectKind::Cluster, name, SYSTEM_NAMESPACE) {
            Some(PolicyObject::Cluster(c)) => Some(c),
            _ => None,
        }
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.objects.values().filter_map(|o| match o {
            PolicyObject::Service(s) => Some(s),
            _ => None,
        })
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.objects.values().filter_map(|o| match o {
            PolicyObject::Cluster(c) => Some(c),
            _ => None,
        })
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.objects.values().filter_map(|o| match o {
            PolicyObject::Rule(r) => Some(r),
            _ => None,
        })
    }

    pub fn acl_rules(&self) -> impl Iterator<Item = &AclRule> {
        self.objects.values().filter_map(|o| match o {
            PolicyObject::AclRule(r) => Some(r),
            _ => None,
        })
    }

    pub fn claims(&self) -> impl Iterator<Item = &Claim> {
        self.objects.values().filter_map(|o| match o {
            PolicyObject::Claim(c) => Some(c),
            _ => None,
        })
    }

    /// Check the structural invariants of the whole graph.
    ///
    /// Errors are reported for the first offending object in key order, so the same policy always
    /// yields the same error.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (key, obj) in &self.objects {
            if key.kind.is_system_only() && key.namespace != SYSTEM_NAMESPACE {
                return Err(PolicyError::NotInSystemNamespace { key: key.clone() });
            }
            match obj {
                PolicyObject::Service(service) => self.validate_service(key, service)?,
                PolicyObject::Cluster(cluster) => {
                    if cluster.cluster_type.is_empty() {
                        return Err(PolicyError::validation(key.clone(), "cluster type is empty"));
                    }
                }
                PolicyObject::Rule(rule) => {
                    self.validate_cluster_label(key, rule.actions.set_labels.get(CLUSTER_LABEL))?;
                }
                PolicyObject::AclRule(rule) => {
                    for pattern in &rule.grant.namespaces {
                        namespace_matcher(pattern).map_err(|e| {
                            PolicyError::validation(
                                key.clone(),
                                format!("invalid namespace pattern '{}': {}", pattern, e),
                            )
                        })?;
                    }
                }
                PolicyObject::Claim(claim) => {
                    let (namespace, name) = claim.service_ref();
                    if self.service(&namespace, &name).is_none() {
                        return Err(PolicyError::validation(
                            key.clone(),
                            format!("claimed service '{}/{}' does not exist", namespace, name),
                        ));
                    }
                    self.validate_cluster_label(key, claim.labels.get(CLUSTER_LABEL))?;
                }
            }
        }
        self.validate_composition()
    }

    fn validate_cluster_label(
        &self,
        key: &ObjectKey,
        cluster: Option<&String>,
    ) -> Result<(), PolicyError> {
        match cluster {
            Some(name) if self.cluster(name).is_none() => Err(PolicyError::validation(
                key.clone(),
                format!("cluster '{}' does not exist", name),
            )),
            _ => Ok(()),
        }
    }

    fn validate_service(&self, key: &ObjectKey, service: &Service) -> Result<(), PolicyError> {
        self.validate_cluster_label(key, service.labels.get(CLUSTER_LABEL))?;

        let mut names = BTreeSet::new();
        for component in &service.components {
            if !names.insert(component.name.as_str()) {
                return Err(PolicyError::validation(
                    key.clone(),
                    format!("duplicate component '{}'", component.name),
                ));
            }
            match (&component.code, &component.service) {
                (Some(_), None) => {}
                (None, Some(reference)) => {
                    let (namespace, name) = split_service_ref(reference, &key.namespace);
                    if self.service(&namespace, &name).is_none() {
                        return Err(PolicyError::validation(
                            key.clone(),
                            format!(
                                "component '{}' references missing service '{}/{}'",
                                component.name, namespace, name
                            ),
                        ));
                    }
                }
                _ => {
                    return Err(PolicyError::validation(
                        key.clone(),
                        format!(
                            "component '{}' must define exactly one of code or service",
                            component.name
                        ),
                    ));
                }
            }
        }

        for component in &service.components {
            for dependency in &component.dependencies {
                if !names.contains(dependency.as_str()) || dependency == &component.name {
                    return Err(PolicyError::validation(
                        key.clone(),
                        format!(
                            "component '{}' depends on unknown component '{}'",
                            component.name, dependency
                        ),
                    ));
                }
            }
        }

        // Component dependency graph must be acyclic.
        let edges: BTreeMap<&str, Vec<&str>> = service
            .components
            .iter()
            .map(|c| {
                (
                    c.name.as_str(),
                    c.dependencies.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        let mut marks = BTreeMap::new();
        for component in &service.components {
            let start = component.name.as_str();
            if let Some(path) = find_cycle(start, &edges, &mut marks, &mut Vec::new()) {
                return Err(PolicyError::validation(
                    key.clone(),
                    format!("component dependency cycle: {}", path.join(" -> ")),
                ));
            }
        }
        Ok(())
    }

    /// Services must not contain themselves, directly or transitively.
    fn validate_composition(&self) -> Result<(), PolicyError> {
        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for service in self.services() {
            let from = format!("{}/{}", service.metadata.namespace, service.metadata.name);
            let targets = service
                .components
                .iter()
                .filter_map(|c| c.service.as_deref())
                .map(|reference| {
                    let (namespace, name) = split_service_ref(reference, &service.metadata.namespace);
                    format!("{}/{}", namespace, name)
                })
                .collect();
            edges.insert(from, targets);
        }

        let edges_ref: BTreeMap<&str, Vec<&str>> = edges
            .iter()
            .map(|(k, v)| (k.as_str(), v.iter().map(String::as_str).collect()))
            .collect();
        let mut marks = BTreeMap::new();
        for from in edges_ref.keys().copied() {
            if let Some(path) = find_cycle(from, &edges_ref, &mut marks, &mut Vec::new()) {
                let (namespace, name) = split_service_ref(from, SYSTEM_NAMESPACE);
                return Err(PolicyError::validation(
                    ObjectKey::new(namespace, ObjectKind::Service, name),
                    format!("service composition cycle: {}", path.join(" -> ")),
                ));
            }
        }
        Ok(())
    }
}

/// Depth-first search returning the first cycle reachable from `node`, as a path.
fn find_cycle<'a>(
    node: &'a str,
    edges: &BTreeMap<&'a str, Vec<&'a str>>,
    marks: &mut BTreeMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(node) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| *n == node).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            path.push(node.to_string());
            return Some(path);
        }
        None => {}
    }
    marks.insert(node, Mark::Visiting);
    stack.push(node);
    if let Some(next) = edges.get(node) {
        for target in next {
            if let Some(path) = find_cycle(*target, edges, marks, stack) {
                return Some(path);
            }
        }
    }
    stack.pop();
    marks.insert(node, Mark::Done);
    None
}

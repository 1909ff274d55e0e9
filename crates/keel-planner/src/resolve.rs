//! Dependency resolution: claims to component instances.
//!
//! For each active claim, in key order:
//! 1. labels are merged (service, then user, then claim labels)
//! 2. global rules visible from the service's namespace are applied
//! 3. the target cluster is read from the `cluster` label
//! 4. the service's components are walked in dependency order; code components become instances,
//!    service components recurse into the referenced service
//!
//! Instances of one claim are staged and merged into the state only if the whole claim resolves,
//! so a failing claim leaves no partial instances behind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use keel_core::{
    object::split_service_ref, Claim, Component, ExternalData, Labels, ObjectKey, ObjectKind,
    Policy, Service, CLUSTER_LABEL,
};
use keel_policy::RuleEvaluator;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::ResolveError;
use crate::state::{
    deploy_name, extend_dependencies, ComponentInstance, ComponentInstanceKey, ResolutionState,
};

static TEMPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-/]+)\s*\}\}").expect("template pattern is valid")
});

/// Context value used by services without context keys.
pub const DEFAULT_CONTEXT: &str = "default";

/// Resolves the claims of one policy generation.
pub struct PolicyResolver<'a> {
    policy: &'a Policy,
    external: &'a ExternalData,
}

/// Everything that is fixed for the duration of one claim.
struct ClaimScope<'c> {
    claim: ObjectKey,
    labels: &'c Labels,
    cluster: &'c str,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(policy: &'a Policy, external: &'a ExternalData) -> Self {
        Self { policy, external }
    }

    /// Resolve every active claim into the desired state.
    ///
    /// Claims that fail are recorded in [`ResolutionState::claim_errors`]; the others resolve
    /// normally. The result depends only on the policy and the external data.
    pub fn resolve_all_dependencies(&self) -> ResolutionState {
        let mut state = ResolutionState::new();

        for claim in self.policy.claims().filter(|c| c.is_active()) {
            let claim_key = ObjectKey::new(
                claim.metadata.namespace.clone(),
                ObjectKind::Claim,
                claim.metadata.name.clone(),
            );

            let result = self
                .resolve_claim(claim, &claim_key)
                .and_then(|staged| merge(&mut state, staged, &claim_key));

            if let Err(err) = result {
                warn!(claim = %claim_key, error = %err, "Claim resolution failed");
                state.record_claim_error(claim_key, err);
            }
        }

        info!(
            instances = state.len(),
            failed_claims = state.claim_errors().len(),
            "Resolved policy"
        );
        state
    }

    fn resolve_claim(
        &self,
        claim: &Claim,
        claim_key: &ObjectKey,
    ) -> Result<BTreeMap<ComponentInstanceKey, ComponentInstance>, ResolveError> {
        let user = self
            .external
            .users
            .get_user(&claim.user)
            .ok_or_else(|| ResolveError::UnknownUser {
                user: claim.user.clone(),
            })?;

        let (namespace, name) = claim.service_ref();
        let service = self.service(&namespace, &name)?;

        let mut labels = service.labels.clone();
        labels.extend(user.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels.extend(claim.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let outcome = RuleEvaluator::new(self.policy, &namespace).apply(&mut labels, &name);
        if let Some(rule) = outcome.rejected_by {
            return Err(ResolveError::Rejected { rule });
        }

        let cluster = labels
            .get(CLUSTER_LABEL)
            .cloned()
            .ok_or(ResolveError::NoCluster)?;
        if self.policy.cluster(&cluster).is_none() {
            return Err(ResolveError::UnknownCluster { name: cluster });
        }

        let scope = ClaimScope {
            claim: claim_key.clone(),
            labels: &labels,
            cluster: &cluster,
        };
        let mut staged = BTreeMap::new();
        let mut stack = Vec::new();
        self.resolve_service(&scope, service, &BTreeSet::new(), &mut stack, &mut staged)?;

        debug!(claim = %claim_key, instances = staged.len(), "Resolved claim");
        Ok(staged)
    }

    /// Resolve one service for a claim, returning the keys of every instance it produced.
    fn resolve_service(
        &self,
        scope: &ClaimScope<'_>,
        service: &Service,
        inherited: &BTreeSet<ComponentInstanceKey>,
        stack: &mut Vec<ObjectKey>,
        staged: &mut BTreeMap<ComponentInstanceKey, ComponentInstance>,
    ) -> Result<Vec<ComponentInstanceKey>, ResolveError> {
        let service_key = ObjectKey::new(
            service.metadata.namespace.clone(),
            ObjectKind::Service,
            service.metadata.name.clone(),
        );
        if stack.contains(&service_key) {
            let mut path: Vec<String> = stack.iter().map(ToString::to_string).collect();
            path.push(service_key.to_string());
            return Err(ResolveError::CompositionCycle {
                path: path.join(" -> "),
            });
        }
        stack.push(service_key);

        let context = context_of(service, scope.labels)?;
        let mut produced: BTreeMap<&str, Vec<ComponentInstanceKey>> = BTreeMap::new();
        let mut all = Vec::new();

        for component in component_order(service)? {
            let mut dependencies = inherited.clone();
            for dep in &component.dependencies {
                let keys = produced.get(dep.as_str()).ok_or_else(|| {
                    ResolveError::UnknownComponent {
                        service: service.metadata.name.clone(),
                        component: dep.clone(),
                    }
                })?;
                dependencies.extend(keys.iter().cloned());
            }

            let keys = if let Some(code) = &component.code {
                let key = ComponentInstanceKey::new(
                    scope.cluster,
                    &service.metadata.namespace,
                    &service.metadata.name,
                    &context,
                    &component.name,
                );
                let params = render_params(&code.params, scope.labels, &component.name)?;
                let instance = ComponentInstance {
                    key: key.clone(),
                    namespace: service.metadata.namespace.clone(),
                    service: service.metadata.name.clone(),
                    component: component.name.clone(),
                    context: context.clone(),
                    cluster: scope.cluster.to_string(),
                    code_type: code.code_type.clone(),
                    params,
                    update: code.update,
                    deploy_name: deploy_name(
                        &key,
                        &service.metadata.namespace,
                        &service.metadata.name,
                        &context,
                        &component.name,
                    ),
                    claims: BTreeSet::from([scope.claim.clone()]),
                    dependencies,
                };
                stage(staged, instance)?;
                vec![key]
            } else if let Some(reference) = &component.service {
                let (namespace, name) = split_service_ref(reference, &service.metadata.namespace);
                let nested = self.service(&namespace, &name)?;
                self.resolve_service(scope, nested, &dependencies, stack, staged)?
            } else {
                Vec::new()
            };

            all.extend(keys.iter().cloned());
            produced.insert(component.name.as_str(), keys);
        }

        stack.pop();
        Ok(all)
    }

    fn service(&self, namespace: &str, name: &str) -> Result<&'a Service, ResolveError> {
        self.policy
            .service(namespace, name)
            .ok_or_else(|| ResolveError::UnknownService {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

/// Add an instance to the claim's staging area. A claim may reach the same instance twice
/// through different paths; that is fine as long as it resolves identically. The second path
/// only contributes dependency edges that keep the graph acyclic.
fn stage(
    staged: &mut BTreeMap<ComponentInstanceKey, ComponentInstance>,
    instance: ComponentInstance,
) -> Result<(), ResolveError> {
    let same = staged
        .get(&instance.key)
        .map(|existing| existing.same_configuration(&instance));
    match same {
        Some(true) => {
            let key = instance.key.clone();
            extend_dependencies(staged, &key, instance.dependencies);
            Ok(())
        }
        Some(false) => Err(ResolveError::ConflictingParameters { key: instance.key }),
        None => {
            staged.insert(instance.key.clone(), instance);
            Ok(())
        }
    }
}

/// Merge a claim's staged instances into the state, sharing instances other claims produced.
///
/// New instances go in first; nothing already in the state can point at them, so they cannot
/// close a cycle. Shared instances then gain the claim's edges one at a time.
fn merge(
    state: &mut ResolutionState,
    staged: BTreeMap<ComponentInstanceKey, ComponentInstance>,
    claim: &ObjectKey,
) -> Result<(), ResolveError> {
    for (key, instance) in &staged {
        if let Some(existing) = state.get(key) {
            if !existing.same_configuration(instance) {
                return Err(ResolveError::ConflictingParameters { key: key.clone() });
            }
        }
    }

    let mut shared = Vec::new();
    for (key, instance) in staged {
        if state.contains(&key) {
            shared.push((key, instance.dependencies));
        } else {
            state.upsert(instance);
        }
    }
    for (key, dependencies) in shared {
        state.extend_dependencies(&key, dependencies);
        state.attach_claim(&key, claim);
    }
    Ok(())
}

/// Context string of a service for the given labels.
fn context_of(service: &Service, labels: &Labels) -> Result<String, ResolveError> {
    if service.context_keys.is_empty() {
        return Ok(DEFAULT_CONTEXT.to_string());
    }
    let parts = service
        .context_keys
        .iter()
        .map(|label| match labels.get(label) {
            Some(value) => Ok(format!("{}={}", label, value)),
            None => Err(ResolveError::MissingContextLabel {
                service: service.metadata.name.clone(),
                label: label.clone(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(","))
}

/// Components sorted so that every component comes after its dependencies. Ties keep
/// declaration order.
fn component_order(service: &Service) -> Result<Vec<&Component>, ResolveError> {
    let mut remaining: Vec<&Component> = service.components.iter().collect();
    let mut done: BTreeSet<&str> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|c| {
            c.dependencies.iter().all(|d| {
                done.contains(d.as_str())
                    || !service.components.iter().any(|other| &other.name == d)
            })
        });
        match ready {
            Some(idx) => {
                let component = remaining.remove(idx);
                done.insert(component.name.as_str());
                ordered.push(component);
            }
            None => {
                return Err(ResolveError::ComponentCycle {
                    service: service.metadata.name.clone(),
                });
            }
        }
    }
    Ok(ordered)
}

/// Substitute `{{ label }}` references in every string of a parameter tree.
fn render_params(
    params: &serde_json::Value,
    labels: &Labels,
    component: &str,
) -> Result<serde_json::Value, ResolveError> {
    use serde_json::Value;

    Ok(match params {
        Value::String(s) => Value::String(render_string(s, labels, component)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_params(v, labels, component))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_params(v, labels, component)?)))
                .collect::<Result<_, ResolveError>>()?,
        ),
        other => other.clone(),
    })
}

fn render_string(template: &str, labels: &Labels, component: &str) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in TEMPLATE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = labels
            .get(name.as_str())
            .ok_or_else(|| ResolveError::MissingLabel {
                component: component.to_string(),
                label: name.as_str().to_string(),
            })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{
        Cluster, Code, Criteria, Metadata, PolicyObject, Rule, RuleActions, StaticUserDirectory,
        UpdateStrategy, User,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn code(code_type: &str, params: serde_json::Value) -> Code {
        Code {
            code_type: code_type.to_string(),
            params,
            update: UpdateStrategy::InPlace,
        }
    }

    fn code_component(name: &str, params: serde_json::Value, deps: &[&str]) -> Component {
        Component {
            name: name.to_string(),
            code: Some(code("fake", params)),
            service: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn service_component(name: &str, reference: &str) -> Component {
        Component {
            name: name.to_string(),
            code: None,
            service: Some(reference.to_string()),
            dependencies: Vec::new(),
        }
    }

    fn service(ns: &str, name: &str, components: Vec<Component>) -> PolicyObject {
        PolicyObject::Service(Service {
            metadata: Metadata::new(ns, name),
            labels: Labels::new(),
            context_keys: Vec::new(),
            components,
        })
    }

    fn claim(ns: &str, name: &str, user: &str, service: &str, labels: &[(&str, &str)]) -> PolicyObject {
        PolicyObject::Claim(Claim {
            metadata: Metadata::new(ns, name),
            user: user.to_string(),
            service: service.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            disabled: false,
        })
    }

    fn cluster(name: &str) -> PolicyObject {
        PolicyObject::Cluster(Cluster {
            metadata: Metadata::new("system", name),
            cluster_type: "fake".to_string(),
            config: serde_json::Value::Null,
        })
    }

    fn external() -> ExternalData {
        ExternalData::new(Arc::new(StaticUserDirectory::new([
            User::new("alice").with_label("team", "web"),
            User::new("bob").with_label("team", "db"),
        ])))
    }

    fn policy(objects: Vec<PolicyObject>) -> Policy {
        Policy::from_objects(objects).unwrap()
    }

    fn web_policy() -> Policy {
        policy(vec![
            cluster("c1"),
            service(
                "ns1",
                "db",
                vec![code_component("postgres", serde_json::json!({"owner": "{{ team }}"}), &[])],
            ),
            service(
                "ns1",
                "web",
                vec![
                    service_component("storage", "db"),
                    code_component(
                        "app",
                        serde_json::json!({"image": "web:1", "replicas": 2}),
                        &["storage"],
                    ),
                ],
            ),
            claim("ns1", "alice-web", "alice", "web", &[("cluster", "c1")]),
        ])
    }

    #[test]
    fn resolves_nested_services_with_dependencies() {
        let policy = web_policy();
        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();

        assert!(state.claim_errors().is_empty());
        assert_eq!(state.len(), 2);

        let db = ComponentInstanceKey::new("c1", "ns1", "db", "default", "postgres");
        let app = ComponentInstanceKey::new("c1", "ns1", "web", "default", "app");
        assert_eq!(
            state.get(&db).unwrap().params,
            serde_json::json!({"owner": "web"})
        );
        let app_instance = state.get(&app).unwrap();
        assert_eq!(app_instance.dependencies, BTreeSet::from([db]));
        assert!(app_instance.deploy_name.starts_with("ns1-web-default-app-"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let policy = web_policy();
        let external = external();
        let first = PolicyResolver::new(&policy, &external).resolve_all_dependencies();
        let second = PolicyResolver::new(&policy, &external).resolve_all_dependencies();
        assert_eq!(first, second);

        let a: Vec<_> = first.instances().collect();
        let b: Vec<_> = second.instances().collect();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn claims_agreeing_on_context_share_instances() {
        let mut policy = web_policy();
        policy
            .add_object(claim("ns1", "bob-web", "bob", "web", &[("cluster", "c1"), ("team", "web")]))
            .unwrap();
        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();

        let app = ComponentInstanceKey::new("c1", "ns1", "web", "default", "app");
        assert_eq!(state.len(), 2);
        assert_eq!(state.get(&app).unwrap().claims.len(), 2);
    }

    #[test]
    fn conflicting_parameters_fail_the_later_claim_only() {
        let mut policy = web_policy();
        // bob's team label renders a different owner for the shared db instance
        policy
            .add_object(claim("ns1", "bob-web", "bob", "web", &[("cluster", "c1")]))
            .unwrap();
        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();

        let bob = ObjectKey::new("ns1", ObjectKind::Claim, "bob-web");
        assert!(matches!(
            state.claim_errors().get(&bob),
            Some(ResolveError::ConflictingParameters { .. })
        ));
        assert_eq!(state.len(), 2);
        assert!(state.instances().all(|i| i.claims.len() == 1));
    }

    #[test]
    fn composition_cycles_are_rejected() {
        let policy = policy(vec![
            cluster("c1"),
            service("ns1", "a", vec![service_component("b", "b")]),
            service("ns1", "b", vec![service_component("a", "a")]),
            claim("ns1", "loop", "alice", "a", &[("cluster", "c1")]),
        ]);
        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();

        let key = ObjectKey::new("ns1", ObjectKind::Claim, "loop");
        assert!(matches!(
            state.claim_errors().get(&key),
            Some(ResolveError::CompositionCycle { .. })
        ));
        assert!(state.is_empty());
    }

    #[test]
    fn diamond_composition_resolves_to_an_acyclic_graph() {
        // d uses b directly and through a, and a's p component waits for its own q
        let b = ComponentInstanceKey::new("c1", "ns1", "b", "default", "x");
        let q = ComponentInstanceKey::new("c1", "ns1", "a", "default", "q");
        let mut use_a = service_component("usea", "a");
        use_a.dependencies = vec!["useb".to_string()];
        let mut p = service_component("p", "b");
        p.dependencies = vec!["q".to_string()];

        let policy = policy(vec![
            cluster("c1"),
            service("ns1", "b", vec![code_component("x", serde_json::json!({}), &[])]),
            service(
                "ns1",
                "a",
                vec![code_component("q", serde_json::json!({}), &[]), p],
            ),
            service("ns1", "d", vec![service_component("useb", "b"), use_a]),
            claim("ns1", "diamond", "alice", "d", &[("cluster", "c1")]),
        ]);
        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();

        assert!(state.claim_errors().is_empty());
        assert_eq!(state.len(), 2);
        assert!(state.get(&b).unwrap().dependencies.is_empty());
        assert_eq!(state.get(&q).unwrap().dependencies, BTreeSet::from([b.clone()]));
        let diff = crate::diff::PolicyResolutionDiff::new(&state, &ResolutionState::new());
        assert_eq!(diff.plan.linearize().unwrap().len(), 2);
    }

    #[test]
    fn rules_select_cluster_and_can_reject() {
        let mut policy = web_policy();
        policy.remove_object(&ObjectKey::new("ns1", ObjectKind::Claim, "alice-web"));
        policy.add_object(cluster("c2")).unwrap();
        policy
            .add_object(PolicyObject::Rule(Rule {
                metadata: Metadata::new("system", "web-team-on-c2"),
                weight: 10,
                criteria: Criteria {
                    require_all: [("team".to_string(), "web".to_string())].into(),
                    ..Default::default()
                },
                actions: RuleActions {
                    set_labels: [("cluster".to_string(), "c2".to_string())].into(),
                    reject: false,
                },
            }))
            .unwrap();
        policy
            .add_object(PolicyObject::Rule(Rule {
                metadata: Metadata::new("system", "no-db-team"),
                weight: 20,
                criteria: Criteria {
                    require_all: [("team".to_string(), "db".to_string())].into(),
                    ..Default::default()
                },
                actions: RuleActions {
                    set_labels: Labels::new(),
                    reject: true,
                },
            }))
            .unwrap();
        policy
            .add_object(claim("ns1", "alice-web", "alice", "web", &[]))
            .unwrap();
        policy
            .add_object(claim("ns1", "bob-web", "bob", "web", &[]))
            .unwrap();

        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();

        assert!(state.instances().all(|i| i.cluster == "c2"));
        let bob = ObjectKey::new("ns1", ObjectKind::Claim, "bob-web");
        assert!(matches!(
            state.claim_errors().get(&bob),
            Some(ResolveError::Rejected { .. })
        ));
    }

    #[test]
    fn missing_template_label_fails_claim() {
        let policy = policy(vec![
            cluster("c1"),
            service(
                "ns1",
                "svc",
                vec![code_component("x", serde_json::json!(["{{ nope }}"]), &[])],
            ),
            claim("ns1", "c", "alice", "svc", &[("cluster", "c1")]),
        ]);
        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();
        let key = ObjectKey::new("ns1", ObjectKind::Claim, "c");
        assert_eq!(
            state.claim_errors().get(&key),
            Some(&ResolveError::MissingLabel {
                component: "x".to_string(),
                label: "nope".to_string(),
            })
        );
    }

    #[test]
    fn unknown_user_fails_claim() {
        let policy = policy(vec![
            cluster("c1"),
            service("ns1", "svc", vec![code_component("x", serde_json::json!({}), &[])]),
            claim("ns1", "c", "mallory", "svc", &[("cluster", "c1")]),
        ]);
        let external = external();
        let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();
        assert_eq!(state.claim_errors().len(), 1);
        assert!(state.is_empty());
    }
}

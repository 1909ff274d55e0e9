//! Desired vs actual state diff.
//!
//! The diff is a pure function of the two states. Actions are emitted grouped by kind and sorted
//! by key, then ordered with edges:
//! - deleting a consumer comes before deleting what it depends on
//! - creating or updating an instance comes after deleting the same key or deploy slot
//! - creating or updating an instance comes after creating or updating its dependencies
//! - claim bookkeeping on an instance comes after creating or updating it

use keel_core::UpdateStrategy;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::action::Action;
use crate::plan::{Plan, PlanSummary};
use crate::state::{ComponentInstanceKey, ResolutionState};

/// The plan turning `actual` into `desired`.
#[derive(Debug, Clone)]
pub struct PolicyResolutionDiff {
    pub plan: Plan,
    pub summary: PlanSummary,
}

impl PolicyResolutionDiff {
    pub fn new(desired: &ResolutionState, actual: &ResolutionState) -> Self {
        let mut deletes = Vec::new();
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut attaches = Vec::new();
        let mut detaches = Vec::new();

        for current in actual.instances() {
            if !desired.contains(&current.key) {
                deletes.push(Action::Delete {
                    instance: current.clone(),
                });
            }
        }

        for wanted in desired.instances() {
            let Some(current) = actual.get(&wanted.key) else {
                creates.push(Action::Create {
                    instance: wanted.clone(),
                });
                continue;
            };

            if !wanted.same_configuration(current) {
                match wanted.update {
                    UpdateStrategy::Recreate => {
                        deletes.push(Action::Delete {
                            instance: current.clone(),
                        });
                        creates.push(Action::Create {
                            instance: wanted.clone(),
                        });
                        continue;
                    }
                    UpdateStrategy::InPlace => updates.push(Action::Update {
                        previous: current.clone(),
                        instance: wanted.clone(),
                    }),
                }
            }

            for claim in wanted.claims.difference(&current.claims) {
                attaches.push(Action::AttachClaim {
                    key: wanted.key.clone(),
                    claim: claim.clone(),
                });
            }
            for claim in current.claims.difference(&wanted.claims) {
                detaches.push(Action::DetachClaim {
                    key: wanted.key.clone(),
                    claim: claim.clone(),
                });
            }
        }

        deletes.sort_by(|a, b| a.key().cmp(b.key()));

        let mut actions = deletes;
        actions.extend(creates);
        actions.extend(updates);
        actions.extend(attaches);
        actions.extend(detaches);

        let plan = order(actions);
        let summary = plan.summary();
        debug!(%summary, "Computed resolution diff");
        if let Err(err) = plan.linearize() {
            warn!(error = %err, "Resolution diff contains an ordering cycle");
        }

        Self { plan, summary }
    }
}

fn order(actions: Vec<Action>) -> Plan {
    let edges = ordering_edges(&actions);
    let mut plan = Plan::new(actions);
    for (before, after) in edges {
        plan.add_edge(before, after);
    }
    plan
}

fn ordering_edges(actions: &[Action]) -> Vec<(usize, usize)> {
    let mut delete_by_key: BTreeMap<&ComponentInstanceKey, usize> = BTreeMap::new();
    let mut deletes_by_slot: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut mutate_by_key: BTreeMap<&ComponentInstanceKey, usize> = BTreeMap::new();

    for (i, action) in actions.iter().enumerate() {
        match action {
            Action::Delete { instance } => {
                delete_by_key.insert(&instance.key, i);
                deletes_by_slot
                    .entry(instance.deploy_name.as_str())
                    .or_default()
                    .push(i);
            }
            Action::Create { instance } | Action::Update { instance, .. } => {
                mutate_by_key.insert(&instance.key, i);
            }
            _ => {}
        }
    }

    let mut edges = Vec::new();
    for (i, action) in actions.iter().enumerate() {
        match action {
            Action::Delete { instance } => {
                for dep in &instance.dependencies {
                    if let Some(&j) = delete_by_key.get(dep) {
                        edges.push((i, j));
                    }
                }
            }
            Action::Create { instance } | Action::Update { instance, .. } => {
                if let Some(&j) = delete_by_key.get(&instance.key) {
                    edges.push((j, i));
                }
                for &j in deletes_by_slot
                    .get(instance.deploy_name.as_str())
                    .into_iter()
                    .flatten()
                {
                    edges.push((j, i));
                }
                for dep in &instance.dependencies {
                    if let Some(&j) = mutate_by_key.get(dep) {
                        edges.push((j, i));
                    }
                }
            }
            Action::AttachClaim { key, .. } | Action::DetachClaim { key, .. } => {
                if let Some(&j) = mutate_by_key.get(key) {
                    edges.push((j, i));
                }
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::error::PlanError;
    use crate::state::ComponentInstance;
    use keel_core::{ObjectKey, ObjectKind};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn claim(name: &str) -> ObjectKey {
        ObjectKey::new("ns1", ObjectKind::Claim, name)
    }

    fn key(component: &str) -> ComponentInstanceKey {
        ComponentInstanceKey::new("c1", "ns1", "web", "default", component)
    }

    fn instance(component: &str, claims: &[&str], deps: &[&str]) -> ComponentInstance {
        ComponentInstance {
            key: key(component),
            namespace: "ns1".to_string(),
            service: "web".to_string(),
            component: component.to_string(),
            context: "default".to_string(),
            cluster: "c1".to_string(),
            code_type: "fake".to_string(),
            params: serde_json::json!({"v": 1}),
            update: UpdateStrategy::InPlace,
            deploy_name: format!("ns1-web-default-{}", component),
            claims: claims.iter().map(|c| claim(c)).collect(),
            dependencies: deps.iter().map(|d| key(d)).collect(),
        }
    }

    fn state(instances: Vec<ComponentInstance>) -> ResolutionState {
        let mut state = ResolutionState::new();
        for i in instances {
            state.upsert(i);
        }
        state
    }

    fn kinds(plan: &Plan) -> Vec<(ActionKind, String)> {
        plan.ordered_actions()
            .unwrap()
            .into_iter()
            .map(|a| (a.kind(), a.key().to_string()))
            .collect()
    }

    #[test]
    fn identical_states_produce_empty_plan() {
        let s = state(vec![
            instance("db", &["c"], &[]),
            instance("app", &["c"], &["db"]),
        ]);
        let diff = PolicyResolutionDiff::new(&s, &s);
        assert!(diff.plan.is_empty());
        assert!(diff.summary.is_empty());
    }

    #[test]
    fn creates_follow_dependencies() {
        // "app" sorts before "db", so only the edge puts db first.
        let desired = state(vec![
            instance("db", &["c"], &[]),
            instance("app", &["c"], &["db"]),
        ]);
        let diff = PolicyResolutionDiff::new(&desired, &ResolutionState::new());
        assert_eq!(
            kinds(&diff.plan),
            vec![
                (ActionKind::Create, key("db").to_string()),
                (ActionKind::Create, key("app").to_string()),
            ]
        );
    }

    #[test]
    fn removing_single_claim_deletes_once() {
        let actual = state(vec![instance("app", &["c"], &[])]);
        let diff = PolicyResolutionDiff::new(&ResolutionState::new(), &actual);
        assert_eq!(diff.summary.delete, 1);
        assert_eq!(diff.summary.total(), 1);
    }

    #[test]
    fn shared_instance_detaches_then_deletes() {
        let actual = state(vec![instance("app", &["c1", "c2"], &[])]);

        let only_c2 = state(vec![instance("app", &["c2"], &[])]);
        let first = PolicyResolutionDiff::new(&only_c2, &actual);
        assert_eq!(first.summary.detach, 1);
        assert_eq!(first.summary.delete, 0);

        let after = state(vec![instance("app", &["c2"], &[])]);
        let second = PolicyResolutionDiff::new(&ResolutionState::new(), &after);
        assert_eq!(second.summary.delete, 1);
        assert_eq!(second.summary.total(), 1);
    }

    #[test]
    fn recreate_deletes_before_creating() {
        let actual = state(vec![instance("app", &["c"], &[])]);
        let mut changed = instance("app", &["c"], &[]);
        changed.params = serde_json::json!({"v": 2});
        changed.update = UpdateStrategy::Recreate;
        let desired = state(vec![changed]);

        let diff = PolicyResolutionDiff::new(&desired, &actual);
        assert_eq!(
            kinds(&diff.plan),
            vec![
                (ActionKind::Delete, key("app").to_string()),
                (ActionKind::Create, key("app").to_string()),
            ]
        );
        assert_eq!(diff.plan.prerequisites(1), Some(&BTreeSet::from([0])));
    }

    #[test]
    fn in_place_change_updates() {
        let actual = state(vec![instance("app", &["c"], &[])]);
        let mut changed = instance("app", &["c"], &[]);
        changed.params = serde_json::json!({"v": 2});
        let diff = PolicyResolutionDiff::new(&state(vec![changed]), &actual);
        assert_eq!(diff.summary.update, 1);
        assert_eq!(diff.summary.total(), 1);
    }

    #[test]
    fn consumers_are_deleted_before_dependencies() {
        let actual = state(vec![
            instance("db", &["c"], &[]),
            instance("app", &["c"], &["db"]),
        ]);
        let diff = PolicyResolutionDiff::new(&ResolutionState::new(), &actual);
        assert_eq!(
            kinds(&diff.plan),
            vec![
                (ActionKind::Delete, key("app").to_string()),
                (ActionKind::Delete, key("db").to_string()),
            ]
        );
    }

    #[test]
    fn plan_renders_grouped_text() {
        let actual = state(vec![
            instance("old", &["c"], &[]),
            instance("shared", &["c", "d"], &[]),
        ]);
        let desired = state(vec![
            instance("new", &["c"], &[]),
            instance("shared", &["d"], &[]),
        ]);
        let diff = PolicyResolutionDiff::new(&desired, &actual);
        let expected = "\
[-] Destroy component instances
  - c1#ns1#web#default#old
[+] Deploy component instances
  - c1#ns1#web#default#new
[<] Detach claims
  - ns1/claim/c -> c1#ns1#web#default#shared";
        assert_eq!(diff.plan.to_string(), expected);
        assert_eq!(Plan::default().to_string(), "(none)");
    }

    #[test]
    fn cyclic_actual_state_is_reported_not_hidden() {
        let actual = state(vec![
            instance("a", &["c"], &["b"]),
            instance("b", &["c"], &["a"]),
        ]);
        let diff = PolicyResolutionDiff::new(&ResolutionState::new(), &actual);

        let err = diff.plan.linearize().unwrap_err();
        let PlanError::Cycle { actions } = &err;
        assert_eq!(actions.len(), 2);
        assert!(diff.plan.to_string().ends_with(&format!("[!] {}", err)));
    }
}

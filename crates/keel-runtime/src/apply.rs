//! Plan execution.
//!
//! Actions run as soon as all of their prerequisites succeeded, up to `max_parallel` at a time.
//! A failed action blocks everything that transitively depends on it; independent branches of
//! the plan keep going. Actions that can never become ready because their prerequisites form a
//! cycle fail with [`PlanError::Cycle`]. The actual state is saved after every action that
//! changed it.

use futures::stream::{FuturesUnordered, StreamExt};
use keel_planner::{ActionKind, ComponentInstanceKey, Plan, PlanError};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::action::{ActionContext, Applied, ApplyAction};

/// Final status of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded { changed: bool },
    Failed { error: String },
    /// Not attempted because the prerequisite `blocked_by` failed.
    Skipped { blocked_by: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub action_id: String,
    pub kind: ActionKind,
    pub key: ComponentInstanceKey,
    pub status: ActionStatus,
}

/// Per-action outcome of one plan run, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub results: Vec<ActionResult>,
}

impl ApplyReport {
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Succeeded { .. }))
    }

    /// Successful actions that actually changed something.
    pub fn changed(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Succeeded { changed: true }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Skipped { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, ActionStatus::Failed { .. }))
    }

    pub fn result(&self, action_id: &str) -> Option<&ActionResult> {
        self.results.iter().find(|r| r.action_id == action_id)
    }

    fn count(&self, pred: impl Fn(&ActionStatus) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.status)).count()
    }
}

/// Runs plans against an [`ActionContext`].
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    pub max_parallel: usize,
}

impl Default for PlanExecutor {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

impl PlanExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit concurrently running actions. Zero is treated as one.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub async fn apply(&self, plan: &Plan, ctx: &ActionContext) -> ApplyReport {
        let actions = plan.actions();
        let dependents = plan.dependents();
        let mut remaining: Vec<usize> = (0..actions.len())
            .map(|i| plan.prerequisites(i).map_or(0, BTreeSet::len))
            .collect();
        let mut statuses: Vec<Option<ActionStatus>> = vec![None; actions.len()];
        let mut ready: BTreeSet<usize> = (0..actions.len()).filter(|&i| remaining[i] == 0).collect();
        let mut in_flight = FuturesUnordered::new();

        info!(actions = actions.len(), max_parallel = self.max_parallel, "Applying plan");

        loop {
            while in_flight.len() < self.max_parallel {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let action = &actions[index];
                in_flight.push(async move { (index, action.apply(ctx).await) });
            }

            let Some((index, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(applied) => {
                    let changed = applied == Applied::Changed;
                    if changed {
                        if let Err(err) = ctx.actual.persist().await {
                            warn!(error = %err, "Failed to save actual state");
                            ctx.log.error(format!("saving actual state: {}", err));
                        }
                    }
                    statuses[index] = Some(ActionStatus::Succeeded { changed });
                    for &next in &dependents[index] {
                        remaining[next] = remaining[next].saturating_sub(1);
                        if remaining[next] == 0 && statuses[next].is_none() {
                            ready.insert(next);
                        }
                    }
                }
                Err(err) => {
                    let action_id = actions[index].id();
                    warn!(action = %action_id, error = %err, "Action failed");
                    ctx.log.scoped(action_id.clone()).error(err.to_string());
                    statuses[index] = Some(ActionStatus::Failed {
                        error: err.to_string(),
                    });
                    for blocked in plan.transitive_dependents(index) {
                        if statuses[blocked].is_none() {
                            ready.remove(&blocked);
                            statuses[blocked] = Some(ActionStatus::Skipped {
                                blocked_by: action_id.clone(),
                            });
                        }
                    }
                }
            }
        }

        let stuck: Vec<usize> = (0..actions.len()).filter(|&i| statuses[i].is_none()).collect();
        let cycle = if stuck.is_empty() {
            None
        } else {
            let err: PlanError = plan.cycle_error(stuck);
            warn!(error = %err, "Plan has actions that can never run");
            ctx.log.error(err.to_string());
            Some(err.to_string())
        };

        let results: Vec<ActionResult> = actions
            .iter()
            .zip(statuses)
            .map(|(action, status)| ActionResult {
                action_id: action.id(),
                kind: action.kind(),
                key: action.key().clone(),
                status: status.unwrap_or_else(|| ActionStatus::Failed {
                    error: cycle.clone().unwrap_or_default(),
                }),
            })
            .collect();
        let report = ApplyReport { results };

        info!(
            succeeded = report.succeeded(),
            changed = report.changed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Plan applied"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actual::ActualStateStore;
    use crate::error::PluginError;
    use crate::event::EventLog;
    use crate::plugin::{ClusterDriver, ClusterPlugin, CodePlugin, DriverRegistry, DryRunDriver};
    use async_trait::async_trait;
    use keel_core::{Cluster, Metadata, Policy, PolicyObject, UpdateStrategy};
    use keel_planner::{Action, ComponentInstance};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Fails deploys whose name contains "bad" and tracks peak concurrency.
    #[derive(Default)]
    struct Probe {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CodePlugin for Probe {
        async fn deploy(
            &self,
            deploy_name: &str,
            _params: &serde_json::Value,
            _log: &EventLog,
        ) -> Result<(), PluginError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if deploy_name.contains("bad") {
                Err(PluginError::Failed("image pull failed".to_string()))
            } else {
                Ok(())
            }
        }

        async fn destroy(
            &self,
            _deploy_name: &str,
            _params: &serde_json::Value,
            _log: &EventLog,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct ProbeDriver(Arc<Probe>);

    impl ClusterDriver for ProbeDriver {
        fn cluster_plugin(&self, _cluster: &Cluster) -> Result<Arc<dyn ClusterPlugin>, PluginError> {
            Ok(Arc::new(DryRunDriver))
        }

        fn code_plugin(&self, _cluster: &Cluster, _code_type: &str) -> Option<Arc<dyn CodePlugin>> {
            Some(self.0.clone())
        }
    }

    fn context(probe: Arc<Probe>) -> ActionContext {
        let cluster = PolicyObject::Cluster(Cluster {
            metadata: Metadata::new("system", "c1"),
            cluster_type: "probe".to_string(),
            config: serde_json::Value::Null,
        });
        ActionContext {
            policy: Arc::new(Policy::from_objects(vec![cluster]).unwrap()),
            actual: Arc::new(ActualStateStore::new()),
            plugins: Arc::new(DriverRegistry::new().register("probe", Arc::new(ProbeDriver(probe)))),
            log: EventLog::with_sinks("test", Vec::new()),
            plugin_timeout: Duration::from_secs(5),
        }
    }

    fn create(service: &str) -> Action {
        Action::Create {
            instance: ComponentInstance {
                key: ComponentInstanceKey::new("c1", "ns1", service, "default", "app"),
                namespace: "ns1".to_string(),
                service: service.to_string(),
                component: "app".to_string(),
                context: "default".to_string(),
                cluster: "c1".to_string(),
                code_type: "helm".to_string(),
                params: serde_json::Value::Null,
                update: UpdateStrategy::InPlace,
                deploy_name: format!("ns1-{}-default-app", service),
                claims: BTreeSet::new(),
                dependencies: BTreeSet::new(),
            },
        }
    }

    #[tokio::test]
    async fn failure_blocks_only_its_dependents() {
        let probe = Arc::new(Probe::default());
        let ctx = context(probe);

        // bad -> consumer, independent stands alone
        let mut plan = Plan::new(vec![create("bad"), create("consumer"), create("independent")]);
        plan.add_edge(0, 1);

        let report = PlanExecutor::new().apply(&plan, &ctx).await;

        assert_eq!(report.failed(), 1);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(
            report.results[1].status,
            ActionStatus::Skipped {
                blocked_by: plan.actions()[0].id()
            }
        );
        assert!(!report.is_success());
        assert_eq!(ctx.actual.len(), 1);
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test]
    async fn respects_max_parallel() {
        let probe = Arc::new(Probe::default());
        let ctx = context(probe.clone());
        let plan = Plan::new((0..6).map(|i| create(&format!("svc{}", i))).collect());

        let report = PlanExecutor::new()
            .with_max_parallel(2)
            .apply(&plan, &ctx)
            .await;

        assert!(report.is_success());
        assert_eq!(report.changed(), 6);
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn runs_in_dependency_order() {
        let probe = Arc::new(Probe::default());
        let ctx = context(probe.clone());
        let mut plan = Plan::new(vec![create("consumer"), create("db")]);
        plan.add_edge(1, 0);

        let report = PlanExecutor::new().apply(&plan, &ctx).await;
        assert!(report.is_success());
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cyclic_prerequisites_fail_with_a_named_cause() {
        let probe = Arc::new(Probe::default());
        let ctx = context(probe);

        // a <-> b wait on each other, c waits on b, d is independent
        let mut plan = Plan::new(vec![create("a"), create("b"), create("c"), create("d")]);
        plan.add_edge(0, 1);
        plan.add_edge(1, 0);
        plan.add_edge(1, 2);

        let report = PlanExecutor::new().apply(&plan, &ctx).await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 3);
        let expected = plan.cycle_error([0, 1, 2]).to_string();
        for result in &report.results[..3] {
            assert_eq!(result.status, ActionStatus::Failed { error: expected.clone() });
        }
        assert!(expected.starts_with("ordering cycle between actions: "));
        assert_eq!(ctx.actual.len(), 1);
    }

    #[tokio::test]
    async fn empty_plan_is_a_success() {
        let ctx = context(Arc::new(Probe::default()));
        let report = PlanExecutor::new().apply(&Plan::new(Vec::new()), &ctx).await;
        assert!(report.is_success());
        assert!(report.results.is_empty());
    }
}

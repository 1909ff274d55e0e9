//! The engine: policy mutations, previews and plan application.

use keel_core::{
    Cluster, ExternalData, Generation, GenerationRef, ObjectKey, ObjectKind, PolicyObject, User,
};
use keel_planner::{
    Plan, PlanSummary, PolicyResolutionDiff, PolicyResolver, ResolutionState, ResolveError,
};
use keel_policy::{AclResolver, PolicyView};
use keel_store::{CommitOutcome, PolicySnapshot, PolicyStore, StoreError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::action::ActionContext;
use crate::actual::ActualStateStore;
use crate::apply::{ApplyReport, PlanExecutor};
use crate::error::{EngineError, PluginError};
use crate::event::EventLog;
use crate::plugin::PluginRegistry;

/// Answer to a policy update or delete: the generation it produced, the plan that would bring
/// the actual state in line with it, and the claims that could not be resolved.
#[derive(Debug, Clone)]
pub struct PolicyUpdateResult {
    /// Generation after the mutation. Equals `previous` when nothing changed.
    pub generation: Generation,
    pub previous: Generation,
    pub changed: bool,
    pub changed_objects: Vec<ObjectKey>,
    pub plan: Plan,
    pub summary: PlanSummary,
    /// Claims of the new generation that resolve to nothing, with the reason.
    pub claim_errors: BTreeMap<ObjectKey, ResolveError>,
}

impl PolicyUpdateResult {
    /// Column names, in display order.
    pub const COLUMNS: [&'static str; 3] = ["Policy Changes", "Action Plan", "Claim Errors"];

    /// The result as `(column, value)` pairs, in [`Self::COLUMNS`] order.
    pub fn as_columns(&self) -> Vec<(&'static str, String)> {
        let changes = if self.changed {
            format!("Gen {} -> {}", self.previous, self.generation)
        } else {
            format!("Gen {} (none)", self.generation)
        };
        let errors = if self.claim_errors.is_empty() {
            "(none)".to_string()
        } else {
            self.claim_errors
                .iter()
                .map(|(claim, err)| format!("[!] {}: {}", claim, err))
                .collect::<Vec<_>>()
                .join("\n")
        };
        vec![
            (Self::COLUMNS[0], changes),
            (Self::COLUMNS[1], self.plan.to_string()),
            (Self::COLUMNS[2], errors),
        ]
    }
}

impl fmt::Display for PolicyUpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (column, value)) in self.as_columns().into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}:\n{}", column, value)?;
        }
        Ok(())
    }
}

pub struct Engine {
    store: Arc<PolicyStore>,
    external: ExternalData,
    plugins: Arc<dyn PluginRegistry>,
    actual: Arc<ActualStateStore>,
    plugin_timeout: Duration,
    log: EventLog,
}

impl Engine {
    pub fn new(
        store: Arc<PolicyStore>,
        external: ExternalData,
        plugins: Arc<dyn PluginRegistry>,
    ) -> Self {
        Self {
            store,
            external,
            plugins,
            actual: Arc::new(ActualStateStore::new()),
            plugin_timeout: Duration::from_secs(300),
            log: EventLog::new("engine"),
        }
    }

    /// Use an existing actual state store.
    pub fn with_actual(mut self, actual: Arc<ActualStateStore>) -> Self {
        self.actual = actual;
        self
    }

    pub fn with_plugin_timeout(mut self, timeout: Duration) -> Self {
        self.plugin_timeout = timeout;
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn actual(&self) -> &Arc<ActualStateStore> {
        &self.actual
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Add or replace `objects` on behalf of `user_name`.
    ///
    /// The whole batch is checked against the user's privileges and the resulting policy is
    /// validated before anything is committed. Clusters in the batch are also validated by their
    /// plugin. Any failure leaves the store at its current generation.
    pub async fn update_policy(
        &self,
        user_name: &str,
        objects: Vec<PolicyObject>,
    ) -> Result<PolicyUpdateResult, EngineError> {
        let user = self.user(user_name)?;
        let guard = self.store.begin_mutation().await?;
        let mut policy = guard.working_copy();
        {
            let resolver = AclResolver::new(&guard.base().policy)?;
            let mut view = PolicyView::new(&mut policy, &user, &resolver);
            for obj in &objects {
                view.add_object(obj.clone())?;
            }
        }
        policy.validate()?;

        for obj in &objects {
            if let PolicyObject::Cluster(cluster) = obj {
                self.validate_cluster(cluster).await?;
            }
        }

        let outcome = guard.commit(policy, &user.name).await?;
        self.update_result(outcome)
    }

    /// Remove the objects named by `keys` on behalf of `user_name`.
    ///
    /// Besides the checks done for updates, a cluster that still hosts deployed instances cannot
    /// be removed, because those instances could no longer be destroyed.
    pub async fn delete_policy(
        &self,
        user_name: &str,
        keys: &[ObjectKey],
    ) -> Result<PolicyUpdateResult, EngineError> {
        let user = self.user(user_name)?;
        let guard = self.store.begin_mutation().await?;
        let mut policy = guard.working_copy();
        {
            let resolver = AclResolver::new(&guard.base().policy)?;
            let mut view = PolicyView::new(&mut policy, &user, &resolver);
            for key in keys {
                view.remove_object(key)?;
            }
        }
        policy.validate()?;

        for key in keys.iter().filter(|k| k.kind == ObjectKind::Cluster) {
            if policy.cluster(&key.name).is_some() {
                continue;
            }
            let instances = self.actual.count_on_cluster(&key.name);
            if instances > 0 {
                return Err(EngineError::ClusterInUse {
                    cluster: key.name.clone(),
                    instances,
                });
            }
        }

        let outcome = guard.commit(policy, &user.name).await?;
        self.update_result(outcome)
    }

    /// A stored generation, or `None` when it does not exist.
    pub fn get_policy(
        &self,
        generation: GenerationRef,
    ) -> Result<Option<Arc<PolicySnapshot>>, EngineError> {
        Ok(self.store.get_policy(generation)?)
    }

    /// Look up one object as `user_name` sees it.
    pub fn get_object(
        &self,
        user_name: &str,
        kind: ObjectKind,
        name: &str,
        namespace: &str,
        generation: GenerationRef,
    ) -> Result<Option<PolicyObject>, EngineError> {
        let user = self.user(user_name)?;
        let Some(snapshot) = self.store.get_policy(generation)? else {
            return Ok(None);
        };
        let resolver = AclResolver::new(&snapshot.policy)?;
        let view = PolicyView::new(&snapshot.policy, &user, &resolver);
        Ok(view.get_object(kind, name, namespace)?.cloned())
    }

    /// Desired state of a generation, or `None` when the generation does not exist.
    pub fn resolve(
        &self,
        generation: GenerationRef,
    ) -> Result<Option<(Arc<PolicySnapshot>, ResolutionState)>, EngineError> {
        let Some(snapshot) = self.store.get_policy(generation)? else {
            return Ok(None);
        };
        let desired = PolicyResolver::new(&snapshot.policy, &self.external).resolve_all_dependencies();
        Ok(Some((snapshot, desired)))
    }

    /// Plan from the current actual state to the desired state of the last generation.
    pub fn plan(&self) -> Result<(Arc<PolicySnapshot>, PolicyResolutionDiff), EngineError> {
        let (snapshot, desired) = self.resolve_last()?;
        let diff = PolicyResolutionDiff::new(&desired, &self.actual.snapshot());
        Ok((snapshot, diff))
    }

    /// Resolve the last generation and apply the resulting plan.
    pub async fn apply_last(&self, executor: &PlanExecutor) -> Result<ApplyReport, EngineError> {
        let (snapshot, diff) = self.plan()?;
        let generation = snapshot.generation();
        if diff.plan.is_empty() {
            debug!(generation = %generation, "Actual state is up to date");
            return Ok(ApplyReport::default());
        }

        info!(generation = %generation, summary = %diff.summary, "Enforcing policy");
        let ctx = ActionContext {
            policy: Arc::new(snapshot.policy.clone()),
            actual: self.actual.clone(),
            plugins: self.plugins.clone(),
            log: self.log.scoped(format!("apply@{}", generation)),
            plugin_timeout: self.plugin_timeout,
        };
        Ok(executor.apply(&diff.plan, &ctx).await)
    }

    fn resolve_last(&self) -> Result<(Arc<PolicySnapshot>, ResolutionState), EngineError> {
        let last = self.store.last_generation()?;
        self.resolve(GenerationRef::Exact(last))?.ok_or_else(|| {
            StoreError::Internal(format!("generation {} is missing from the store", last)).into()
        })
    }

    fn user(&self, name: &str) -> Result<User, EngineError> {
        self.external
            .users
            .get_user(name)
            .ok_or_else(|| EngineError::UnknownUser(name.to_string()))
    }

    async fn validate_cluster(&self, cluster: &Cluster) -> Result<(), EngineError> {
        let name = cluster.metadata.name.clone();
        let plugin = self
            .plugins
            .for_cluster(cluster)
            .map_err(|source| EngineError::ClusterValidation {
                cluster: name.clone(),
                source,
            })?;
        let result = match tokio::time::timeout(self.plugin_timeout, plugin.validate()).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::Failed(format!(
                "validation timed out after {:?}",
                self.plugin_timeout
            ))),
        };
        result.map_err(|source| {
            warn!(cluster = %name, error = %source, "Cluster validation failed");
            EngineError::ClusterValidation {
                cluster: name,
                source,
            }
        })
    }

    fn update_result(&self, outcome: CommitOutcome) -> Result<PolicyUpdateResult, EngineError> {
        let desired = PolicyResolver::new(&outcome.snapshot.policy, &self.external)
            .resolve_all_dependencies();
        let diff = PolicyResolutionDiff::new(&desired, &self.actual.snapshot());
        if !desired.claim_errors().is_empty() {
            warn!(
                generation = %outcome.snapshot.generation(),
                failed_claims = desired.claim_errors().len(),
                "Committed policy has unresolved claims"
            );
        }
        Ok(PolicyUpdateResult {
            generation: outcome.snapshot.generation(),
            previous: outcome.previous,
            changed: outcome.changed,
            changed_objects: if outcome.changed {
                outcome.snapshot.data.changed.clone()
            } else {
                Vec::new()
            },
            plan: diff.plan,
            summary: diff.summary,
            claim_errors: desired.claim_errors().clone(),
        })
    }
}

//! Applying single plan actions.
//!
//! Every action is idempotent against the actual state: applying something that is already in
//! effect is a no-op, so a retried plan converges. Actual state is written only after the plugin
//! call succeeded.

use async_trait::async_trait;
use keel_core::{Cluster, Policy};
use keel_planner::{Action, ComponentInstance, Detached};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::actual::ActualStateStore;
use crate::error::{ApplyError, PluginError};
use crate::event::EventLog;
use crate::plugin::{CodePlugin, PluginRegistry};

/// Everything an action needs while it is applied.
#[derive(Clone)]
pub struct ActionContext {
    /// Policy generation the plan was computed from. Clusters are looked up here.
    pub policy: Arc<Policy>,
    pub actual: Arc<ActualStateStore>,
    pub plugins: Arc<dyn PluginRegistry>,
    pub log: EventLog,
    /// Upper bound for a single plugin call.
    pub plugin_timeout: Duration,
}

/// What applying an action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    NoOp,
}

#[async_trait]
pub trait ApplyAction {
    async fn apply(&self, ctx: &ActionContext) -> Result<Applied, ApplyError>;
}

#[async_trait]
impl ApplyAction for Action {
    async fn apply(&self, ctx: &ActionContext) -> Result<Applied, ApplyError> {
        let log = ctx.log.scoped(self.id());
        match self {
            Action::Create { instance } => {
                if let Some(existing) = ctx.actual.get(&instance.key) {
                    if existing.same_configuration(instance) {
                        log.debug("already deployed");
                        return Ok(Applied::NoOp);
                    }
                }
                deploy(ctx, instance, &log).await?;
                ctx.actual.upsert(instance.clone());
                Ok(Applied::Changed)
            }
            Action::Update { instance, .. } => {
                let existing = ctx.actual.get(&instance.key);
                if let Some(existing) = &existing {
                    if existing.same_configuration(instance) && existing.update == instance.update
                    {
                        log.debug("already up to date");
                        return Ok(Applied::NoOp);
                    }
                }
                deploy(ctx, instance, &log).await?;
                let mut updated = instance.clone();
                // Claim bookkeeping is owned by attach/detach actions.
                if let Some(existing) = existing {
                    updated.claims = existing.claims;
                }
                ctx.actual.upsert(updated);
                Ok(Applied::Changed)
            }
            Action::Delete { instance } => {
                if !ctx.actual.contains(&instance.key) {
                    log.debug("already removed");
                    return Ok(Applied::NoOp);
                }
                let plugin = code_plugin(ctx, instance)?;
                with_timeout(
                    ctx,
                    instance,
                    plugin.destroy(&instance.deploy_name, &instance.params, &log),
                )
                .await?;
                ctx.actual.remove(&instance.key);
                log.info(format!("destroyed '{}'", instance.deploy_name));
                Ok(Applied::Changed)
            }
            Action::AttachClaim { key, claim } => {
                if !ctx.actual.contains(key) {
                    return Err(ApplyError::NotDeployed { key: key.clone() });
                }
                if ctx.actual.attach_claim(key, claim) {
                    debug!(instance = %key, claim = %claim, "Claim attached");
                    Ok(Applied::Changed)
                } else {
                    Ok(Applied::NoOp)
                }
            }
            Action::DetachClaim { key, claim } => match ctx.actual.detach_claim(key, claim) {
                Detached::NotAttached => Ok(Applied::NoOp),
                Detached::StillReferenced(remaining) => {
                    debug!(instance = %key, claim = %claim, remaining, "Claim detached");
                    Ok(Applied::Changed)
                }
                Detached::LastReference => {
                    log.info(format!("last claim detached from '{}'", key));
                    Ok(Applied::Changed)
                }
            },
        }
    }
}

fn cluster<'a>(ctx: &'a ActionContext, instance: &ComponentInstance) -> Result<&'a Cluster, ApplyError> {
    ctx.policy
        .cluster(&instance.cluster)
        .ok_or_else(|| ApplyError::UnknownCluster {
            key: instance.key.clone(),
            cluster: instance.cluster.clone(),
        })
}

fn code_plugin(
    ctx: &ActionContext,
    instance: &ComponentInstance,
) -> Result<Arc<dyn CodePlugin>, ApplyError> {
    let cluster = cluster(ctx, instance)?;
    ctx.plugins
        .for_code_type(cluster, &instance.code_type)
        .map_err(|source| ApplyError::Plugin {
            key: instance.key.clone(),
            source,
        })
}

async fn deploy(
    ctx: &ActionContext,
    instance: &ComponentInstance,
    log: &EventLog,
) -> Result<(), ApplyError> {
    let plugin = code_plugin(ctx, instance)?;
    with_timeout(
        ctx,
        instance,
        plugin.deploy(&instance.deploy_name, &instance.params, log),
    )
    .await?;
    log.info(format!("deployed '{}'", instance.deploy_name));
    Ok(())
}

async fn with_timeout(
    ctx: &ActionContext,
    instance: &ComponentInstance,
    call: impl Future<Output = Result<(), PluginError>>,
) -> Result<(), ApplyError> {
    match tokio::time::timeout(ctx.plugin_timeout, call).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ApplyError::Plugin {
            key: instance.key.clone(),
            source,
        }),
        Err(_) => Err(ApplyError::Timeout {
            key: instance.key.clone(),
            after: ctx.plugin_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ClusterDriver, ClusterPlugin, DriverRegistry, DryRunDriver};
    use keel_core::{Metadata, ObjectKey, ObjectKind, PolicyObject, UpdateStrategy};
    use keel_planner::ComponentInstanceKey;
    use std::collections::BTreeSet;

    struct FailingDriver;

    #[async_trait]
    impl CodePlugin for FailingDriver {
        async fn deploy(
            &self,
            _deploy_name: &str,
            _params: &serde_json::Value,
            _log: &EventLog,
        ) -> Result<(), PluginError> {
            Err(PluginError::Failed("quota exceeded".to_string()))
        }

        async fn destroy(
            &self,
            _deploy_name: &str,
            _params: &serde_json::Value,
            _log: &EventLog,
        ) -> Result<(), PluginError> {
            Err(PluginError::Failed("busy".to_string()))
        }
    }

    impl ClusterDriver for FailingDriver {
        fn cluster_plugin(&self, _cluster: &Cluster) -> Result<Arc<dyn ClusterPlugin>, PluginError> {
            Ok(Arc::new(DryRunDriver))
        }

        fn code_plugin(&self, _cluster: &Cluster, _code_type: &str) -> Option<Arc<dyn CodePlugin>> {
            Some(Arc::new(FailingDriver))
        }
    }

    fn policy() -> Arc<Policy> {
        let cluster = PolicyObject::Cluster(Cluster {
            metadata: Metadata::new("system", "c1"),
            cluster_type: "dry".to_string(),
            config: serde_json::Value::Null,
        });
        Arc::new(Policy::from_objects(vec![cluster]).unwrap())
    }

    fn context(driver: Arc<dyn ClusterDriver>) -> ActionContext {
        ActionContext {
            policy: policy(),
            actual: Arc::new(ActualStateStore::new()),
            plugins: Arc::new(DriverRegistry::new().register("dry", driver)),
            log: EventLog::with_sinks("test", Vec::new()),
            plugin_timeout: Duration::from_secs(5),
        }
    }

    fn instance(cluster: &str, param: &str) -> ComponentInstance {
        ComponentInstance {
            key: ComponentInstanceKey::new(cluster, "ns1", "web", "default", "app"),
            namespace: "ns1".to_string(),
            service: "web".to_string(),
            component: "app".to_string(),
            context: "default".to_string(),
            cluster: cluster.to_string(),
            code_type: "helm".to_string(),
            params: serde_json::json!({ "image": param }),
            update: UpdateStrategy::default(),
            deploy_name: "ns1-web-default-app".to_string(),
            claims: BTreeSet::from([ObjectKey::new("ns1", ObjectKind::Claim, "a")]),
            dependencies: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let ctx = context(Arc::new(DryRunDriver));
        let action = Action::Create {
            instance: instance("c1", "v1"),
        };

        assert_eq!(action.apply(&ctx).await.unwrap(), Applied::Changed);
        assert_eq!(action.apply(&ctx).await.unwrap(), Applied::NoOp);
        assert_eq!(ctx.actual.len(), 1);
    }

    #[tokio::test]
    async fn update_keeps_recorded_claims() {
        let ctx = context(Arc::new(DryRunDriver));
        let mut deployed = instance("c1", "v1");
        deployed
            .claims
            .insert(ObjectKey::new("ns1", ObjectKind::Claim, "b"));
        ctx.actual.upsert(deployed.clone());

        let action = Action::Update {
            previous: deployed.clone(),
            instance: instance("c1", "v2"),
        };
        assert_eq!(action.apply(&ctx).await.unwrap(), Applied::Changed);

        let stored = ctx.actual.get(&deployed.key).unwrap();
        assert_eq!(stored.params, serde_json::json!({ "image": "v2" }));
        assert_eq!(stored.claims.len(), 2);
    }

    #[tokio::test]
    async fn failed_plugin_leaves_actual_state_alone() {
        let ctx = context(Arc::new(FailingDriver));
        let deployed = instance("c1", "v1");
        ctx.actual.upsert(deployed.clone());

        let err = Action::Delete {
            instance: deployed.clone(),
        }
        .apply(&ctx)
        .await
        .unwrap_err();
        assert!(matches!(err, ApplyError::Plugin { .. }));
        assert!(ctx.actual.contains(&deployed.key));

        let err = Action::Create {
            instance: instance("c1", "v2"),
        }
        .apply(&ctx)
        .await
        .unwrap_err();
        assert_eq!(err.key(), &deployed.key);
        assert_eq!(
            ctx.actual.get(&deployed.key).unwrap().params,
            serde_json::json!({ "image": "v1" })
        );
    }

    #[tokio::test]
    async fn unknown_cluster_is_reported() {
        let ctx = context(Arc::new(DryRunDriver));
        let err = Action::Create {
            instance: instance("gone", "v1"),
        }
        .apply(&ctx)
        .await
        .unwrap_err();
        assert!(matches!(err, ApplyError::UnknownCluster { ref cluster, .. } if cluster == "gone"));
    }

    #[tokio::test]
    async fn claim_bookkeeping() {
        let ctx = context(Arc::new(DryRunDriver));
        let deployed = instance("c1", "v1");
        let key = deployed.key.clone();
        let b = ObjectKey::new("ns1", ObjectKind::Claim, "b");

        let attach = Action::AttachClaim {
            key: key.clone(),
            claim: b.clone(),
        };
        assert!(matches!(
            attach.apply(&ctx).await,
            Err(ApplyError::NotDeployed { .. })
        ));

        ctx.actual.upsert(deployed);
        assert_eq!(attach.apply(&ctx).await.unwrap(), Applied::Changed);
        assert_eq!(attach.apply(&ctx).await.unwrap(), Applied::NoOp);

        let detach = Action::DetachClaim { key, claim: b };
        assert_eq!(detach.apply(&ctx).await.unwrap(), Applied::Changed);
        assert_eq!(detach.apply(&ctx).await.unwrap(), Applied::NoOp);
    }
}

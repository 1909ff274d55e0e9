//! Plugin contracts.
//!
//! Plugins are resolved in two levels: the cluster's type selects a [`ClusterDriver`], and the
//! driver hands out a [`CodePlugin`] per code type. The engine only ever talks to the
//! [`PluginRegistry`] trait, so any backend can be plugged in.

use async_trait::async_trait;
use keel_core::Cluster;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::PluginError;
use crate::event::{EventLevel, EventLog};

/// Cluster-level capability.
#[async_trait]
pub trait ClusterPlugin: Send + Sync {
    /// Check that the cluster definition is usable. Called before a policy containing the
    /// cluster is committed.
    async fn validate(&self) -> Result<(), PluginError>;
}

/// Executor for one code type on one cluster.
#[async_trait]
pub trait CodePlugin: Send + Sync {
    /// Deploy or update `deploy_name` with `params`.
    async fn deploy(
        &self,
        deploy_name: &str,
        params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<(), PluginError>;

    /// Remove `deploy_name`. Removing something already gone must succeed.
    async fn destroy(
        &self,
        deploy_name: &str,
        params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<(), PluginError>;
}

/// Lookup of plugins for clusters and code types.
pub trait PluginRegistry: Send + Sync {
    fn for_cluster(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterPlugin>, PluginError>;

    fn for_code_type(
        &self,
        cluster: &Cluster,
        code_type: &str,
    ) -> Result<Arc<dyn CodePlugin>, PluginError>;
}

/// Per cluster type backend.
pub trait ClusterDriver: Send + Sync {
    fn cluster_plugin(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterPlugin>, PluginError>;

    /// Executor for `code_type`, or `None` when the driver does not support it.
    fn code_plugin(&self, cluster: &Cluster, code_type: &str) -> Option<Arc<dyn CodePlugin>>;
}

/// [`PluginRegistry`] dispatching on cluster type.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn ClusterDriver>>,
    fallback: Option<Arc<dyn ClusterDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the driver for a cluster type, replacing any previous one.
    pub fn register(mut self, cluster_type: impl Into<String>, driver: Arc<dyn ClusterDriver>) -> Self {
        self.drivers.insert(cluster_type.into(), driver);
        self
    }

    /// Driver used for cluster types without a registered driver.
    pub fn with_fallback(mut self, driver: Arc<dyn ClusterDriver>) -> Self {
        self.fallback = Some(driver);
        self
    }

    fn driver(&self, cluster: &Cluster) -> Result<&Arc<dyn ClusterDriver>, PluginError> {
        self.drivers
            .get(&cluster.cluster_type)
            .or(self.fallback.as_ref())
            .ok_or_else(|| PluginError::UnknownClusterType(cluster.cluster_type.clone()))
    }
}

impl PluginRegistry for DriverRegistry {
    fn for_cluster(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterPlugin>, PluginError> {
        self.driver(cluster)?.cluster_plugin(cluster)
    }

    fn for_code_type(
        &self,
        cluster: &Cluster,
        code_type: &str,
    ) -> Result<Arc<dyn CodePlugin>, PluginError> {
        self.driver(cluster)?
            .code_plugin(cluster, code_type)
            .ok_or_else(|| PluginError::UnsupportedCodeType {
                cluster_type: cluster.cluster_type.clone(),
                code_type: code_type.to_string(),
            })
    }
}

/// Driver that accepts every cluster and code type and only records what it would do.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunDriver;

#[async_trait]
impl ClusterPlugin for DryRunDriver {
    async fn validate(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl CodePlugin for DryRunDriver {
    async fn deploy(
        &self,
        deploy_name: &str,
        params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<(), PluginError> {
        log.log(
            EventLevel::Info,
            format!("would deploy '{}'", deploy_name),
            params.clone(),
        );
        Ok(())
    }

    async fn destroy(
        &self,
        deploy_name: &str,
        _params: &serde_json::Value,
        log: &EventLog,
    ) -> Result<(), PluginError> {
        log.info(format!("would destroy '{}'", deploy_name));
        Ok(())
    }
}

impl ClusterDriver for DryRunDriver {
    fn cluster_plugin(&self, _cluster: &Cluster) -> Result<Arc<dyn ClusterPlugin>, PluginError> {
        Ok(Arc::new(DryRunDriver))
    }

    fn code_plugin(&self, _cluster: &Cluster, _code_type: &str) -> Option<Arc<dyn CodePlugin>> {
        Some(Arc::new(DryRunDriver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Metadata;

    fn cluster(cluster_type: &str) -> Cluster {
        Cluster {
            metadata: Metadata::new("system", "c1"),
            cluster_type: cluster_type.to_string(),
            config: serde_json::Value::Null,
        }
    }

    struct HelmOnly;

    impl ClusterDriver for HelmOnly {
        fn cluster_plugin(&self, _cluster: &Cluster) -> Result<Arc<dyn ClusterPlugin>, PluginError> {
            Ok(Arc::new(DryRunDriver))
        }

        fn code_plugin(&self, _cluster: &Cluster, code_type: &str) -> Option<Arc<dyn CodePlugin>> {
            (code_type == "helm").then(|| Arc::new(DryRunDriver) as Arc<dyn CodePlugin>)
        }
    }

    #[test]
    fn dispatches_on_cluster_type() {
        let registry = DriverRegistry::new().register("k8s", Arc::new(HelmOnly));

        assert!(registry.for_cluster(&cluster("k8s")).is_ok());
        assert!(registry.for_code_type(&cluster("k8s"), "helm").is_ok());
        assert_eq!(
            registry.for_code_type(&cluster("k8s"), "raw").err(),
            Some(PluginError::UnsupportedCodeType {
                cluster_type: "k8s".to_string(),
                code_type: "raw".to_string(),
            })
        );
        assert_eq!(
            registry.for_cluster(&cluster("nomad")).err(),
            Some(PluginError::UnknownClusterType("nomad".to_string()))
        );
    }

    #[test]
    fn fallback_catches_unknown_types() {
        let registry = DriverRegistry::new().with_fallback(Arc::new(DryRunDriver));
        assert!(registry.for_code_type(&cluster("anything"), "any").is_ok());
    }
}

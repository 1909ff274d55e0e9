//! Actual state: what is currently deployed.
//!
//! Only successfully applied actions write here. Locks are held for map operations only, never
//! across plugin calls. When backed by a [`GenerationBackend`], the state is reloaded on start
//! and saved after every action that changed it.

use chrono::Utc;
use keel_core::ObjectKey;
use keel_planner::{ComponentInstance, ComponentInstanceKey, Detached, ResolutionState};
use keel_store::{ActualStateDocument, GenerationBackend, StoreError};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

#[derive(Default)]
pub struct ActualStateStore {
    state: RwLock<ResolutionState>,
    backend: Option<Arc<dyn GenerationBackend>>,
}

impl fmt::Debug for ActualStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActualStateStore")
            .field("instances", &self.len())
            .field("persistent", &self.backend.is_some())
            .finish()
    }
}

impl ActualStateStore {
    /// An empty, memory-only store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the state last saved to `backend` and keep saving to it.
    pub async fn load(backend: Arc<dyn GenerationBackend>) -> Result<Self, StoreError> {
        let mut state = ResolutionState::new();
        if let Some(doc) = backend.load_actual().await? {
            for instance in doc.instances {
                state.upsert(instance);
            }
        }
        info!(instances = state.len(), "Loaded actual state");
        Ok(Self {
            state: RwLock::new(state),
            backend: Some(backend),
        })
    }

    /// Save the current state to the backend. A no-op for memory-only stores.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let doc = ActualStateDocument {
            updated_at: Utc::now(),
            instances: self.read().instances().cloned().collect(),
        };
        backend.save_actual(&doc).await
    }

    /// A consistent copy of the whole state, for diffing.
    pub fn snapshot(&self) -> ResolutionState {
        self.read().clone()
    }

    pub fn get(&self, key: &ComponentInstanceKey) -> Option<ComponentInstance> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ComponentInstanceKey) -> bool {
        self.read().contains(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of instances deployed on `cluster`.
    pub fn count_on_cluster(&self, cluster: &str) -> usize {
        self.read().instances_on_cluster(cluster).count()
    }

    pub fn upsert(&self, instance: ComponentInstance) -> Option<ComponentInstance> {
        self.write().upsert(instance)
    }

    pub fn remove(&self, key: &ComponentInstanceKey) -> Option<ComponentInstance> {
        self.write().remove(key)
    }

    pub fn attach_claim(&self, key: &ComponentInstanceKey, claim: &ObjectKey) -> bool {
        self.write().attach_claim(key, claim)
    }

    pub fn detach_claim(&self, key: &ComponentInstanceKey, claim: &ObjectKey) -> Detached {
        self.write().detach_claim(key, claim)
    }

    fn read(&self) -> RwLockReadGuard<'_, ResolutionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ResolutionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

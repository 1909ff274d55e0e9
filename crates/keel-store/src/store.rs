//! The policy generation store.

use chrono::{DateTime, Utc};
use keel_core::{Generation, GenerationRef, ObjectKey, Policy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::backend::{GenerationBackend, MemoryBackend};
use crate::codec::GenerationDocument;
use crate::error::StoreError;
use crate::notify::PolicyChangeNotifier;

/// User that owns the initial, empty generation.
pub const SYSTEM_USER: &str = "system";

/// Metadata recorded with every generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyData {
    pub generation: Generation,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    /// Keys of the objects added, replaced or removed by this generation.
    #[serde(default)]
    pub changed: Vec<ObjectKey>,
}

/// An immutable committed generation.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub data: PolicyData,
    pub policy: Policy,
}

impl PolicySnapshot {
    pub fn generation(&self) -> Generation {
        self.data.generation
    }

    fn from_document(doc: GenerationDocument) -> Result<Self, StoreError> {
        Ok(Self {
            policy: Policy::from_objects(doc.objects)?,
            data: doc.data,
        })
    }

    fn to_document(&self) -> GenerationDocument {
        GenerationDocument {
            data: self.data.clone(),
            objects: self.policy.objects().cloned().collect(),
        }
    }
}

/// Result of committing a working copy.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// False when the working copy equalled the base generation and nothing was stored.
    pub changed: bool,
    /// Generation the mutation started from.
    pub previous: Generation,
    /// The resulting last generation (the base one when nothing changed).
    pub snapshot: Arc<PolicySnapshot>,
}

/// Numbered, immutable policy generations with a single-writer mutation lock.
pub struct PolicyStore {
    backend: Arc<dyn GenerationBackend>,
    generations: RwLock<BTreeMap<Generation, Arc<PolicySnapshot>>>,
    mutation: Mutex<()>,
    notifier: PolicyChangeNotifier,
}

impl PolicyStore {
    /// Open a store over `backend`, loading every persisted generation. An empty backend starts
    /// at generation 0 with an empty policy.
    pub async fn open(backend: Arc<dyn GenerationBackend>) -> Result<Self, StoreError> {
        let mut generations = BTreeMap::new();
        for doc in backend.load_all().await? {
            let snapshot = PolicySnapshot::from_document(doc)?;
            let generation = snapshot.generation();
            if generations.insert(generation, Arc::new(snapshot)).is_some() {
                return Err(StoreError::DuplicateGeneration(generation));
            }
        }

        if generations.is_empty() {
            let initial = PolicySnapshot {
                data: PolicyData {
                    generation: Generation::INITIAL,
                    updated_by: SYSTEM_USER.to_string(),
                    updated_at: Utc::now(),
                    changed: Vec::new(),
                },
                policy: Policy::new(),
            };
            backend.save(&initial.to_document()).await?;
            generations.insert(Generation::INITIAL, Arc::new(initial));
        }

        info!(
            generations = generations.len(),
            last = %generations.keys().next_back().copied().unwrap_or_default(),
            "Opened policy store"
        );

        Ok(Self {
            backend,
            generations: RwLock::new(generations),
            mutation: Mutex::new(()),
            notifier: PolicyChangeNotifier::new(),
        })
    }

    /// Open a store that keeps generations in memory only.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open(Arc::new(MemoryBackend)).await
    }

    /// Notifier signalled after every commit that creates a generation.
    pub fn notifier(&self) -> PolicyChangeNotifier {
        self.notifier.clone()
    }

    pub fn last_generation(&self) -> Result<Generation, StoreError> {
        let generations = self.read()?;
        generations
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| StoreError::Internal("store has no generations".to_string()))
    }

    /// All stored generation numbers, ascending.
    pub fn generations(&self) -> Result<Vec<Generation>, StoreError> {
        Ok(self.read()?.keys().copied().collect())
    }

    /// Look up a generation. A generation that does not exist is `Ok(None)`.
    pub fn get_policy(
        &self,
        generation: GenerationRef,
    ) -> Result<Option<Arc<PolicySnapshot>>, StoreError> {
        let generations = self.read()?;
        Ok(match generation {
            GenerationRef::Last => generations.values().next_back().cloned(),
            GenerationRef::Exact(g) => generations.get(&g).cloned(),
        })
    }

    /// Take the mutation lock. Concurrent mutations queue here; the guard's base is the last
    /// generation at the moment the lock was acquired.
    pub async fn begin_mutation(&self) -> Result<MutationGuard<'_>, StoreError> {
        let lock = self.mutation.lock().await;
        let base = self
            .get_policy(GenerationRef::Last)?
            .ok_or_else(|| StoreError::Internal("store has no generations".to_string()))?;
        debug!(base = %base.generation(), "Mutation started");
        Ok(MutationGuard {
            store: self,
            _lock: lock,
            base,
        })
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<Generation, Arc<PolicySnapshot>>>, StoreError>
    {
        self.generations
            .read()
            .map_err(|e| StoreError::Internal(format!("failed to acquire read lock: {}", e)))
    }
}

/// Exclusive right to create the next generation.
pub struct MutationGuard<'a> {
    store: &'a PolicyStore,
    _lock: MutexGuard<'a, ()>,
    base: Arc<PolicySnapshot>,
}

impl<'a> MutationGuard<'a> {
    /// The generation this mutation starts from.
    pub fn base(&self) -> &Arc<PolicySnapshot> {
        &self.base
    }

    /// A mutable copy of the base policy.
    pub fn working_copy(&self) -> Policy {
        self.base.policy.clone()
    }

    /// Store `policy` as the next generation, unless it equals the base.
    ///
    /// The generation is persisted before it becomes visible, so a backend failure leaves the
    /// store unchanged.
    pub async fn commit(self, policy: Policy, user: &str) -> Result<CommitOutcome, StoreError> {
        let previous = self.base.generation();
        let changed = changed_keys(&self.base.policy, &policy);

        if changed.is_empty() {
            debug!(generation = %previous, "Mutation is a no-op");
            return Ok(CommitOutcome {
                changed: false,
                previous,
                snapshot: self.base,
            });
        }

        let snapshot = PolicySnapshot {
            data: PolicyData {
                generation: previous.next(),
                updated_by: user.to_string(),
                updated_at: Utc::now(),
                changed,
            },
            policy,
        };
        self.store.backend.save(&snapshot.to_document()).await?;

        let snapshot = Arc::new(snapshot);
        {
            let mut generations = self.store.generations.write().map_err(|e| {
                StoreError::Internal(format!("failed to acquire write lock: {}", e))
            })?;
            generations.insert(snapshot.generation(), snapshot.clone());
        }

        info!(
            generation = %snapshot.generation(),
            user = user,
            changed = snapshot.data.changed.len(),
            "Committed policy generation"
        );
        self.store.notifier.notify();

        Ok(CommitOutcome {
            changed: true,
            previous,
            snapshot,
        })
    }
}

/// Keys whose object was added, removed or replaced by something different.
fn changed_keys(before: &Policy, after: &Policy) -> Vec<ObjectKey> {
    let keys: BTreeSet<&ObjectKey> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|key| before.get(key) != after.get(key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use crate::codec::MsgPackCodec;
    use keel_core::{Metadata, ObjectKind, PolicyObject, Service};

    fn service(name: &str) -> PolicyObject {
        PolicyObject::Service(Service {
            metadata: Metadata::new("ns1", name),
            labels: Default::default(),
            context_keys: Vec::new(),
            components: Vec::new(),
        })
    }

    #[tokio::test]
    async fn starts_at_generation_zero() {
        let store = PolicyStore::in_memory().await.unwrap();
        assert_eq!(store.last_generation().unwrap(), Generation(0));
        let last = store.get_policy(GenerationRef::Last).unwrap().unwrap();
        assert!(last.policy.is_empty());
    }

    #[tokio::test]
    async fn commit_advances_generation_and_records_changes() {
        let store = PolicyStore::in_memory().await.unwrap();
        let guard = store.begin_mutation().await.unwrap();
        let mut policy = guard.working_copy();
        policy.add_object(service("web")).unwrap();
        let outcome = guard.commit(policy, "alice").await.unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.previous, Generation(0));
        assert_eq!(outcome.snapshot.generation(), Generation(1));
        assert_eq!(outcome.snapshot.data.updated_by, "alice");
        assert_eq!(
            outcome.snapshot.data.changed,
            vec![ObjectKey::new("ns1", ObjectKind::Service, "web")]
        );
        // Old generations stay readable and unchanged.
        let first = store
            .get_policy(GenerationRef::Exact(Generation(0)))
            .unwrap()
            .unwrap();
        assert!(first.policy.is_empty());
    }

    #[tokio::test]
    async fn no_op_commit_keeps_generation() {
        let store = PolicyStore::in_memory().await.unwrap();
        let guard = store.begin_mutation().await.unwrap();
        let policy = guard.working_copy();
        let outcome = guard.commit(policy, "alice").await.unwrap();

        assert!(!outcome.changed);
        assert_eq!(store.last_generation().unwrap(), Generation(0));
    }

    #[tokio::test]
    async fn missing_generation_is_none() {
        let store = PolicyStore::in_memory().await.unwrap();
        assert!(
            store
                .get_policy(GenerationRef::Exact(Generation(42)))
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn concurrent_mutations_serialize() {
        let store = Arc::new(PolicyStore::in_memory().await.unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let guard = store.begin_mutation().await.unwrap();
                let mut policy = guard.working_copy();
                policy.add_object(service(&format!("svc-{i}"))).unwrap();
                guard.commit(policy, "writer").await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.last_generation().unwrap(), Generation(8));
        let generations: Vec<u64> = store
            .generations()
            .unwrap()
            .into_iter()
            .map(Generation::value)
            .collect();
        assert_eq!(generations, (0..=8).collect::<Vec<_>>());
        let last = store.get_policy(GenerationRef::Last).unwrap().unwrap();
        assert_eq!(last.policy.len(), 8);
    }

    #[tokio::test]
    async fn file_store_reloads_generations() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = Arc::new(FileBackend::new(dir.path(), Box::new(MsgPackCodec)).unwrap());
            let store = PolicyStore::open(backend).await.unwrap();
            let guard = store.begin_mutation().await.unwrap();
            let mut policy = guard.working_copy();
            policy.add_object(service("web")).unwrap();
            guard.commit(policy, "alice").await.unwrap();
        }

        let backend = Arc::new(FileBackend::new(dir.path(), Box::new(MsgPackCodec)).unwrap());
        let store = PolicyStore::open(backend).await.unwrap();
        assert_eq!(store.last_generation().unwrap(), Generation(1));
        let last = store.get_policy(GenerationRef::Last).unwrap().unwrap();
        assert!(last.policy.service("ns1", "web").is_some());
        assert_eq!(last.data.updated_by, "alice");
    }

    #[tokio::test]
    async fn commit_wakes_the_notifier() {
        let store = PolicyStore::in_memory().await.unwrap();
        let notifier = store.notifier();
        let guard = store.begin_mutation().await.unwrap();
        let mut policy = guard.working_copy();
        policy.add_object(service("web")).unwrap();
        guard.commit(policy, "alice").await.unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(100), notifier.notified())
            .await
            .unwrap();
    }
}

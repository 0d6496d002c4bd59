//! Keel store contract: the calls the converge engine makes against the resource store,
//! the parent lifecycle query, and an in-RAM store used by tests and dry runs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::marker::PhantomData;

use keel_core::{ObjectKey, Parent};
use kube::Resource;
use tracing::debug;

mod mem;

pub use mem::{Call, MemStore};

/// Store failures. `NotFound` is expected and branch-selecting; the rest are fatal for the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Equality label selector (`k1=v1,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    labels: BTreeMap<String, String>,
}

impl LabelFilter {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool { self.labels.is_empty() }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.labels.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }

    /// Render as a kube label selector string.
    pub fn to_selector(&self) -> String {
        self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

impl From<BTreeMap<String, String>> for LabelFilter {
    fn from(labels: BTreeMap<String, String>) -> Self { Self { labels } }
}

/// Get/create/update/delete/list against the resource store for one kind.
///
/// Every call is attempted once; retry policy belongs to whoever re-invokes the engine.
#[async_trait::async_trait]
pub trait StoreClient<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K>;
    async fn create(&self, obj: &K) -> StoreResult<K>;
    async fn update(&self, obj: &K) -> StoreResult<K>;
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;
    async fn list(&self, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<K>>;
}

/// Answers whether a parent is being deleted, so its children should be removed rather than converged.
#[async_trait::async_trait]
pub trait ParentLifecycle: Send + Sync {
    async fn is_terminating(&self, parent: &Parent) -> StoreResult<bool>;
}

/// Lifecycle for callers that never tear children down through the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTerminating;

#[async_trait::async_trait]
impl ParentLifecycle for NeverTerminating {
    async fn is_terminating(&self, _parent: &Parent) -> StoreResult<bool> { Ok(false) }
}

/// Which object stands in for the parent when checking for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleScope {
    /// The instance object itself (`parent.name` in `parent.namespace`).
    Instance,
    /// The namespace the instance lives in.
    Namespace,
}

/// Lifecycle backed by any store: the parent is terminating once its object carries a
/// deletion timestamp or no longer exists.
pub struct ObjectLifecycle<S, P> {
    store: S,
    scope: LifecycleScope,
    _kind: PhantomData<fn() -> P>,
}

impl<S, P> ObjectLifecycle<S, P> {
    pub fn instance(store: S) -> Self { Self { store, scope: LifecycleScope::Instance, _kind: PhantomData } }

    pub fn namespace(store: S) -> Self { Self { store, scope: LifecycleScope::Namespace, _kind: PhantomData } }

    pub fn scope(&self) -> LifecycleScope { self.scope }

    fn target(&self, parent: &Parent) -> Option<ObjectKey> {
        match self.scope {
            LifecycleScope::Instance => Some(parent.key()),
            LifecycleScope::Namespace => parent.namespace.as_ref().map(ObjectKey::cluster),
        }
    }
}

#[async_trait::async_trait]
impl<S, P> ParentLifecycle for ObjectLifecycle<S, P>
where
    S: StoreClient<P>,
    P: Resource + Send + Sync + 'static,
{
    async fn is_terminating(&self, parent: &Parent) -> StoreResult<bool> {
        let Some(key) = self.target(parent) else {
            // cluster-scoped parent has no namespace to watch
            return Ok(false);
        };
        match self.store.get(&key).await {
            Ok(obj) => Ok(obj.meta().deletion_timestamp.is_some()),
            Err(StoreError::NotFound(_)) => {
                debug!(target = %key, "parent object gone; treating as terminating");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

//! In-RAM store keyed by `ObjectKey`.
//!
//! Mimics the API server closely enough for the engine: uid and resourceVersion assignment,
//! optimistic concurrency on update, NotFound on absent keys. Every call is recorded and any
//! operation can be told to fail once, which is what the engine tests lean on.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use keel_core::{ObjectKey, Operation};
use kube::Resource;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{LabelFilter, StoreClient, StoreError, StoreResult};

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,
    pub key: ObjectKey,
}

struct Inner<K> {
    objects: FxHashMap<ObjectKey, K>,
    next_rv: u64,
    calls: Vec<Call>,
    faults: FxHashMap<Operation, VecDeque<StoreError>>,
}

impl<K> Inner<K> {
    fn record(&mut self, op: Operation, key: &ObjectKey) -> StoreResult<()> {
        self.calls.push(Call { op, key: key.clone() });
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn bump_rv(&mut self) -> String {
        self.next_rv = self.next_rv.saturating_add(1);
        self.next_rv.to_string()
    }
}

/// Cheaply cloneable handle; clones share the same objects.
pub struct MemStore<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for MemStore<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> Default for MemStore<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: FxHashMap::default(),
                next_rv: 0,
                calls: Vec::new(),
                faults: FxHashMap::default(),
            })),
        }
    }
}

impl<K> MemStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self { Self::default() }

    /// Seed an object as if created by the server, without recording a call.
    pub async fn seed(&self, mut obj: K) -> StoreResult<K> {
        let key = key_of(&obj)?;
        let mut inner = self.inner.lock().await;
        stamp_new(&mut obj, inner.bump_rv());
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Current stored copy, bypassing call recording and faults.
    pub async fn peek(&self, key: &ObjectKey) -> Option<K> {
        self.inner.lock().await.objects.get(key).cloned()
    }

    pub async fn len(&self) -> usize { self.inner.lock().await.objects.len() }

    pub async fn is_empty(&self) -> bool { self.len().await == 0 }

    pub async fn calls(&self) -> Vec<Call> { self.inner.lock().await.calls.clone() }

    pub async fn count(&self, op: Operation) -> usize {
        self.inner.lock().await.calls.iter().filter(|c| c.op == op).count()
    }

    pub async fn clear_calls(&self) { self.inner.lock().await.calls.clear(); }

    /// Make the next call of `op` fail with `err`. Queued faults fire in order.
    pub async fn fail_next(&self, op: Operation, err: StoreError) {
        self.inner.lock().await.faults.entry(op).or_default().push_back(err);
    }

    /// Set a deletion timestamp on the stored object, as the server does while finalizers run.
    pub async fn mark_terminating(&self, key: &ObjectKey) -> bool {
        let mut inner = self.inner.lock().await;
        let rv = inner.bump_rv();
        match inner.objects.get_mut(key) {
            Some(obj) => {
                let meta = obj.meta_mut();
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Rejected("metadata.name is required".into()))
}

fn stamp_new<K: Resource>(obj: &mut K, rv: String) {
    let meta = obj.meta_mut();
    meta.uid = Some(Uuid::new_v4().to_string());
    meta.resource_version = Some(rv);
    meta.creation_timestamp = Some(Time(Utc::now()));
    meta.deletion_timestamp = None;
}

#[async_trait::async_trait]
impl<K> StoreClient<K> for MemStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        let mut inner = self.inner.lock().await;
        inner.record(Operation::Get, key)?;
        inner.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = key_of(obj)?;
        let mut inner = self.inner.lock().await;
        inner.record(Operation::Create, &key)?;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Rejected(format!("{} already exists", key)));
        }
        let mut stored = obj.clone();
        stamp_new(&mut stored, inner.bump_rv());
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = key_of(obj)?;
        let mut inner = self.inner.lock().await;
        inner.record(Operation::Update, &key)?;
        let (uid, created, live_rv) = match inner.objects.get(&key) {
            Some(live) => {
                let meta = live.meta();
                (meta.uid.clone(), meta.creation_timestamp.clone(), meta.resource_version.clone())
            }
            None => return Err(StoreError::NotFound(key)),
        };
        let sent_rv = obj.meta().resource_version.clone();
        if sent_rv.is_some() && sent_rv != live_rv {
            return Err(StoreError::Rejected(format!(
                "conflict on {}: resourceVersion {} is stale (live {})",
                key,
                sent_rv.unwrap_or_default(),
                live_rv.unwrap_or_default()
            )));
        }
        let mut stored = obj.clone();
        let rv = inner.bump_rv();
        let meta = stored.meta_mut();
        meta.uid = uid;
        meta.creation_timestamp = created;
        meta.resource_version = Some(rv);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Operation::Delete, key)?;
        match inner.objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    async fn list(&self, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<K>> {
        let scope = ObjectKey::new("*", namespace);
        let mut inner = self.inner.lock().await;
        inner.record(Operation::List, &scope)?;
        let mut out: Vec<(ObjectKey, K)> = inner
            .objects
            .iter()
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| filter.matches(o.meta().labels.as_ref()))
            .map(|(k, o)| (k.clone(), o.clone()))
            .collect();
        // FxHashMap iteration order is arbitrary
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, o)| o).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cm(name: &str, ns: &str, labels: &[(&str, &str)]) -> ConfigMap {
        let labels: BTreeMap<String, String> = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                labels: if labels.is_empty() { None } else { Some(labels) },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemStore::<ConfigMap>::new();
        let created = store.create(&cm("a", "ns", &[])).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        let err = store.create(&cm("a", "ns", &[])).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn update_enforces_resource_version() {
        let store = MemStore::<ConfigMap>::new();
        let created = store.create(&cm("a", "ns", &[])).await.unwrap();
        let mut fresh = created.clone();
        fresh.data = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        let updated = store.update(&fresh).await.unwrap();
        assert_eq!(updated.metadata.uid, created.metadata.uid);
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);

        // the original copy is now stale
        let err = store.update(&created).await.unwrap_err();
        assert!(err.to_string().contains("conflict"), "err={}", err);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let store = MemStore::<ConfigMap>::new();
        let key = ObjectKey::namespaced("nope", "ns");
        assert!(store.get(&key).await.unwrap_err().is_not_found());
        assert!(store.delete(&key).await.unwrap_err().is_not_found());
        assert!(store.update(&cm("nope", "ns", &[])).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = MemStore::<ConfigMap>::new();
        store.create(&cm("b", "ns1", &[("app", "x")])).await.unwrap();
        store.create(&cm("a", "ns1", &[("app", "x")])).await.unwrap();
        store.create(&cm("c", "ns1", &[("app", "y")])).await.unwrap();
        store.create(&cm("d", "ns2", &[("app", "x")])).await.unwrap();

        let filter = LabelFilter::new().with("app", "x");
        let names: Vec<String> = store
            .list(Some("ns1"), &filter)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|o| o.metadata.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.list(None, &filter).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn faults_fire_once_and_calls_are_recorded() {
        let store = MemStore::<ConfigMap>::new();
        store.fail_next(Operation::Create, StoreError::Unavailable("boom".into())).await;
        assert!(store.create(&cm("a", "ns", &[])).await.is_err());
        assert!(store.create(&cm("a", "ns", &[])).await.is_ok());
        assert_eq!(store.count(Operation::Create).await, 2);
        store.clear_calls().await;
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn mark_terminating_sets_deletion_timestamp() {
        let store = MemStore::<ConfigMap>::new();
        store.seed(cm("a", "ns", &[])).await.unwrap();
        let key = ObjectKey::namespaced("a", "ns");
        assert!(store.mark_terminating(&key).await);
        assert!(store.peek(&key).await.unwrap().metadata.deletion_timestamp.is_some());
        assert!(!store.mark_terminating(&ObjectKey::namespaced("b", "ns")).await);
        assert_eq!(store.count(Operation::Get).await, 0);
    }
}

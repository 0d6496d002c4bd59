//! Keel kubehub: kube client bootstrap and the kube-backed [`StoreClient`] implementations.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::Instant;

use anyhow::{Context, Result};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use keel_core::ObjectKey;
use keel_store::{LabelFilter, StoreClient, StoreError, StoreResult};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use metrics::histogram;
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

pub mod features;

static CLIENT: Lazy<OnceCell<Client>> = Lazy::new(OnceCell::new);

/// Shared client built from the default kubeconfig / in-cluster environment on first use.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await?;
    Ok(client.clone())
}

/// Translate a kube error into the store vocabulary: 404 is `NotFound`, 5xx and transport
/// failures are `Unavailable`, every other API status is `Rejected`.
pub fn map_kube_error(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(resp) if resp.code >= 500 => {
            StoreError::Unavailable(format!("{} {}: {}", resp.code, resp.reason, resp.message))
        }
        kube::Error::Api(resp) => StoreError::Rejected(format!("{} {}: {}", resp.code, resp.reason, resp.message)),
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn list_params(filter: &LabelFilter) -> ListParams {
    let lp = ListParams::default();
    if filter.is_empty() {
        lp
    } else {
        lp.labels(&filter.to_selector())
    }
}

fn name_of<K: Resource>(obj: &K) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Rejected("metadata.name is required".into()))
}

fn observe(op: &'static str, kind: &str, t0: Instant) {
    histogram!("store_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op, "kind" => kind.to_string());
}

async fn get_in<K>(api: Api<K>, key: &ObjectKey) -> StoreResult<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let t0 = Instant::now();
    let res = api.get(&key.name).await.map_err(|e| map_kube_error(key, e));
    observe("get", &K::kind(&()), t0);
    res
}

async fn create_in<K>(api: Api<K>, key: &ObjectKey, obj: &K) -> StoreResult<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let t0 = Instant::now();
    let res = api.create(&PostParams::default(), obj).await.map_err(|e| map_kube_error(key, e));
    observe("create", &K::kind(&()), t0);
    res
}

async fn replace_in<K>(api: Api<K>, key: &ObjectKey, obj: &K) -> StoreResult<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let t0 = Instant::now();
    let res = api.replace(&key.name, &PostParams::default(), obj).await.map_err(|e| map_kube_error(key, e));
    observe("update", &K::kind(&()), t0);
    res
}

async fn delete_in<K>(api: Api<K>, key: &ObjectKey) -> StoreResult<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let t0 = Instant::now();
    let res = api
        .delete(&key.name, &DeleteParams::background())
        .await
        .map(|_| ())
        .map_err(|e| map_kube_error(key, e));
    observe("delete", &K::kind(&()), t0);
    res
}

async fn list_in<K>(api: Api<K>, scope: &ObjectKey, filter: &LabelFilter) -> StoreResult<Vec<K>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let t0 = Instant::now();
    let res = api.list(&list_params(filter)).await.map(|l| l.items).map_err(|e| map_kube_error(scope, e));
    observe("list", &K::kind(&()), t0);
    if let Ok(items) = &res {
        debug!(kind = %K::kind(&()), scope = %scope, selector = %filter.to_selector(), count = items.len(), "listed");
    }
    res
}

/// Store for namespaced kinds (ConfigMap, Service, StatefulSet, RoleBinding, ...).
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self { Self { client: self.client.clone(), _kind: PhantomData } }
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    fn api(&self, key: &ObjectKey) -> StoreResult<Api<K>> {
        match key.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced(self.client.clone(), ns)),
            None => Err(StoreError::Rejected(format!("{} {} needs a namespace", K::kind(&()), key.name))),
        }
    }
}

#[async_trait::async_trait]
impl<K> StoreClient<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> { get_in(self.api(key)?, key).await }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = name_of(obj)?;
        create_in(self.api(&key)?, &key, obj).await
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = name_of(obj)?;
        replace_in(self.api(&key)?, &key, obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> { delete_in(self.api(key)?, key).await }

    async fn list(&self, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<K>> {
        let scope = ObjectKey::new("*", namespace);
        let api = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        list_in(api, &scope, filter).await
    }
}

/// Store for cluster-scoped kinds (Namespace, ClusterRole, ...). Keys carry no namespace.
pub struct ClusterStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for ClusterStore<K> {
    fn clone(&self) -> Self { Self { client: self.client.clone(), _kind: PhantomData } }
}

impl<K> ClusterStore<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

#[async_trait::async_trait]
impl<K> StoreClient<K> for ClusterStore<K>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> { get_in(Api::<K>::all(self.client.clone()), key).await }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = name_of(obj)?;
        create_in(Api::<K>::all(self.client.clone()), &key, obj).await
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = name_of(obj)?;
        replace_in(Api::<K>::all(self.client.clone()), &key, obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> { delete_in(Api::<K>::all(self.client.clone()), key).await }

    async fn list(&self, _namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<K>> {
        list_in(Api::<K>::all(self.client.clone()), &ObjectKey::cluster("*"), filter).await
    }
}

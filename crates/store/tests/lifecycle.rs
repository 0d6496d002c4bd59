#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use keel_core::{ObjectKey, Operation, Parent};
use keel_store::{LifecycleScope, MemStore, NeverTerminating, ObjectLifecycle, ParentLifecycle, StoreError};
use kube::api::ObjectMeta;

fn namespace(name: &str) -> Namespace {
    Namespace { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
}

fn instance(name: &str, ns: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
        ..Default::default()
    }
}

#[tokio::test]
async fn namespace_scope_follows_namespace_deletion() {
    let namespaces = MemStore::<Namespace>::new();
    namespaces.seed(namespace("argocd")).await.unwrap();
    let lifecycle = ObjectLifecycle::<_, Namespace>::namespace(namespaces.clone());
    assert_eq!(lifecycle.scope(), LifecycleScope::Namespace);

    let parent = Parent::named("cd1", Some("argocd"));
    assert!(!lifecycle.is_terminating(&parent).await.unwrap());

    namespaces.mark_terminating(&ObjectKey::cluster("argocd")).await;
    assert!(lifecycle.is_terminating(&parent).await.unwrap());
}

#[tokio::test]
async fn instance_scope_treats_missing_parent_as_terminating() {
    let instances = MemStore::<ConfigMap>::new();
    instances.seed(instance("cd1", "argocd")).await.unwrap();
    let lifecycle = ObjectLifecycle::<_, ConfigMap>::instance(instances.clone());

    assert!(!lifecycle.is_terminating(&Parent::named("cd1", Some("argocd"))).await.unwrap());
    assert!(lifecycle.is_terminating(&Parent::named("gone", Some("argocd"))).await.unwrap());
}

#[tokio::test]
async fn lookup_failures_propagate() {
    let namespaces = MemStore::<Namespace>::new();
    namespaces.fail_next(Operation::Get, StoreError::Unavailable("apiserver down".into())).await;
    let lifecycle = ObjectLifecycle::<_, Namespace>::namespace(namespaces);
    let err = lifecycle.is_terminating(&Parent::named("cd1", Some("argocd"))).await.unwrap_err();
    assert_eq!(err, StoreError::Unavailable("apiserver down".into()));
}

#[tokio::test]
async fn cluster_scoped_parent_and_noop_lifecycle() {
    let lifecycle = ObjectLifecycle::<_, Namespace>::namespace(MemStore::<Namespace>::new());
    assert!(!lifecycle.is_terminating(&Parent::named("global", None)).await.unwrap());
    assert!(!NeverTerminating.is_terminating(&Parent::named("x", Some("y"))).await.unwrap());
}

use std::collections::BTreeMap;

use anyhow::anyhow;
use k8s_openapi::api::core::v1::ConfigMap;
use keel_converge::prelude::*;
use keel_converge::{field, is_owned_by, ConvergeOptions, MutationPolicy};
use keel_core::labels::K8S_COMPONENT;
use keel_store::{MemStore, NeverTerminating, ObjectLifecycle, StoreClient, StoreError};

fn data(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
}

fn template(pairs: &[(&str, &str)]) -> ConfigMap { ConfigMap { data: data(pairs), ..Default::default() } }

fn policy() -> DriftPolicy<ConfigMap> {
    DriftPolicy::new(
        ComparatorTable::new()
            .with(FieldToCompare::labels())
            .with(FieldToCompare::annotations())
            .with(field!(ConfigMap, data)),
    )
    .with_immutable(|existing: &ConfigMap, desired: &ConfigMap| {
        existing.immutable == Some(true) && existing.data != desired.data
    })
}

async fn seeded_parent(parents: &MemStore<ConfigMap>) -> Parent {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some("cd1".into());
    cm.metadata.namespace = Some("argocd".into());
    let stored = parents.seed(cm).await.unwrap();
    Parent::from_resource(&stored)
}

fn redis(parent: &Parent) -> ResourceRequest<ConfigMap> {
    ResourceRequest::new(parent.clone(), "redis", template(&[("maxmemory", "64mb")]), ())
}

#[tokio::test]
async fn create_noop_repair_then_delete_with_parent() {
    let parents = MemStore::<ConfigMap>::new();
    let children = MemStore::<ConfigMap>::new();
    let parent = seeded_parent(&parents).await;
    let engine = Converger::new(children.clone(), ObjectLifecycle::<_, ConfigMap>::instance(parents.clone()));
    let key = ObjectKey::namespaced("cd1-redis", "argocd");

    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Created);
    let live = children.peek(&key).await.unwrap();
    assert!(is_owned_by(&live, &parent));

    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::NoOp);
    assert_eq!(children.count(Operation::Update).await, 0);

    // someone edits the component label behind our back
    let mut tampered = live.clone();
    tampered.metadata.labels.get_or_insert_with(BTreeMap::new).insert(K8S_COMPONENT.into(), "tampered".into());
    children.update(&tampered).await.unwrap();

    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Updated);
    let live = children.peek(&key).await.unwrap();
    assert_eq!(live.metadata.labels.unwrap().get(K8S_COMPONENT).map(String::as_str), Some("redis"));

    assert!(parents.mark_terminating(&parent.key()).await);
    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Deleted);
    assert!(children.is_empty().await);

    // still terminating: delete is attempted again and NotFound counts as done
    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Deleted);
    assert_eq!(children.count(Operation::Delete).await, 2);
    assert_eq!(children.count(Operation::Create).await, 1);
}

#[tokio::test]
async fn immutable_drift_deletes_without_update() {
    let children = MemStore::<ConfigMap>::new();
    let parent = Parent::named("cd1", Some("argocd"));
    let mut existing = template(&[("maxmemory", "32mb")]);
    existing.immutable = Some(true);
    existing.metadata.name = Some("cd1-redis".into());
    existing.metadata.namespace = Some("argocd".into());
    children.seed(existing).await.unwrap();

    let engine = Converger::new(children.clone(), NeverTerminating);
    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Deleted);
    assert_eq!(children.count(Operation::Update).await, 0);
    assert_eq!(children.count(Operation::Delete).await, 1);
    assert_eq!(children.count(Operation::Create).await, 0);

    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Created);
}

fn hooked(parent: &Parent) -> ResourceRequest<ConfigMap> {
    redis(parent)
        .with_mutation(Mutation::new("first", |_: &(), cm: &mut ConfigMap| {
            cm.data.get_or_insert_with(BTreeMap::new).insert("first".into(), "1".into());
            Ok(())
        }))
        .with_mutation(Mutation::new("second", |_: &(), _: &mut ConfigMap| Err(anyhow!("no route api"))))
        .with_mutation(Mutation::new("third", |_: &(), cm: &mut ConfigMap| {
            cm.data.get_or_insert_with(BTreeMap::new).insert("third".into(), "3".into());
            Ok(())
        }))
}

#[tokio::test]
async fn mutation_failures_are_fatal_by_default() {
    let children = MemStore::<ConfigMap>::new();
    let engine = Converger::new(children.clone(), NeverTerminating);
    let err = engine.converge(hooked(&Parent::named("cd1", Some("argocd"))), &policy()).await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Mutation);
    assert!(err.to_string().contains("#2 second: no route api"), "err={}", err);
    assert!(children.calls().await.is_empty());
}

#[tokio::test]
async fn tolerated_mutation_failures_converge_partial_object() {
    let children = MemStore::<ConfigMap>::new();
    let engine = Converger::new(children.clone(), NeverTerminating).with_options(ConvergeOptions {
        mutation_policy: MutationPolicy::Tolerate,
        ..Default::default()
    });
    let outcome = engine.converge(hooked(&Parent::named("cd1", Some("argocd"))), &policy()).await.unwrap();
    assert_eq!(outcome, Outcome::Created);
    let live = children.peek(&ObjectKey::namespaced("cd1-redis", "argocd")).await.unwrap();
    let d = live.data.unwrap();
    assert_eq!(d.get("first").map(String::as_str), Some("1"));
    assert_eq!(d.get("third").map(String::as_str), Some("3"));
}

#[tokio::test]
async fn store_failures_carry_the_operation() {
    let parents = MemStore::<ConfigMap>::new();
    let children = MemStore::<ConfigMap>::new();
    let parent = seeded_parent(&parents).await;
    let engine = Converger::new(children.clone(), ObjectLifecycle::<_, ConfigMap>::instance(parents.clone()));

    parents.fail_next(Operation::Get, StoreError::Unavailable("etcd".into())).await;
    let err = engine.converge(redis(&parent), &policy()).await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Store(Operation::Lifecycle));

    children.fail_next(Operation::Get, StoreError::Unavailable("etcd".into())).await;
    let err = engine.converge(redis(&parent), &policy()).await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Store(Operation::Get));

    children.fail_next(Operation::Create, StoreError::Rejected("quota".into())).await;
    let err = engine.converge(redis(&parent), &policy()).await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Store(Operation::Create));
    assert_eq!(err.key(), &ObjectKey::namespaced("cd1-redis", "argocd"));

    // one attempt per call, no retries
    assert_eq!(children.count(Operation::Create).await, 1);
    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Created);
}

#[tokio::test]
async fn identity_only_parent_still_creates() {
    let children = MemStore::<ConfigMap>::new();
    let engine = Converger::new(children.clone(), NeverTerminating);
    let parent = Parent::named("cd1", Some("argocd"));
    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Created);
    let live = children.peek(&ObjectKey::namespaced("cd1-redis", "argocd")).await.unwrap();
    assert!(live.metadata.owner_references.is_none());
}

#[tokio::test]
async fn missing_owner_link_is_drift_only_when_repair_is_on() {
    let parents = MemStore::<ConfigMap>::new();
    let children = MemStore::<ConfigMap>::new();
    let parent = seeded_parent(&parents).await;
    let plain = Converger::new(children.clone(), NeverTerminating);
    assert_eq!(plain.converge(redis(&Parent::named("cd1", Some("argocd"))), &policy()).await.unwrap(), Outcome::Created);

    assert_eq!(plain.converge(redis(&parent), &policy()).await.unwrap(), Outcome::NoOp);

    let repairing = Converger::new(children.clone(), NeverTerminating)
        .with_options(ConvergeOptions { repair_owner_refs: true, ..Default::default() });
    assert_eq!(repairing.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Updated);
    let live = children.peek(&ObjectKey::namespaced("cd1-redis", "argocd")).await.unwrap();
    assert!(is_owned_by(&live, &parent));
    assert_eq!(repairing.converge(redis(&parent), &policy()).await.unwrap(), Outcome::NoOp);
}

#[tokio::test]
async fn explicit_delete_treats_absent_as_done() {
    let children = MemStore::<ConfigMap>::new();
    let engine = Converger::new(children.clone(), NeverTerminating);
    let key = ObjectKey::namespaced("cd1-redis", "argocd");
    assert_eq!(engine.delete::<ConfigMap>(&key).await.unwrap(), Outcome::Deleted);

    children.fail_next(Operation::Delete, StoreError::Unavailable("down".into())).await;
    let err = engine.delete::<ConfigMap>(&key).await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Store(Operation::Delete));
}

#[tokio::test]
async fn failed_update_is_reported_once_and_left_for_the_next_pass() {
    let children = MemStore::<ConfigMap>::new();
    let engine = Converger::new(children.clone(), NeverTerminating);
    let parent = Parent::named("cd1", Some("argocd"));
    let key = ObjectKey::namespaced("cd1-redis", "argocd");
    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Created);

    let mut tampered = children.peek(&key).await.unwrap();
    tampered.metadata.labels.get_or_insert_with(BTreeMap::new).insert(K8S_COMPONENT.into(), "tampered".into());
    children.update(&tampered).await.unwrap();
    children.clear_calls().await;

    children.fail_next(Operation::Update, StoreError::Rejected("admission webhook denied".into())).await;
    let err = engine.converge(redis(&parent), &policy()).await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Store(Operation::Update));
    assert_eq!(err.key(), &key);
    assert_eq!(children.count(Operation::Update).await, 1);
    let live = children.peek(&key).await.unwrap();
    assert_eq!(live.metadata.labels.unwrap().get(K8S_COMPONENT).map(String::as_str), Some("tampered"));

    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Updated);
}

#[tokio::test]
async fn failed_delete_under_terminating_parent_keeps_the_child() {
    let parents = MemStore::<ConfigMap>::new();
    let children = MemStore::<ConfigMap>::new();
    let parent = seeded_parent(&parents).await;
    let engine = Converger::new(children.clone(), ObjectLifecycle::<_, ConfigMap>::instance(parents.clone()));
    let key = ObjectKey::namespaced("cd1-redis", "argocd");
    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Created);

    assert!(parents.mark_terminating(&parent.key()).await);
    children.fail_next(Operation::Delete, StoreError::Unavailable("apiserver timeout".into())).await;
    let err = engine.converge(redis(&parent), &policy()).await.unwrap_err();
    assert_eq!(err.reason(), FailureReason::Store(Operation::Delete));
    assert_eq!(children.count(Operation::Delete).await, 1);
    assert_eq!(children.count(Operation::Get).await, 1);
    assert!(children.peek(&key).await.is_some());

    assert_eq!(engine.converge(redis(&parent), &policy()).await.unwrap(), Outcome::Deleted);
    assert!(children.is_empty().await);
}

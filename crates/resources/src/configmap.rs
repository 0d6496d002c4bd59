//! ConfigMap reconciler: labels, annotations and data are kept in sync; an immutable config map
//! whose payload drifted is deleted so the next converge recreates it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use keel_converge::{ComparatorTable, DriftPolicy, FieldToCompare, ResourceRequest};
use keel_core::Parent;
use keel_store::{LabelFilter, StoreClient, StoreResult};

pub fn request<C>(parent: Parent, component: &str, data: BTreeMap<String, String>, context: C) -> ResourceRequest<ConfigMap, C> {
    let data = (!data.is_empty()).then_some(data);
    let template = ConfigMap { data, ..Default::default() };
    ResourceRequest::new(parent, component, template, context)
}

/// Same as [`request`] but the config map is created immutable.
pub fn immutable_request<C>(
    parent: Parent,
    component: &str,
    data: BTreeMap<String, String>,
    context: C,
) -> ResourceRequest<ConfigMap, C> {
    let mut req = request(parent, component, data, context);
    req.template.immutable = Some(true);
    req
}

/// The API server drops empty maps, so a missing payload and an empty one are the same.
fn same_payload<V: PartialEq>(a: &Option<BTreeMap<String, V>>, b: &Option<BTreeMap<String, V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
        (None, None) => true,
    }
}

pub fn comparator() -> ComparatorTable<ConfigMap> {
    ComparatorTable::new()
        .with(FieldToCompare::labels())
        .with(FieldToCompare::annotations())
        .with(FieldToCompare::with_eq(
            "data",
            |c: &ConfigMap| c.data.clone(),
            |c: &mut ConfigMap, v| c.data = v,
            same_payload::<String>,
        ))
        .with(FieldToCompare::with_eq(
            "binary_data",
            |c: &ConfigMap| c.binary_data.clone(),
            |c: &mut ConfigMap, v| c.binary_data = v,
            same_payload::<ByteString>,
        ))
        .with(FieldToCompare::with_eq(
            "immutable",
            |c: &ConfigMap| c.immutable,
            |c: &mut ConfigMap, v| c.immutable = v,
            |a: &Option<bool>, b: &Option<bool>| a.unwrap_or(false) == b.unwrap_or(false),
        ))
}

/// The API server refuses payload changes on an immutable config map and refuses to make it
/// mutable again. Turning a mutable map immutable is a plain update.
pub fn is_immutable_drift(existing: &ConfigMap, desired: &ConfigMap) -> bool {
    if existing.immutable != Some(true) {
        return false;
    }
    desired.immutable != Some(true)
        || !same_payload(&existing.data, &desired.data)
        || !same_payload(&existing.binary_data, &desired.binary_data)
}

pub fn drift_policy() -> DriftPolicy<ConfigMap> { DriftPolicy::new(comparator()).with_immutable(is_immutable_drift) }

pub async fn list<S>(store: &S, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<ConfigMap>>
where
    S: StoreClient<ConfigMap>,
{
    store.list(namespace, filter).await
}

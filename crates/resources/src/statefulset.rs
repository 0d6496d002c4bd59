//! StatefulSet reconciler.

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use keel_converge::{ComparatorTable, DriftPolicy, FieldToCompare, ResourceRequest};
use keel_core::Parent;
use keel_store::{LabelFilter, StoreClient, StoreResult};

const DEFAULT_POD_MANAGEMENT: &str = "OrderedReady";

pub fn request<C>(parent: Parent, component: &str, spec: StatefulSetSpec, context: C) -> ResourceRequest<StatefulSet, C> {
    let template = StatefulSet { spec: Some(spec), ..Default::default() };
    ResourceRequest::new(parent, component, template, context)
}

fn spec_mut(sts: &mut StatefulSet) -> &mut StatefulSetSpec { sts.spec.get_or_insert_with(StatefulSetSpec::default) }

/// The pod template is compared whole. Fields the API server defaults inside it
/// (`terminationMessagePath`, `dnsPolicy`, `schedulerName` and so on) must be set on the desired template,
/// otherwise every pass against a live cluster reports drift and rewrites the set.
pub fn comparator() -> ComparatorTable<StatefulSet> {
    ComparatorTable::new()
        .with(FieldToCompare::labels())
        .with(FieldToCompare::annotations())
        .with(FieldToCompare::new(
            "spec.replicas",
            |s: &StatefulSet| s.spec.as_ref().and_then(|sp| sp.replicas),
            |s: &mut StatefulSet, v| spec_mut(s).replicas = v,
        ))
        .with(FieldToCompare::new(
            "spec.template",
            |s: &StatefulSet| s.spec.as_ref().map(|sp| sp.template.clone()).unwrap_or_default(),
            |s: &mut StatefulSet, v| spec_mut(s).template = v,
        ))
}

/// Selector, service name and pod management policy are fixed once the set exists.
pub fn is_immutable_drift(existing: &StatefulSet, desired: &StatefulSet) -> bool {
    let (Some(have), Some(want)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return false;
    };
    let policy = |s: &StatefulSetSpec| s.pod_management_policy.clone().unwrap_or_else(|| DEFAULT_POD_MANAGEMENT.to_string());
    have.selector != want.selector || have.service_name != want.service_name || policy(have) != policy(want)
}

pub fn drift_policy() -> DriftPolicy<StatefulSet> { DriftPolicy::new(comparator()).with_immutable(is_immutable_drift) }

pub async fn list<S>(store: &S, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<StatefulSet>>
where
    S: StoreClient<StatefulSet>,
{
    store.list(namespace, filter).await
}

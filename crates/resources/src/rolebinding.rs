//! RoleBinding reconciler. The role reference cannot be changed in place, so a binding pointing
//! at another role is deleted and recreated on the next pass.

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use keel_converge::{field, ComparatorTable, DriftPolicy, FieldToCompare, ResourceRequest};
use keel_core::Parent;
use keel_store::{LabelFilter, StoreClient, StoreResult};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

pub fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef { api_group: RBAC_GROUP.into(), kind: kind.into(), name: name.into() }
}

pub fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".into(),
        name: name.into(),
        namespace: Some(namespace.into()),
        ..Default::default()
    }
}

pub fn request<C>(parent: Parent, component: &str, role_ref: RoleRef, subjects: Vec<Subject>, context: C) -> ResourceRequest<RoleBinding, C> {
    let template = RoleBinding { role_ref, subjects: Some(subjects), ..Default::default() };
    ResourceRequest::new(parent, component, template, context)
}

pub fn comparator() -> ComparatorTable<RoleBinding> {
    ComparatorTable::new()
        .with(FieldToCompare::labels())
        .with(FieldToCompare::annotations())
        .with(field!(RoleBinding, subjects))
}

pub fn is_immutable_drift(existing: &RoleBinding, desired: &RoleBinding) -> bool { existing.role_ref != desired.role_ref }

pub fn drift_policy() -> DriftPolicy<RoleBinding> { DriftPolicy::new(comparator()).with_immutable(is_immutable_drift) }

pub async fn list<S>(store: &S, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<RoleBinding>>
where
    S: StoreClient<RoleBinding>,
{
    store.list(namespace, filter).await
}

//! Keel resources: the converge engine instantiated for concrete kinds. Each module supplies a
//! request constructor, the kind's drift policy and list helpers.

#![forbid(unsafe_code)]

use keel_core::labels::{K8S_COMPONENT, K8S_MANAGED_BY, K8S_NAME, KEEL};
use keel_core::Parent;
use keel_store::{LabelFilter, StoreClient, StoreResult};

pub mod configmap;
pub mod rolebinding;
pub mod route;
pub mod service;
pub mod statefulset;

/// Selector matching the children of one instance, optionally narrowed to a component.
pub fn instance_filter(parent: &Parent, component: &str) -> LabelFilter {
    let filter = LabelFilter::new().with(K8S_NAME, parent.name.as_str()).with(K8S_MANAGED_BY, KEEL);
    if component.is_empty() {
        filter
    } else {
        filter.with(K8S_COMPONENT, component)
    }
}

/// Children of `parent` (in the parent's namespace) carrying the instance labels.
pub async fn list_for_instance<K, S>(store: &S, parent: &Parent, component: &str) -> StoreResult<Vec<K>>
where
    K: Send + Sync + 'static,
    S: StoreClient<K>,
{
    store.list(parent.namespace.as_deref(), &instance_filter(parent, component)).await
}

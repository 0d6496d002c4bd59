//! Label and annotation scheme stamped on every child resource.

use std::collections::BTreeMap;

/// Standard label for the name of the owning instance
pub const K8S_NAME: &str = "app.kubernetes.io/name";

/// Standard label for the higher-level application this resource is part of
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

/// Standard label for the tool managing the resource
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the component within the instance (e.g. "redis", "repo-server")
pub const K8S_COMPONENT: &str = "app.kubernetes.io/component";

/// Value for `part-of` and `managed-by`
pub const KEEL: &str = "keel";

/// Annotation recording the owning instance name
pub const INSTANCE_NAME_ANNOTATION: &str = "keel.dev/instance-name";

/// Annotation recording the owning instance namespace
pub const INSTANCE_NAMESPACE_ANNOTATION: &str = "keel.dev/instance-namespace";

/// Deterministic child name for an instance component: `"{instance}-{component}"`.
pub fn generate_resource_name(instance: &str, component: &str) -> String {
    if component.is_empty() {
        instance.to_string()
    } else {
        format!("{}-{}", instance, component)
    }
}

pub fn labels_for_instance(instance: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(K8S_NAME.to_string(), instance.to_string());
    labels.insert(K8S_PART_OF.to_string(), KEEL.to_string());
    labels.insert(K8S_MANAGED_BY.to_string(), KEEL.to_string());
    if !component.is_empty() {
        labels.insert(K8S_COMPONENT.to_string(), component.to_string());
    }
    labels
}

pub fn annotations_for_instance(instance: &str, namespace: Option<&str>) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(INSTANCE_NAME_ANNOTATION.to_string(), instance.to_string());
    if let Some(ns) = namespace {
        annotations.insert(INSTANCE_NAMESPACE_ANNOTATION.to_string(), ns.to_string());
    }
    annotations
}

/// Merge `overrides` on top of `base` into a new map; neither input is touched.
pub fn merge_maps(base: &BTreeMap<String, String>, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = base.clone();
    for (k, v) in overrides {
        out.insert(k.clone(), v.clone());
    }
    out
}

//! Typed converge request and the builder that turns it into a desired object.

use std::collections::BTreeMap;

use keel_core::{annotations_for_instance, generate_resource_name, labels_for_instance, merge_maps, ObjectKey, Parent};
use kube::Resource;

use crate::mutation::{Mutation, MutationError, MutationPipeline};

/// Everything needed to build one desired child. Built per reconcile call and consumed once.
///
/// `template` carries the kind-specific payload; its identity, labels and annotations are
/// overwritten by [`ResourceRequest::build`].
pub struct ResourceRequest<K, C = ()> {
    /// Explicit child name; empty means derive it from the parent and component.
    pub name: String,
    /// Namespace override; the parent namespace is used when None.
    pub namespace: Option<String>,
    pub cluster_scoped: bool,
    pub parent: Parent,
    pub component: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub mutations: MutationPipeline<K, C>,
    pub context: C,
    pub template: K,
}

/// Result of [`ResourceRequest::build`]. When `error` is set the object is partially mutated.
#[derive(Debug)]
pub struct Built<K> {
    pub object: K,
    pub error: Option<MutationError>,
}

impl<K, C> ResourceRequest<K, C> {
    pub fn new(parent: Parent, component: impl Into<String>, template: K, context: C) -> Self {
        Self {
            name: String::new(),
            namespace: None,
            cluster_scoped: false,
            parent,
            component: component.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            mutations: MutationPipeline::new(),
            context,
            template,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Build the child without a namespace (ClusterRole, Namespace, ...).
    pub fn cluster_scoped(mut self) -> Self {
        self.cluster_scoped = true;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations.extend(annotations);
        self
    }

    pub fn with_mutation(mut self, m: Mutation<K, C>) -> Self {
        self.mutations.push(m);
        self
    }

    pub fn object_name(&self) -> String {
        if self.name.is_empty() {
            generate_resource_name(&self.parent.name, &self.component)
        } else {
            self.name.clone()
        }
    }

    pub fn object_namespace(&self) -> Option<String> {
        if self.cluster_scoped {
            return None;
        }
        self.namespace.clone().or_else(|| self.parent.namespace.clone()).filter(|ns| !ns.is_empty())
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { name: self.object_name(), namespace: self.object_namespace() }
    }
}

impl<K, C> ResourceRequest<K, C>
where
    K: Resource + Clone,
{
    /// Produce the desired object: identity from the request, default labels and annotations
    /// with request overrides on top, then every mutation hook in order. No store calls.
    pub fn build(&self) -> Built<K> {
        let mut object = self.template.clone();
        let labels = merge_maps(&labels_for_instance(&self.parent.name, &self.component), &self.labels);
        let annotations = merge_maps(
            &annotations_for_instance(&self.parent.name, self.parent.namespace.as_deref()),
            &self.annotations,
        );
        {
            let meta = object.meta_mut();
            meta.name = Some(self.object_name());
            meta.namespace = self.object_namespace();
            meta.labels = non_empty(labels);
            meta.annotations = non_empty(annotations);
        }
        let error = self.mutations.run(&self.context, &mut object).err();
        Built { object, error }
    }
}

fn non_empty(m: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if m.is_empty() { None } else { Some(m) }
}

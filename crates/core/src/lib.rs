//! Keel core types: object identity, instance labels and converge outcomes.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod labels;

pub use labels::{annotations_for_instance, generate_resource_name, labels_for_instance, merge_maps};

/// Identity of a stored object: name plus namespace (None for cluster-scoped kinds).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectKey {
    pub fn new(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { name: name.into(), namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()) }
    }

    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: Some(namespace.into()) }
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self { name: name.into(), namespace: None } }

    /// Key of an existing object. None when the object carries no name.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone()?;
        Some(Self::new(name, obj.meta().namespace.as_deref()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The instance a child resource belongs to.
///
/// `name`/`namespace` drive name generation and default labels. `kind`, `api_version` and `uid`
/// are only needed to record an owner reference; a parent built with [`Parent::named`] carries
/// identity only and children created under it will not be linked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Parent {
    pub name: String,
    pub namespace: Option<String>,
    pub kind: String,
    pub api_version: String,
    pub uid: Option<String>,
}

impl Parent {
    pub fn named(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            ..Default::default()
        }
    }

    pub fn from_resource<P: Resource<DynamicType = ()>>(parent: &P) -> Self {
        Self {
            name: parent.name_any(),
            namespace: parent.namespace(),
            kind: P::kind(&()).to_string(),
            api_version: P::api_version(&()).to_string(),
            uid: parent.uid(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { name: self.name.clone(), namespace: self.namespace.clone() }
    }

    /// Controller owner reference pointing at this parent, if enough is known to build one.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid.clone().filter(|u| !u.is_empty())?;
        if self.kind.is_empty() || self.api_version.is_empty() {
            return None;
        }
        Some(OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

// ---- converge vocabulary ----

/// Terminal result of a successful converge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    NoOp,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Deleted => "deleted",
            Outcome::NoOp => "noop",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Where the state machine found the child before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergeState {
    Absent,
    PresentNoDrift,
    PresentDrift,
    PresentImmutableDrift,
    ParentTerminating,
}

impl ConvergeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvergeState::Absent => "absent",
            ConvergeState::PresentNoDrift => "present_no_drift",
            ConvergeState::PresentDrift => "present_drift",
            ConvergeState::PresentImmutableDrift => "present_immutable_drift",
            ConvergeState::ParentTerminating => "parent_terminating",
        }
    }
}

impl fmt::Display for ConvergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A call against the external store (or the parent lifecycle query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Lifecycle,
    Get,
    Create,
    Update,
    Delete,
    List,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Lifecycle => "lifecycle",
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::List => "list",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Why a converge call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Mutation,
    Store(Operation),
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Mutation => "mutation",
            FailureReason::Store(op) => op.as_str(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

// ---- cluster features ----

/// Optional APIs detected on the target cluster. Callers consult these to decide whether a
/// reconciler applies at all (e.g. routes only exist on OpenShift).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFeatures {
    pub route_api: bool,
    pub version_api: bool,
    pub prometheus_api: bool,
    pub template_api: bool,
    /// Unix seconds of the last successful discovery; None until the first refresh.
    pub refreshed_at: Option<i64>,
}

impl ClusterFeatures {
    pub const ROUTE_GROUP_VERSION: &'static str = "route.openshift.io/v1";
    pub const VERSION_GROUP_VERSION: &'static str = "config.openshift.io/v1";
    pub const PROMETHEUS_GROUP_VERSION: &'static str = "monitoring.coreos.com/v1";
    pub const TEMPLATE_GROUP_VERSION: &'static str = "template.openshift.io/v1";

    /// Derive feature flags from served `group/version` strings.
    pub fn from_group_versions<'a, I>(served: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Self::default();
        for gv in served {
            match gv {
                Self::ROUTE_GROUP_VERSION => out.route_api = true,
                Self::VERSION_GROUP_VERSION => out.version_api = true,
                Self::PROMETHEUS_GROUP_VERSION => out.prometheus_api = true,
                Self::TEMPLATE_GROUP_VERSION => out.template_api = true,
                _ => {}
            }
        }
        out
    }

    pub fn is_refreshed(&self) -> bool { self.refreshed_at.is_some() }
}

pub mod prelude {
    pub use super::{ClusterFeatures, ConvergeState, FailureReason, ObjectKey, Operation, Outcome, Parent};
}

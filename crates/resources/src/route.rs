//! OpenShift Route reconciler. Routes only exist where `route.openshift.io` is served, so every
//! pass is gated on [`ClusterFeatures::route_api`].

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_converge::{ComparatorTable, ConvergeError, Converger, DriftPolicy, FieldToCompare, ResourceRequest};
use keel_core::{ClusterFeatures, Outcome, Parent};
use keel_store::{LabelFilter, ParentLifecycle, StoreClient, StoreResult};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const TERMINATION_EDGE: &str = "edge";
pub const TERMINATION_PASSTHROUGH: &str = "passthrough";
pub const TERMINATION_REENCRYPT: &str = "reencrypt";
pub const INSECURE_REDIRECT: &str = "Redirect";

const WILDCARD_NONE: &str = "None";
const MAX_HOSTNAME: usize = 253;
const MIN_FIRST_LABEL: usize = 20;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    plural = "routes",
    namespaced,
    schema = "disabled",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub to: RouteTargetReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard_policy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    pub target_port: IntOrString,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub termination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ca_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_edge_termination_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostnameError {
    #[error("hostname {host} cannot be shortened to 253 characters")]
    TooLong { host: String },
}

/// Routes reject hosts over 253 characters. The first label absorbs the excess as long as at
/// least 20 characters of it remain.
pub fn shorten_hostname(host: &str) -> Result<String, HostnameError> {
    if host.len() <= MAX_HOSTNAME {
        return Ok(host.to_string());
    }
    let excess = host.len() - MAX_HOSTNAME;
    let (first, rest) = host.split_once('.').unwrap_or((host, ""));
    let keep = first.len().saturating_sub(excess);
    if keep < MIN_FIRST_LABEL || !first.is_char_boundary(keep) {
        return Err(HostnameError::TooLong { host: host.to_string() });
    }
    if rest.is_empty() {
        return Ok(first[..keep].to_string());
    }
    Ok(format!("{}.{}", &first[..keep], rest))
}

/// Route to `service`. An insecure backend is reached over plain HTTP behind edge termination;
/// otherwise TLS passes through to the backend's `https` port. Plain HTTP is redirected either way.
pub fn backend_spec(service: &str, insecure: bool) -> RouteSpec {
    let (port, termination) = if insecure { ("http", TERMINATION_EDGE) } else { ("https", TERMINATION_PASSTHROUGH) };
    RouteSpec {
        to: RouteTargetReference { kind: "Service".into(), name: service.into(), weight: None },
        port: Some(RoutePort { target_port: IntOrString::String(port.into()) }),
        tls: Some(TlsConfig {
            termination: termination.into(),
            insecure_edge_termination_policy: Some(INSECURE_REDIRECT.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn request<C>(parent: Parent, component: &str, spec: RouteSpec, context: C) -> ResourceRequest<Route, C> {
    let template = Route { spec, ..Default::default() };
    ResourceRequest::new(parent, component, template, context)
}

/// Same as [`request`] with a custom host, shortened to what the router accepts.
pub fn request_with_host<C>(
    parent: Parent,
    component: &str,
    mut spec: RouteSpec,
    host: &str,
    context: C,
) -> Result<ResourceRequest<Route, C>, HostnameError> {
    spec.host = Some(shorten_hostname(host)?);
    Ok(request(parent, component, spec, context))
}

pub fn comparator() -> ComparatorTable<Route> {
    ComparatorTable::new()
        .with(FieldToCompare::labels())
        .with(FieldToCompare::annotations())
        // an unset host is generated by the router; only a pinned one is enforced
        .with(FieldToCompare::with_eq(
            "spec.host",
            |r: &Route| r.spec.host.clone(),
            |r: &mut Route, v| r.spec.host = v,
            |have: &Option<String>, want: &Option<String>| want.is_none() || have == want,
        ))
        .with(FieldToCompare::new("spec.path", |r: &Route| r.spec.path.clone(), |r: &mut Route, v| r.spec.path = v))
        .with(FieldToCompare::new("spec.to", |r: &Route| r.spec.to.clone(), |r: &mut Route, v| r.spec.to = v))
        .with(FieldToCompare::new("spec.port", |r: &Route| r.spec.port.clone(), |r: &mut Route, v| r.spec.port = v))
        .with(FieldToCompare::new("spec.tls", |r: &Route| r.spec.tls.clone(), |r: &mut Route, v| r.spec.tls = v))
        .with(FieldToCompare::with_eq(
            "spec.wildcard_policy",
            |r: &Route| r.spec.wildcard_policy.clone(),
            |r: &mut Route, v| r.spec.wildcard_policy = v,
            |a: &Option<String>, b: &Option<String>| {
                a.as_deref().unwrap_or(WILDCARD_NONE) == b.as_deref().unwrap_or(WILDCARD_NONE)
            },
        ))
}

pub fn drift_policy() -> DriftPolicy<Route> { DriftPolicy::new(comparator()) }

/// Converge a route when the cluster serves the route API, or remove it when `enabled` is off.
/// Returns None when routes are not available on this cluster.
pub async fn reconcile<S, L, C>(
    engine: &Converger<S, L>,
    features: &ClusterFeatures,
    request: ResourceRequest<Route, C>,
    enabled: bool,
) -> Result<Option<Outcome>, ConvergeError>
where
    S: StoreClient<Route>,
    L: ParentLifecycle,
{
    if !features.route_api {
        debug!(route = %request.key(), "route API not served; skipping");
        return Ok(None);
    }
    if !enabled {
        return engine.delete::<Route>(&request.key()).await.map(Some);
    }
    engine.converge(request, &drift_policy()).await.map(Some)
}

pub async fn list<S>(store: &S, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<Route>>
where
    S: StoreClient<Route>,
{
    store.list(namespace, filter).await
}

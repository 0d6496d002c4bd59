//! Service reconciler and the OpenShift serving-certificate (auto-TLS) annotation hook.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_converge::{ComparatorTable, DriftPolicy, FieldToCompare, Mutation, ResourceRequest};
use keel_core::{ClusterFeatures, Parent};
use keel_store::{LabelFilter, StoreClient, StoreResult};
use tracing::info;

/// Annotation asking the OpenShift service CA to mint a serving certificate into the named secret.
pub const SERVING_CERT_SECRET_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

const DEFAULT_TYPE: &str = "ClusterIP";
const DEFAULT_PROTOCOL: &str = "TCP";

pub fn request<C>(parent: Parent, component: &str, spec: ServiceSpec, context: C) -> ResourceRequest<Service, C> {
    let template = Service { spec: Some(spec), ..Default::default() };
    ResourceRequest::new(parent, component, template, context)
}

fn spec_mut(svc: &mut Service) -> &mut ServiceSpec { svc.spec.get_or_insert_with(ServiceSpec::default) }

/// Port identity as the server stores it: protocol and target port are defaulted on write.
fn port_key(p: &ServicePort) -> (Option<&str>, i32, &str, IntOrString, Option<&str>) {
    (
        p.name.as_deref(),
        p.port,
        p.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL),
        p.target_port.clone().unwrap_or(IntOrString::Int(p.port)),
        p.app_protocol.as_deref(),
    )
}

/// Node ports are allocated by the server; one only counts when the desired port pins it.
fn port_matches(existing: &ServicePort, desired: &ServicePort) -> bool {
    port_key(existing) == port_key(desired) && desired.node_port.map_or(true, |np| existing.node_port == Some(np))
}

fn ports_equal(existing: &Option<Vec<ServicePort>>, desired: &Option<Vec<ServicePort>>) -> bool {
    let have = existing.as_deref().unwrap_or_default();
    let want = desired.as_deref().unwrap_or_default();
    have.len() == want.len() && have.iter().zip(want).all(|(h, w)| port_matches(h, w))
}

pub fn comparator() -> ComparatorTable<Service> {
    ComparatorTable::new()
        .with(FieldToCompare::labels())
        .with(FieldToCompare::annotations())
        .with(FieldToCompare::new(
            "spec.selector",
            |s: &Service| s.spec.as_ref().and_then(|sp| sp.selector.clone()),
            |s: &mut Service, v| spec_mut(s).selector = v,
        ))
        .with(FieldToCompare::with_eq(
            "spec.ports",
            |s: &Service| s.spec.as_ref().and_then(|sp| sp.ports.clone()),
            |s: &mut Service, v| spec_mut(s).ports = v,
            ports_equal,
        ))
        .with(FieldToCompare::with_eq(
            "spec.type",
            |s: &Service| s.spec.as_ref().and_then(|sp| sp.type_.clone()),
            |s: &mut Service, v| spec_mut(s).type_ = v,
            |a: &Option<String>, b: &Option<String>| {
                a.as_deref().unwrap_or(DEFAULT_TYPE) == b.as_deref().unwrap_or(DEFAULT_TYPE)
            },
        ))
}

/// A requested cluster IP that differs from the allocated one cannot be applied in place.
pub fn is_immutable_drift(existing: &Service, desired: &Service) -> bool {
    let want = desired.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()).filter(|ip| !ip.is_empty());
    let have = existing.spec.as_ref().and_then(|s| s.cluster_ip.as_deref());
    match want {
        Some(ip) => have.map_or(false, |h| h != ip),
        None => false,
    }
}

pub fn drift_policy() -> DriftPolicy<Service> { DriftPolicy::new(comparator()).with_immutable(is_immutable_drift) }

pub async fn list<S>(store: &S, namespace: Option<&str>, filter: &LabelFilter) -> StoreResult<Vec<Service>>
where
    S: StoreClient<Service>,
{
    store.list(namespace, filter).await
}

/// Inputs for [`ensure_auto_tls_annotation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTls {
    pub secret_name: String,
    pub enabled: bool,
    /// The TLS secret already exists (user-provided); no certificate is requested then.
    pub secret_exists: bool,
}

/// Set or clear the serving-cert annotation. Only acts where the route API is served.
/// Returns true when the service was changed.
pub fn ensure_auto_tls_annotation(svc: &mut Service, tls: &AutoTls, route_api: bool) -> bool {
    if !route_api {
        return false;
    }
    let current = svc.metadata.annotations.as_ref().and_then(|a| a.get(SERVING_CERT_SECRET_ANNOTATION)).cloned();
    if tls.enabled {
        if current.is_none() && tls.secret_exists {
            info!(service = ?svc.metadata.name, secret = %tls.secret_name, "TLS secret already present; skipping auto TLS");
            return false;
        }
        if current.as_deref() == Some(tls.secret_name.as_str()) {
            return false;
        }
        svc.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(SERVING_CERT_SECRET_ANNOTATION.to_string(), tls.secret_name.clone());
        true
    } else {
        match svc.metadata.annotations.as_mut() {
            Some(a) => a.remove(SERVING_CERT_SECRET_ANNOTATION).is_some(),
            None => false,
        }
    }
}

/// Mutation hook applying [`ensure_auto_tls_annotation`] with the cluster's feature flags.
pub fn auto_tls(tls: AutoTls) -> Mutation<Service, ClusterFeatures> {
    Mutation::new("auto-tls", move |features: &ClusterFeatures, svc: &mut Service| {
        ensure_auto_tls_annotation(svc, &tls, features.route_api);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls(enabled: bool, secret_exists: bool) -> AutoTls {
        AutoTls { secret_name: "some-secret".into(), enabled, secret_exists }
    }

    fn annotation(svc: &Service) -> Option<&str> {
        svc.metadata.annotations.as_ref().and_then(|a| a.get(SERVING_CERT_SECRET_ANNOTATION)).map(String::as_str)
    }

    #[test]
    fn annotation_is_set_once_with_route_api() {
        let mut svc = Service::default();
        assert!(ensure_auto_tls_annotation(&mut svc, &tls(true, false), true));
        assert_eq!(annotation(&svc), Some("some-secret"));
        assert!(!ensure_auto_tls_annotation(&mut svc, &tls(true, false), true));
    }

    #[test]
    fn annotation_is_removed_when_disabled() {
        let mut svc = Service::default();
        ensure_auto_tls_annotation(&mut svc, &tls(true, false), true);
        assert!(ensure_auto_tls_annotation(&mut svc, &tls(false, false), true));
        assert_eq!(annotation(&svc), None);
        assert!(!ensure_auto_tls_annotation(&mut svc, &tls(false, false), true));
    }

    #[test]
    fn nothing_happens_without_route_api_or_with_existing_secret() {
        let mut svc = Service::default();
        assert!(!ensure_auto_tls_annotation(&mut svc, &tls(true, false), false));
        assert_eq!(annotation(&svc), None);
        assert!(!ensure_auto_tls_annotation(&mut svc, &tls(true, true), true));
        assert_eq!(annotation(&svc), None);
    }

    #[test]
    fn defaulted_type_and_ports_are_not_drift() {
        let desired = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort { name: Some("tcp-redis".into()), port: 6379, ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut existing = desired.clone();
        if let Some(spec) = existing.spec.as_mut() {
            spec.type_ = Some("ClusterIP".into());
            spec.cluster_ip = Some("10.0.0.7".into());
            if let Some(p) = spec.ports.as_mut().and_then(|p| p.first_mut()) {
                p.protocol = Some("TCP".into());
                p.target_port = Some(IntOrString::Int(6379));
            }
        }
        assert!(!comparator().diff(&mut existing, &desired));
        assert!(!is_immutable_drift(&existing, &desired));

        let mut pinned = desired.clone();
        spec_mut(&mut pinned).cluster_ip = Some("10.0.0.8".into());
        assert!(is_immutable_drift(&existing, &pinned));
    }

    fn node_port_service(port: ServicePort) -> Service {
        Service {
            spec: Some(ServiceSpec { type_: Some("NodePort".into()), ports: Some(vec![port]), ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn app_protocol_change_is_drift() {
        let plain = ServicePort { name: Some("grpc".into()), port: 8081, ..Default::default() };
        let mut existing = node_port_service(plain.clone());
        let desired = node_port_service(ServicePort { app_protocol: Some("kubernetes.io/h2c".into()), ..plain });
        assert_eq!(comparator().changed_fields(&mut existing, &desired), vec!["spec.ports"]);
        assert_eq!(existing, desired);
    }

    #[test]
    fn allocated_node_port_is_only_drift_when_pinned() {
        let port = ServicePort { name: Some("http".into()), port: 80, ..Default::default() };
        let desired = node_port_service(port.clone());
        let mut existing = node_port_service(ServicePort { node_port: Some(31080), ..port.clone() });
        assert!(!comparator().diff(&mut existing, &desired));

        let pinned = node_port_service(ServicePort { node_port: Some(30080), ..port });
        assert!(comparator().diff(&mut existing, &pinned));
        let ports = existing.spec.and_then(|s| s.ports).unwrap_or_default();
        assert_eq!(ports[0].node_port, Some(30080));
    }
}

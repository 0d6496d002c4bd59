use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::RoleBinding;
use keel_converge::{ConvergeError, ConvergeOptions, Converger};
use keel_core::config::is_cluster_config_ns;
use keel_core::{ObjectKey, Outcome, Parent};
use keel_kubehub::{features, get_kube_client, ClusterStore, KubeStore};
use keel_resources::route::Route;
use keel_resources::service::AutoTls;
use keel_resources::{configmap, instance_filter, service};
use keel_store::{NeverTerminating, ObjectLifecycle, StoreClient};
use kube::{Client, ResourceExt};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { ConfigMap, Service, StatefulSet, RoleBinding, Route }

#[derive(clap::Args, Debug, Clone)]
struct InstanceArgs {
    /// Owning instance name
    #[arg(long = "instance")]
    instance: String,
    /// Component tag; the child is named "<instance>-<component>" unless --name is given
    #[arg(long = "component", default_value = "")]
    component: String,
    /// Explicit child name
    #[arg(long = "name")]
    name: Option<String>,
    /// Extra labels (k=v), applied on top of the instance labels
    #[arg(long = "label", value_parser = parse_pair)]
    labels: Vec<(String, String)>,
    /// Owner kind, apiVersion and uid; without a uid children are created unowned
    #[arg(long = "owner-kind", default_value = "")]
    owner_kind: String,
    #[arg(long = "owner-api-version", default_value = "")]
    owner_api_version: String,
    #[arg(long = "owner-uid")]
    owner_uid: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect optional cluster APIs (routes, cluster version, Prometheus, templates)
    Features,
    /// Converge a ConfigMap for an instance
    Configmap {
        #[command(flatten)]
        instance: InstanceArgs,
        /// Data entries (k=v)
        #[arg(long = "data", value_parser = parse_pair)]
        data: Vec<(String, String)>,
        /// Create the config map immutable
        #[arg(long = "immutable", action = ArgAction::SetTrue)]
        immutable: bool,
    },
    /// Converge a Service for an instance
    Service {
        #[command(flatten)]
        instance: InstanceArgs,
        /// Ports as "name=port" or "port"
        #[arg(long = "port")]
        ports: Vec<String>,
        /// Pod selector (k=v); defaults to the instance name label
        #[arg(long = "selector", value_parser = parse_pair)]
        selector: Vec<(String, String)>,
        /// Service type (ClusterIP, NodePort, LoadBalancer)
        #[arg(long = "type")]
        type_: Option<String>,
        /// Request a serving certificate into this secret (OpenShift only)
        #[arg(long = "auto-tls")]
        auto_tls: Option<String>,
    },
    /// List children of an instance
    Ls {
        kind: Kind,
        #[arg(long = "instance")]
        instance: String,
        #[arg(long = "component", default_value = "")]
        component: String,
    },
    /// Delete a child; an absent child counts as deleted
    Delete {
        kind: Kind,
        name: String,
    },
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

fn parse_port(s: &str) -> Result<ServicePort> {
    let (name, port) = match s.split_once('=') {
        Some((n, p)) => (Some(n.to_string()), p),
        None => (None, s),
    };
    let port = port.parse::<i32>().with_context(|| format!("invalid port {:?}", s))?;
    Ok(ServicePort { name, port, ..Default::default() })
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    kind: &'static str,
    object: ObjectKey,
    outcome: Outcome,
}

fn print_report(output: Output, report: &Report) -> Result<()> {
    match output {
        Output::Human => println!("{} {} {}", report.kind, report.object, report.outcome),
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn converged(output: Output, kind: &'static str, object: ObjectKey, res: Result<Outcome, ConvergeError>) -> Result<()> {
    match res {
        Ok(outcome) => print_report(output, &Report { kind, object, outcome }),
        Err(e) => {
            error!(kind, object = %object, reason = %e.reason(), "converge failed");
            Err(anyhow!(e))
        }
    }
}

impl InstanceArgs {
    fn parent(&self, namespace: &str) -> Parent {
        let mut parent = Parent::named(self.instance.clone(), Some(namespace));
        if let Some(uid) = &self.owner_uid {
            parent.uid = Some(uid.clone());
            parent.kind = self.owner_kind.clone();
            parent.api_version = self.owner_api_version.clone();
        }
        parent
    }

    fn labels(&self) -> BTreeMap<String, String> { self.labels.iter().cloned().collect() }

    fn apply<K, C>(&self, req: keel_converge::ResourceRequest<K, C>) -> keel_converge::ResourceRequest<K, C> {
        let req = req.with_labels(self.labels());
        match &self.name {
            Some(n) => req.with_name(n.clone()),
            None => req,
        }
    }
}

/// Children follow their namespace: once it is being deleted they are removed instead of converged.
fn namespaced_engine<K>(client: &Client) -> Converger<KubeStore<K>, ObjectLifecycle<ClusterStore<Namespace>, Namespace>> {
    Converger::new(KubeStore::new(client.clone()), ObjectLifecycle::<_, Namespace>::namespace(ClusterStore::new(client.clone())))
        .with_options(ConvergeOptions::from_env())
}

async fn list_names<K>(client: &Client, ns: &str, parent: &Parent, component: &str) -> Result<Vec<String>>
where
    KubeStore<K>: StoreClient<K>,
    K: ResourceExt + Send + Sync + 'static,
{
    let store = KubeStore::<K>::new(client.clone());
    let items = store.list(Some(ns), &instance_filter(parent, component)).await?;
    Ok(items.iter().map(|o| o.name_any()).collect())
}

async fn delete_child<K>(client: &Client, key: &ObjectKey) -> Result<Outcome, ConvergeError>
where
    KubeStore<K>: StoreClient<K>,
    K: kube::Resource<DynamicType = ()> + Send + Sync + 'static,
{
    Converger::new(KubeStore::<K>::new(client.clone()), NeverTerminating).delete::<K>(key).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let client = get_kube_client().await?;
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());

    match cli.command {
        Commands::Features => {
            let f = features::refresh(client.clone()).await?;
            let cluster_config = is_cluster_config_ns(&ns);
            match cli.output {
                Output::Human => {
                    println!("route api        {}", f.route_api);
                    println!("cluster version  {}", f.version_api);
                    println!("prometheus api   {}", f.prometheus_api);
                    println!("template api     {}", f.template_api);
                    println!("cluster config   {} ({})", cluster_config, ns);
                }
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "features": &*f,
                        "namespace": ns,
                        "cluster_config_namespace": cluster_config,
                    }))?
                ),
            }
        }
        Commands::Configmap { instance, data, immutable } => {
            let parent = instance.parent(&ns);
            let data: BTreeMap<String, String> = data.into_iter().collect();
            let req = if immutable {
                configmap::immutable_request(parent, &instance.component, data, ())
            } else {
                configmap::request(parent, &instance.component, data, ())
            };
            let req = instance.apply(req);
            let key = req.key();
            info!(object = %key, "configmap invoked");
            let res = namespaced_engine::<ConfigMap>(&client).converge(req, &configmap::drift_policy()).await;
            converged(cli.output, "ConfigMap", key, res)?;
        }
        Commands::Service { instance, ports, selector, type_, auto_tls } => {
            let parent = instance.parent(&ns);
            let ports = ports.iter().map(|p| parse_port(p)).collect::<Result<Vec<_>>>()?;
            let selector: BTreeMap<String, String> = if selector.is_empty() {
                BTreeMap::from([(
                    keel_core::labels::K8S_NAME.to_string(),
                    keel_core::generate_resource_name(&instance.instance, &instance.component),
                )])
            } else {
                selector.into_iter().collect()
            };
            let spec = ServiceSpec { selector: Some(selector), ports: Some(ports), type_, ..Default::default() };
            let cluster = features::get_or_refresh(client.clone()).await?;
            let mut req = instance.apply(service::request(parent, &instance.component, spec, (*cluster).clone()));
            let tls = match auto_tls {
                Some(secret) => {
                    let secrets = KubeStore::<Secret>::new(client.clone());
                    let secret_exists = match secrets.get(&ObjectKey::namespaced(secret.clone(), ns.clone())).await {
                        Ok(_) => true,
                        Err(e) if e.is_not_found() => false,
                        Err(e) => return Err(anyhow!(e).context("checking TLS secret")),
                    };
                    AutoTls { secret_name: secret, enabled: true, secret_exists }
                }
                None => AutoTls { secret_name: String::new(), enabled: false, secret_exists: false },
            };
            req = req.with_mutation(service::auto_tls(tls));
            let key = req.key();
            info!(object = %key, "service invoked");
            let res = namespaced_engine::<Service>(&client).converge(req, &service::drift_policy()).await;
            converged(cli.output, "Service", key, res)?;
        }
        Commands::Ls { kind, instance, component } => {
            let parent = Parent::named(instance, Some(&ns));
            let names = match kind {
                Kind::ConfigMap => list_names::<ConfigMap>(&client, &ns, &parent, &component).await?,
                Kind::Service => list_names::<Service>(&client, &ns, &parent, &component).await?,
                Kind::StatefulSet => list_names::<StatefulSet>(&client, &ns, &parent, &component).await?,
                Kind::RoleBinding => list_names::<RoleBinding>(&client, &ns, &parent, &component).await?,
                Kind::Route => list_names::<Route>(&client, &ns, &parent, &component).await?,
            };
            match cli.output {
                Output::Human => names.iter().for_each(|n| println!("{}", n)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&names)?),
            }
        }
        Commands::Delete { kind, name } => {
            let key = ObjectKey::namespaced(name, ns.clone());
            let (label, res) = match kind {
                Kind::ConfigMap => ("ConfigMap", delete_child::<ConfigMap>(&client, &key).await),
                Kind::Service => ("Service", delete_child::<Service>(&client, &key).await),
                Kind::StatefulSet => ("StatefulSet", delete_child::<StatefulSet>(&client, &key).await),
                Kind::RoleBinding => ("RoleBinding", delete_child::<RoleBinding>(&client, &key).await),
                Kind::Route => ("Route", delete_child::<Route>(&client, &key).await),
            };
            converged(cli.output, label, key, res)?;
        }
    }
    Ok(())
}

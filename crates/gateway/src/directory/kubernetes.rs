//! Kubernetes endpoint discovery
//!
//! Talks to the API server with the pod's service-account credentials.
//! Instances come from the Endpoints object of the emulator's headless
//! service, or from the pods matching the label selector when that object
//! does not exist. Restarts delete the pod and let its StatefulSet
//! recreate it.

use super::{Discovered, DiscoveryScope, DiscoverySource};
use crate::config::KubernetesConfig;
use crate::monitor::recovery::InstanceController;
use async_trait::async_trait;
use loco_common::{
    DiscoveryMode, EndpointMeta, Error, Instance, InstanceSource, Result, TargetRef,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Endpoints object, reduced to the fields discovery reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub not_ready_addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub target_ref: Option<TargetRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
}

/// Pod list, reduced to the fields discovery reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: PodMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default)]
    pub name: Option<String>,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default, rename = "podIP")]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl Pod {
    /// Running with the `Ready` condition true
    pub fn is_ready(&self) -> bool {
        self.status.phase.as_deref() == Some("Running")
            && self
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
    }
}

/// Minimal in-cluster API client
pub struct KubeClient {
    http: reqwest::Client,
    config: KubernetesConfig,
}

impl KubeClient {
    /// Build a client trusting the service-account CA when it is mounted
    pub fn new(config: KubernetesConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout());

        match std::fs::read(&config.ca_path) {
            Ok(pem) => {
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    Error::InvalidConfig(format!("{}: {}", config.ca_path.display(), e))
                })?;
                builder = builder.add_root_certificate(cert);
            }
            Err(e) => {
                warn!(
                    "Cluster CA not readable at {}: {}",
                    config.ca_path.display(),
                    e
                );
            }
        }

        let http = builder
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &KubernetesConfig {
        &self.config
    }

    // Re-read on every call, the kubelet rotates projected tokens
    async fn token(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.config.token_path).await {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) => {
                debug!("No service account token: {}", e);
                None
            }
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        let mut req = self.http.request(method, &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = self.token().await {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .map_err(|e| Error::DiscoveryUnavailable(format!("{url}: {e}")))
    }

    /// GET a namespaced object. `None` when it does not exist.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let resp = self.request(reqwest::Method::GET, path, query).await?;
        match resp.status() {
            s if s.is_success() => resp
                .json::<T>()
                .await
                .map(Some)
                .map_err(|e| Error::DiscoveryUnavailable(format!("decode {path}: {e}"))),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(Error::DiscoveryUnavailable(format!("{path}: HTTP {s}"))),
        }
    }

    /// Fetch the emulator service's Endpoints object
    pub async fn get_endpoints(&self) -> Result<Option<Endpoints>> {
        let path = format!(
            "/api/v1/namespaces/{}/endpoints/{}",
            self.config.namespace, self.config.service_name
        );
        self.get_json(&path, &[]).await
    }

    /// List the pods matching the configured label selector
    pub async fn list_pods(&self) -> Result<PodList> {
        let path = format!("/api/v1/namespaces/{}/pods", self.config.namespace);
        let pods = self
            .get_json(&path, &[("labelSelector", self.config.label_selector.as_str())])
            .await?;
        Ok(pods.unwrap_or_default())
    }

    /// Delete a pod so its controller recreates it
    pub async fn delete_pod(&self, pod: &str) -> Result<()> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", self.config.namespace, pod);
        let resp = self.request(reqwest::Method::DELETE, &path, &[]).await?;

        match resp.status() {
            s if s.is_success() => {
                info!("Deleted pod {}/{}", self.config.namespace, pod);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!("Pod {} already gone", pod);
                Ok(())
            }
            s => Err(Error::Internal(format!("delete pod {pod}: HTTP {s}"))),
        }
    }
}

#[async_trait]
impl DiscoverySource for KubeClient {
    fn scope(&self) -> DiscoveryScope {
        DiscoveryScope {
            namespace: self.config.namespace.clone(),
            service: self.config.service_name.clone(),
            label_selector: self.config.label_selector.clone(),
        }
    }

    async fn discover(&self) -> Result<Discovered> {
        if let Some(endpoints) = self.get_endpoints().await? {
            return Ok(Discovered {
                mode: DiscoveryMode::KubernetesEndpoints,
                instances: instances_from_endpoints(&endpoints, &self.config),
            });
        }

        if self.config.label_selector.is_empty() {
            debug!(
                "No endpoints for {}/{} and no label selector",
                self.config.namespace, self.config.service_name
            );
            return Ok(Discovered {
                mode: DiscoveryMode::KubernetesEndpoints,
                instances: Vec::new(),
            });
        }

        debug!(
            "No endpoints for {}/{}, listing pods by {}",
            self.config.namespace, self.config.service_name, self.config.label_selector
        );
        let pods = self.list_pods().await?;
        Ok(Discovered {
            mode: DiscoveryMode::KubernetesPods,
            instances: instances_from_pods(&pods, &self.config),
        })
    }
}

#[async_trait]
impl InstanceController for KubeClient {
    async fn restart(&self, instance: &Instance) -> Result<()> {
        let Some(pod) = instance.pod_name.as_deref() else {
            return Err(Error::RestartUnsupported {
                id: instance.id.clone(),
            });
        };
        self.delete_pod(pod).await
    }
}

/// Everything discovery knows about one pod address
struct PodAddress {
    pod_name: Option<String>,
    ip: String,
    hostname: Option<String>,
    dns_name: Option<String>,
    target_ref: Option<TargetRef>,
    ports: BTreeMap<String, u16>,
    ready: bool,
}

/// Map endpoint addresses to instances, ordered by id.
///
/// Both ready and not-ready addresses are listed; readiness is carried on
/// the instance.
pub fn instances_from_endpoints(endpoints: &Endpoints, config: &KubernetesConfig) -> Vec<Instance> {
    let mut instances = Vec::new();

    for subset in &endpoints.subsets {
        let ports: BTreeMap<String, u16> = subset
            .ports
            .iter()
            .filter_map(|p| Some((p.name.clone()?, p.port)))
            .collect();

        let ready = subset.addresses.iter().map(|a| (a, true));
        let not_ready = subset.not_ready_addresses.iter().map(|a| (a, false));

        for (addr, is_ready) in ready.chain(not_ready) {
            let pod_name = addr
                .target_ref
                .as_ref()
                .filter(|r| r.kind.as_deref().map_or(true, |k| k == "Pod"))
                .and_then(|r| r.name.clone())
                .or_else(|| addr.hostname.clone());

            let dns_label = match &addr.hostname {
                Some(host) => host.clone(),
                None => addr.ip.replace(&['.', ':'][..], "-"),
            };

            instances.push(live_instance(
                PodAddress {
                    pod_name,
                    ip: addr.ip.clone(),
                    hostname: addr.hostname.clone(),
                    dns_name: Some(format!(
                        "{}.{}.{}.svc.{}",
                        dns_label, config.service_name, config.namespace, config.cluster_domain
                    )),
                    target_ref: addr.target_ref.clone(),
                    ports: ports.clone(),
                    ready: is_ready,
                },
                config,
            ));
        }
    }

    sort_instances(&mut instances);
    instances
}

/// Map label-selected pods to instances. Pods without an IP are skipped.
pub fn instances_from_pods(pods: &PodList, config: &KubernetesConfig) -> Vec<Instance> {
    let mut instances: Vec<Instance> = pods
        .items
        .iter()
        .filter_map(|pod| {
            let ip = pod.status.pod_ip.clone()?;
            let namespace = pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| config.namespace.clone());

            let dns_name = match (&pod.spec.hostname, &pod.spec.subdomain) {
                (Some(host), Some(sub)) => Some(format!(
                    "{host}.{sub}.{namespace}.svc.{}",
                    config.cluster_domain
                )),
                _ => None,
            };

            let ports = pod
                .spec
                .containers
                .iter()
                .flat_map(|c| &c.ports)
                .filter_map(|p| Some((p.name.clone()?, p.container_port)))
                .collect();

            Some(live_instance(
                PodAddress {
                    pod_name: Some(pod.metadata.name.clone()),
                    ip,
                    hostname: pod.spec.hostname.clone(),
                    dns_name,
                    target_ref: Some(TargetRef {
                        kind: Some("Pod".to_string()),
                        name: Some(pod.metadata.name.clone()),
                        namespace: Some(namespace),
                        uid: pod.metadata.uid.clone(),
                    }),
                    ports,
                    ready: pod.is_ready(),
                },
                config,
            ))
        })
        .collect();

    sort_instances(&mut instances);
    instances
}

fn live_instance(addr: PodAddress, config: &KubernetesConfig) -> Instance {
    let (id, display_name) = match addr.pod_name.as_deref().and_then(pod_ordinal) {
        Some(n) => (format!("instance-{n}"), format!("Instance {n}")),
        None => {
            let name = addr.pod_name.clone().unwrap_or_else(|| addr.ip.clone());
            (name.clone(), name)
        }
    };

    let host = if addr.ip.contains(':') {
        format!("[{}]", addr.ip)
    } else {
        addr.ip.clone()
    };

    let mut ports = addr.ports;
    let vnc_port = *ports.entry("vnc".to_string()).or_insert(config.vnc_port);
    let stream_port = *ports.entry("stream".to_string()).or_insert(config.stream_port);

    Instance {
        id,
        display_name,
        vnc_target: format!("{host}:{vnc_port}"),
        stream_url: format!("http://{host}:{stream_port}{}", config.stream_path),
        provisioned: true,
        source: InstanceSource::Live,
        ready: addr.ready,
        pod_name: addr.pod_name,
        description: None,
        endpoint: Some(EndpointMeta {
            pod_ip: addr.ip,
            hostname: addr.hostname,
            dns_name: addr.dns_name,
            namespace: config.namespace.clone(),
            target_ref: addr.target_ref,
            ports,
        }),
    }
}

fn sort_instances(instances: &mut [Instance]) {
    instances.sort_by(|a, b| natural_key(&a.id).cmp(&natural_key(&b.id)));
}

/// Trailing StatefulSet ordinal of a pod name (`loco-emulator-3` -> 3)
fn pod_ordinal(name: &str) -> Option<u32> {
    let (_, tail) = name.rsplit_once('-')?;
    tail.parse().ok()
}

fn natural_key(id: &str) -> (String, u32) {
    match id.rsplit_once('-') {
        Some((prefix, n)) => match n.parse() {
            Ok(n) => (prefix.to_string(), n),
            Err(_) => (id.to_string(), 0),
        },
        None => (id.to_string(), 0),
    }
}

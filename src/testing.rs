//! In-memory doubles and object builders shared by the unit tests.

use crate::{
    cluster::Cluster,
    rdns::{
        DomainCredentials,
        TokenStore,
    },
    settings::{
        AddressSource,
        ControllerSettings,
        Settings,
    },
};
use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{
        Node,
        Pod,
    },
    networking::v1::{
        Ingress,
        IngressLoadBalancerIngress,
        IngressLoadBalancerStatus,
        IngressRule,
        IngressSpec,
        IngressStatus,
    },
};
use kube::{
    api::ObjectMeta,
    core::ErrorResponse,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Mutex,
    },
    time::Duration,
};

pub fn settings() -> Settings {
    Settings {
        debug: false,
        listen: "127.0.0.1:9595".parse().unwrap(),
        root_domain: "rancher.io".to_string(),
        base_rdns_url: "http://127.0.0.1:1/v1".parse().unwrap(),
        renew_interval: Duration::from_secs(24 * 60 * 60),
        ingress_resync: Duration::from_secs(60),
        http_timeout: Duration::from_secs(5),
        watch_namespace: None,
        address_source: AddressSource::LoadBalancer,
        cluster_id: None,
        controller: ControllerSettings::default(),
    }
}

pub fn ingress(name: &str, ns: &str, ips: &[&str]) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        status: Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(
                    ips.iter()
                        .map(|ip| IngressLoadBalancerIngress {
                            ip: Some(ip.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
            }),
        }),
        ..Default::default()
    }
}

pub fn with_annotation(mut ingress: Ingress, key: &str, value: &str) -> Ingress {
    ingress
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
    ingress
}

pub fn with_rule_hosts(mut ingress: Ingress, hosts: &[&str]) -> Ingress {
    ingress.spec = Some(IngressSpec {
        rules: Some(
            hosts
                .iter()
                .map(|host| IngressRule {
                    host: Some(host.to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    });
    ingress
}

pub fn annotation<'a>(ingress: &'a Ingress, key: &str) -> Option<&'a str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

pub fn rule_hosts(ingress: &Ingress) -> Vec<String> {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .map(|rules| rules.iter().filter_map(|rule| rule.host.clone()).collect())
        .unwrap_or_default()
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (test)"),
        reason: reason.to_string(),
        code,
    })
}

pub fn conflict() -> kube::Error {
    api_error(409, "Conflict")
}

pub fn not_found() -> kube::Error {
    api_error(404, "NotFound")
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

#[derive(Default)]
pub struct MemoryTokenStore {
    credentials: Mutex<Option<DomainCredentials>>,
    gets: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn with_credentials(token: &str, fqdn: &str) -> Self {
        Self {
            credentials: Mutex::new(Some(DomainCredentials {
                token: token.to_string(),
                fqdn: fqdn.to_string(),
            })),
            gets: AtomicUsize::new(0),
        }
    }

    pub fn credentials(&self) -> Option<DomainCredentials> {
        self.credentials.lock().unwrap().clone()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self) -> Result<Option<DomainCredentials>, kube::Error> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials())
    }

    async fn set(&self, credentials: &DomainCredentials) -> Result<(), kube::Error> {
        *self.credentials.lock().unwrap() = Some(credentials.clone());
        Ok(())
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// In-memory [`Cluster`]. Replacing an ingress fails with a conflict while `conflicts` is non-zero (or always if
/// `always_conflict` is set).
#[derive(Default)]
pub struct FakeCluster {
    pub ingresses: Mutex<HashMap<(String, String), Ingress>>,
    pub deployments: Mutex<HashMap<(String, String), Deployment>>,
    pub pods: Mutex<Vec<Pod>>,
    pub nodes: Mutex<Vec<Node>>,
    pub conflicts: AtomicUsize,
    pub always_conflict: bool,
    pub replaced: Mutex<Vec<Ingress>>,
    pub ingress_gets: AtomicUsize,
    pub replace_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn with_ingress(ingress: Ingress) -> Self {
        let cluster = Self::default();
        cluster.put_ingress(ingress);
        cluster
    }

    pub fn put_ingress(&self, ingress: Ingress) {
        let key = (
            ingress.metadata.namespace.clone().unwrap_or_default(),
            ingress.metadata.name.clone().unwrap_or_default(),
        );
        self.ingresses.lock().unwrap().insert(key, ingress);
    }

    pub fn put_deployment(&self, deployment: Deployment) {
        let key = (
            deployment.metadata.namespace.clone().unwrap_or_default(),
            deployment.metadata.name.clone().unwrap_or_default(),
        );
        self.deployments.lock().unwrap().insert(key, deployment);
    }

    pub fn replaced(&self) -> Vec<Ingress> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn ingress_gets(&self) -> usize {
        self.ingress_gets.load(Ordering::SeqCst)
    }

    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, kube::Error> {
        self.ingress_gets.fetch_add(1, Ordering::SeqCst);
        self.ingresses
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(not_found)
    }

    async fn replace_ingress(&self, ingress: &Ingress) -> Result<Ingress, kube::Error> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        if self.always_conflict {
            return Err(conflict());
        }
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(conflict());
        }

        let mut stored = ingress.clone();
        let version = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        stored.metadata.resource_version = Some((version + 1).to_string());

        self.replaced.lock().unwrap().push(ingress.clone());
        self.put_ingress(stored.clone());
        Ok(stored)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, kube::Error> {
        self.deployments
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(not_found)
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|node| node.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(not_found)
    }
}

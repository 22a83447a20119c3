//! Derives the externally reachable addresses and hostnames of the ingress layer from cluster snapshots.

use k8s_openapi::api::{
    core::v1::{
        Node,
        Pod,
    },
    networking::v1::Ingress,
};
use std::net::IpAddr;

/// Marks controller deployments and pods whose nodes should be registered.
pub const ANNOTATION_MANAGED: &str = "rdns.cattle.io/managed";
/// Public ip of a node, preferred over the pod host ip.
pub const ANNOTATION_NODE_PUBLIC_IP: &str = "rdns.cattle.io/public-ip";

pub const NIP_ROOT_DOMAIN: &str = "nip.io";

/// Load balancer ips from the ingress status, in status order and without duplicates.
pub fn ingress_addresses(ingress: &Ingress) -> Vec<String> {
    let ips = ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|i| i.ip.as_deref())
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    dedup(ips)
}

/// Addresses of the nodes running managed controller pods.
///
/// Uses the node's public ip annotation if present and falls back to the pod's host ip.
pub fn controller_addresses(pods: &[Pod], nodes: &[Node]) -> Vec<String> {
    let ips = pods
        .iter()
        .filter(|pod| is_managed(pod.metadata.annotations.as_ref()))
        .filter_map(|pod| {
            let node_ip = pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.as_deref())
                .and_then(|node_name| nodes.iter().find(|node| node.metadata.name.as_deref() == Some(node_name)))
                .and_then(node_public_ip);

            node_ip.or_else(|| {
                pod.status
                    .as_ref()
                    .and_then(|status| status.host_ip.clone())
                    .filter(|ip| !ip.is_empty())
            })
        })
        .collect::<Vec<_>>();

    dedup(ips)
}

/// Names of the nodes that [`controller_addresses`] needs for `pods`.
pub fn controller_node_names(pods: &[Pod]) -> Vec<String> {
    let names = pods
        .iter()
        .filter(|pod| is_managed(pod.metadata.annotations.as_ref()))
        .filter_map(|pod| pod.spec.as_ref().and_then(|spec| spec.node_name.clone()))
        .collect();
    dedup(names)
}

pub fn is_managed(annotations: Option<&std::collections::BTreeMap<String, String>>) -> bool {
    annotations
        .and_then(|annotations| annotations.get(ANNOTATION_MANAGED))
        .map_or(false, |value| value == "true")
}

fn node_public_ip(node: &Node) -> Option<String> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_NODE_PUBLIC_IP))
        .filter(|ip| !ip.is_empty())
        .cloned()
}

/// `<name>.<namespace>.<fqdn>`
pub fn rdns_hostname(name: &str, namespace: &str, fqdn: &str) -> String {
    format!("{name}.{namespace}.{fqdn}")
}

/// `<name>.<namespace>.<ip>.nip.io` for the first load balancer ip of the ingress.
pub fn nip_hostname(ingress: &Ingress) -> Option<String> {
    let name = ingress.metadata.name.as_deref()?;
    let namespace = ingress.metadata.namespace.as_deref().unwrap_or("default");
    let ip = ingress_addresses(ingress).into_iter().next()?;
    if ip.parse::<IpAddr>().is_err() {
        warn!(%ip, "load balancer address of ingress {namespace}/{name} is not an ip");
    }
    Some(format!("{name}.{namespace}.{ip}.{NIP_ROOT_DOMAIN}"))
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

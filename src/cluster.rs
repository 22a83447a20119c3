use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{
        ConfigMap,
        Node,
        Pod,
    },
    networking::v1::Ingress,
};
use kube::{
    api::{
        ListParams,
        PostParams,
    },
    Api,
};

const CLUSTER_INFO_NAMESPACE: &str = "kube-system";
const CLUSTER_INFO_NAME: &str = "cluster-info";
const CLUSTER_ID_KEY: &str = "cluster-id";

/// The cluster reads and writes the reconciler needs.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, kube::Error>;

    /// Replaces the ingress. Fails with a 409 conflict if it changed since it was read.
    async fn replace_ingress(&self, ingress: &Ingress) -> Result<Ingress, kube::Error>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, kube::Error>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error>;

    async fn get_node(&self, name: &str) -> Result<Node, kube::Error>;
}

pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress, kube::Error> {
        Api::<Ingress>::namespaced(self.client.clone(), namespace).get(name).await
    }

    async fn replace_ingress(&self, ingress: &Ingress) -> Result<Ingress, kube::Error> {
        let ns = ingress.metadata.namespace.as_deref().unwrap_or("default");
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        Api::<Ingress>::namespaced(self.client.clone(), ns)
            .replace(name, &PostParams::default(), ingress)
            .await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, kube::Error> {
        Api::<Deployment>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        Api::<Node>::all(self.client.clone()).get(name).await
    }
}

/// Reads the cluster id from the `kube-system/cluster-info` config map. `None` if the config map or the key is
/// missing.
pub async fn lookup_cluster_id(client: kube::Client) -> Result<Option<String>, kube::Error> {
    let api = Api::<ConfigMap>::namespaced(client, CLUSTER_INFO_NAMESPACE);
    let Some(config_map) = api.get_opt(CLUSTER_INFO_NAME).await? else {
        debug!("config map {CLUSTER_INFO_NAMESPACE}/{CLUSTER_INFO_NAME} does not exist");
        return Ok(None);
    };
    let id = cluster_id(&config_map);
    debug!(?id, "cluster id from {CLUSTER_INFO_NAMESPACE}/{CLUSTER_INFO_NAME}");
    Ok(id)
}

fn cluster_id(config_map: &ConfigMap) -> Option<String> {
    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(CLUSTER_ID_KEY))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

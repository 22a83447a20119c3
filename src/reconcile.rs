use crate::{
    address,
    context::Context,
    queue::ChangeQueue,
    rdns::RdnsError,
    retry::{
        retry_with_backoff,
        RetryConfig,
    },
    settings::AddressSource,
    watcher::{
        QueueItem,
        ANNOTATION_HOSTNAME,
    },
};
use k8s_openapi::api::{
    apps::v1::Deployment,
    networking::v1::Ingress,
};
use kube::runtime::reflector::ObjectRef;
use std::sync::Arc;

pub const ANNOTATION_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Rdns(#[from] RdnsError),
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl ReconcileError {
    /// The object was modified since it was read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Kube(kube::Error::Api(err)) if err.code == 409)
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(err) if err.code == 404)
}

/// Selects how the hostname of an ingress is derived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressClass {
    /// Registered with rdns. Also used when no class is set.
    Nginx,
    /// Address embedding nip.io hostname, nothing is registered.
    Gce,
    Other(String),
}

impl IngressClass {
    pub fn of(ingress: &Ingress) -> Self {
        let class = ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_INGRESS_CLASS))
            .map(String::as_str)
            .or_else(|| ingress.spec.as_ref().and_then(|spec| spec.ingress_class_name.as_deref()))
            .unwrap_or_default();

        match class {
            "" | "nginx" => IngressClass::Nginx,
            "gce" => IngressClass::Gce,
            other => IngressClass::Other(other.to_string()),
        }
    }
}

/// Points every rule host ending with `root_domain` at `hostname`. Returns the number of rewritten rules.
pub fn rewrite_rule_hosts(ingress: &mut Ingress, root_domain: &str, hostname: &str) -> usize {
    let Some(rules) = ingress.spec.as_mut().and_then(|spec| spec.rules.as_mut()) else {
        return 0;
    };

    let mut rewritten = 0;
    for host in rules.iter_mut().filter_map(|rule| rule.host.as_mut()) {
        if host.as_str() != hostname && host.ends_with(root_domain) {
            debug!(from = %host, to = %hostname, "rewriting ingress rule host");
            *host = hostname.to_string();
            rewritten += 1;
        }
    }
    rewritten
}

/// Drains the [`ChangeQueue`] and converges the rdns domain and the ingress annotations.
pub struct Reconciler {
    ctx: Arc<Context>,
    queue: Arc<ChangeQueue<QueueItem>>,
    retry: RetryConfig,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>, queue: Arc<ChangeQueue<QueueItem>>) -> Self {
        Self {
            ctx,
            queue,
            retry: RetryConfig::conflict(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Processes items until the queue shuts down. Failed items are logged and dropped, the next watch event or
    /// resync brings them back.
    pub async fn run(&self) {
        info!("Starting reconciler");

        while let Some(item) = self.queue.get().await {
            debug!("{item}: begin processing");
            if let Err(err) = self.sync(&item).await {
                error!("Failed to sync {item}: {err}");
            }
            debug!("{item}: done processing");
            self.queue.done(&item);
        }

        info!("Reconciler stopped");
    }

    pub async fn sync(&self, item: &QueueItem) -> Result<(), ReconcileError> {
        match item {
            QueueItem::Ingress(oref) => self.sync_ingress(oref).await,
            QueueItem::Controller(oref) => self.sync_controller(oref).await,
        }
    }

    #[instrument(level = "debug", skip_all, fields(namespace = ?oref.namespace, name = %oref.name))]
    async fn sync_ingress(&self, oref: &ObjectRef<Ingress>) -> Result<(), ReconcileError> {
        let ns = oref.namespace.as_deref().unwrap_or("default");
        let name = oref.name.as_str();

        retry_with_backoff(&self.retry, "update ingress", ReconcileError::is_conflict, || async move {
            // always work on the latest version, the queued reference may be stale
            let latest = match self.ctx.cluster.get_ingress(ns, name).await {
                Ok(ingress) => ingress,
                Err(err) if is_not_found(&err) => {
                    debug!("ingress {ns}/{name} is gone");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            let Some(updated) = self.converge(latest).await? else {
                return Ok(());
            };

            self.ctx.cluster.replace_ingress(&updated).await?;
            info!(
                hostname = ?updated.metadata.annotations.as_ref().and_then(|a| a.get(ANNOTATION_HOSTNAME)),
                "updated ingress {ns}/{name}"
            );
            Ok(())
        })
        .await
    }

    /// Computes the desired state of `ingress`. Returns `None` if nothing needs to be written.
    async fn converge(&self, mut ingress: Ingress) -> Result<Option<Ingress>, ReconcileError> {
        let original = ingress.clone();
        let name = ingress
            .metadata
            .name
            .clone()
            .ok_or(ReconcileError::MissingField("metadata.name"))?;
        let ns = ingress
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let hostname = match IngressClass::of(&ingress) {
            IngressClass::Nginx => {
                let addresses = self.resolve_addresses(&ingress).await?;
                if addresses.is_empty() {
                    debug!("ingress {ns}/{name} has no addresses yet");
                    return Ok(None);
                }
                let fqdn = self.ctx.rdns.apply_domain(&addresses).await?;
                address::rdns_hostname(&name, &ns, &fqdn)
            }
            IngressClass::Gce => {
                let Some(hostname) = address::nip_hostname(&ingress) else {
                    warn!("Failed to get ingress {ns}/{name} ip address");
                    return Ok(None);
                };
                hostname
            }
            IngressClass::Other(class) => {
                info!("Do nothing with ingress class {class:?} of ingress {ns}/{name}");
                return Ok(None);
            }
        };

        ingress
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_HOSTNAME.to_string(), hostname.clone());

        rewrite_rule_hosts(&mut ingress, &self.ctx.settings.root_domain, &hostname);

        if ingress == original {
            debug!("ingress {ns}/{name} is up to date");
            return Ok(None);
        }

        Ok(Some(ingress))
    }

    async fn resolve_addresses(&self, ingress: &Ingress) -> Result<Vec<String>, ReconcileError> {
        match self.ctx.settings.address_source {
            AddressSource::LoadBalancer => Ok(address::ingress_addresses(ingress)),
            AddressSource::ControllerNodes => self.controller_addresses().await,
        }
    }

    async fn controller_addresses(&self) -> Result<Vec<String>, ReconcileError> {
        let controller = &self.ctx.settings.controller;
        let pods = self
            .ctx
            .cluster
            .list_pods(&controller.namespace, &controller.pod_selector)
            .await?;

        let mut nodes = Vec::new();
        for name in address::controller_node_names(&pods) {
            nodes.push(self.ctx.cluster.get_node(&name).await?);
        }

        let addresses = address::controller_addresses(&pods, &nodes);
        debug!(?addresses, "resolved ingress controller addresses");
        Ok(addresses)
    }

    #[instrument(level = "debug", skip_all, fields(namespace = ?oref.namespace, name = %oref.name))]
    async fn sync_controller(&self, oref: &ObjectRef<Deployment>) -> Result<(), ReconcileError> {
        let ns = oref.namespace.as_deref().unwrap_or("default");

        let deployment = match self.ctx.cluster.get_deployment(ns, &oref.name).await {
            Ok(deployment) => deployment,
            Err(err) if is_not_found(&err) => {
                debug!("deployment {ns}/{} is gone", oref.name);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if !address::is_managed(deployment.metadata.annotations.as_ref()) {
            debug!("deployment {ns}/{} is not managed by rdns", oref.name);
            return Ok(());
        }

        let addresses = self.controller_addresses().await?;
        if addresses.is_empty() {
            warn!("no addresses found for the ingress controller");
            return Ok(());
        }

        let fqdn = self.ctx.rdns.apply_domain(&addresses).await?;
        info!(%fqdn, ?addresses, "applied ingress controller addresses");
        Ok(())
    }
}

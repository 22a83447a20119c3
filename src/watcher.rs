use crate::{
    address,
    queue::ChangeQueue,
    settings::{
        AddressSource,
        Settings,
    },
};
use futures::{
    stream::{
        self,
        BoxStream,
    },
    Stream,
    StreamExt as _,
};
use k8s_openapi::api::{
    apps::v1::Deployment,
    networking::v1::Ingress,
};
use kube::{
    api::ListParams,
    runtime::{
        reflector::ObjectRef,
        watcher,
        WatchStreamExt as _,
    },
    Api,
    Resource,
};
use serde::de::DeserializeOwned;
use std::{
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Set on ingresses once their rdns hostname has been registered.
pub const ANNOTATION_HOSTNAME: &str = "rdns.cattle.io/hostname";

/// Identifies an object the reconciler needs to look at. Never carries a snapshot of the object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueItem {
    Ingress(ObjectRef<Ingress>),
    /// The ingress-nginx controller deployment, see [`AddressSource::ControllerNodes`].
    Controller(ObjectRef<Deployment>),
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueItem::Ingress(oref) => write!(f, "ingress {}", key(oref)),
            QueueItem::Controller(oref) => write!(f, "deployment {}", key(oref)),
        }
    }
}

fn key<K: Resource>(oref: &ObjectRef<K>) -> String {
    format!("{}/{}", oref.namespace.as_deref().unwrap_or(""), oref.name)
}

/// A watched object, decoded at the watch boundary.
#[derive(Clone, Debug)]
pub enum WatchedObject {
    Ingress(Ingress),
    Deployment(Deployment),
}

impl From<Ingress> for WatchedObject {
    fn from(ingress: Ingress) -> Self {
        WatchedObject::Ingress(ingress)
    }
}

impl From<Deployment> for WatchedObject {
    fn from(deployment: Deployment) -> Self {
        WatchedObject::Deployment(deployment)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Seen by the initial list or a periodic re-list.
    Listed,
    Applied,
    Deleted,
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub object: WatchedObject,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, object: impl Into<WatchedObject>) -> Self {
        Self {
            kind,
            object: object.into(),
        }
    }
}

/// True if the ingress already carries a registered hostname. Such ingresses are not queued again, otherwise the
/// reconciler's own annotation writes would trigger it forever.
pub fn has_hostname(ingress: &Ingress) -> bool {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_HOSTNAME))
        .map_or(false, |hostname| !hostname.is_empty())
}

/// Decides whether `event` needs reconciling.
pub fn queue_item(event: &ChangeEvent, settings: &Settings) -> Option<QueueItem> {
    if event.kind == ChangeKind::Deleted {
        return None;
    }

    match &event.object {
        WatchedObject::Ingress(ingress) => {
            if has_hostname(ingress) {
                trace!(name = ?ingress.metadata.name, "ingress already has a hostname, ignoring");
                return None;
            }
            Some(QueueItem::Ingress(ObjectRef::from_obj(ingress)))
        }
        WatchedObject::Deployment(deployment) => {
            if settings.address_source != AddressSource::ControllerNodes {
                return None;
            }
            let controller = &settings.controller;
            if deployment.metadata.name.as_deref() != Some(controller.deployment.as_str())
                || deployment.metadata.namespace.as_deref() != Some(controller.namespace.as_str())
            {
                return None;
            }
            if !address::is_managed(deployment.metadata.annotations.as_ref()) {
                debug!("ingress controller deployment is not managed by rdns, ignoring");
                return None;
            }
            Some(QueueItem::Controller(ObjectRef::from_obj(deployment)))
        }
    }
}

/// Feeds cluster changes into the [`ChangeQueue`].
pub struct ResourceWatcher {
    client: kube::Client,
    settings: Arc<Settings>,
    queue: Arc<ChangeQueue<QueueItem>>,
}

impl ResourceWatcher {
    pub fn new(client: kube::Client, settings: Arc<Settings>, queue: Arc<ChangeQueue<QueueItem>>) -> Self {
        Self {
            client,
            settings,
            queue,
        }
    }

    /// Runs until `stop` is cancelled, then shuts the queue down.
    pub async fn run(self, stop: CancellationToken) {
        let mut events = self.events();

        info!("Starting watcher");

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                warn!("watch streams ended");
                break;
            };
            self.handle(event);
        }

        self.queue.shut_down();
        info!("Watcher stopped");
    }

    fn handle(&self, event: ChangeEvent) {
        match (&event.kind, &event.object) {
            (ChangeKind::Deleted, WatchedObject::Ingress(ingress)) => {
                debug!(name = ?ingress.metadata.name, namespace = ?ingress.metadata.namespace, "ingress deleted");
            }
            (ChangeKind::Deleted, WatchedObject::Deployment(deployment)) => {
                debug!(name = ?deployment.metadata.name, "deployment deleted");
            }
            _ => {}
        }

        if let Some(item) = queue_item(&event, &self.settings) {
            info!("{:?} {item}", event.kind);
            self.queue.add(item);
        }
    }

    fn events(&self) -> BoxStream<'static, ChangeEvent> {
        let resync = self.settings.ingress_resync;

        let ingresses = match self.settings.watch_namespace.as_deref() {
            Some(ns) => Api::<Ingress>::namespaced(self.client.clone(), ns),
            None => Api::<Ingress>::all(self.client.clone()),
        };
        let mut streams = vec![watch_kind(ingresses, None, resync)];

        if self.settings.address_source == AddressSource::ControllerNodes {
            let controller = &self.settings.controller;
            let deployments = Api::<Deployment>::namespaced(self.client.clone(), &controller.namespace);
            let selector = format!("metadata.name={}", controller.deployment);
            streams.push(watch_kind(deployments, Some(selector), resync));
        }

        stream::select_all(streams).boxed()
    }
}

/// List-then-watch stream of one kind, merged with a periodic re-list as a backstop for missed events.
fn watch_kind<K>(api: Api<K>, field_selector: Option<String>, resync: Duration) -> BoxStream<'static, ChangeEvent>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default,
    WatchedObject: From<K>,
{
    let mut config = watcher::Config::default();
    let mut list_params = ListParams::default();
    if let Some(selector) = field_selector.as_deref() {
        config = config.fields(selector);
        list_params = list_params.fields(selector);
    }

    let kind = K::kind(&K::DynamicType::default()).to_string();

    let watch = watcher(api.clone(), config).default_backoff().filter_map({
        let kind = kind.clone();
        move |event| {
            let kind = kind.clone();
            async move {
                match event {
                    Ok(watcher::Event::InitApply(obj)) => Some(ChangeEvent::new(ChangeKind::Listed, obj)),
                    Ok(watcher::Event::Apply(obj)) => Some(ChangeEvent::new(ChangeKind::Applied, obj)),
                    Ok(watcher::Event::Delete(obj)) => Some(ChangeEvent::new(ChangeKind::Deleted, obj)),
                    Ok(watcher::Event::Init) => {
                        debug!(%kind, "listing");
                        None
                    }
                    Ok(watcher::Event::InitDone) => {
                        debug!(%kind, "initial list done");
                        None
                    }
                    Err(err) => {
                        warn!(%kind, "watch error: {err}");
                        None
                    }
                }
            }
        }
    });

    stream::select(watch, relist(api, list_params, resync, kind)).boxed()
}

fn relist<K>(
    api: Api<K>,
    list_params: ListParams,
    period: Duration,
    kind: String,
) -> impl Stream<Item = ChangeEvent> + Send + 'static
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    WatchedObject: From<K>,
{
    async_stream::stream! {
        let start = tokio::time::Instant::now() + period;
        let mut timer = tokio::time::interval_at(start, period);

        loop {
            timer.tick().await;
            match api.list(&list_params).await {
                Ok(objects) => {
                    debug!(%kind, count = objects.items.len(), "resync");
                    for obj in objects {
                        yield ChangeEvent::new(ChangeKind::Listed, obj);
                    }
                }
                Err(err) => {
                    error!(%kind, "resync failed: {err}");
                }
            }
        }
    }
}

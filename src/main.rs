#[macro_use]
extern crate tracing;

use clap::Parser;
use eyre::{
    Context as _,
    Result,
};
use kube_rdns::{
    cluster::{
        lookup_cluster_id,
        KubeCluster,
    },
    context::Context,
    health,
    queue::ChangeQueue,
    rdns::{
        RdnsClient,
        SecretTokenStore,
    },
    reconcile::Reconciler,
    renew,
    settings::{
        Settings,
        SettingsArgs,
    },
    watcher::ResourceWatcher,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
enum Args {
    /// Watch the cluster and keep the rdns domain in sync with the ingress addresses.
    Controller(SettingsArgs),
    /// Renew the rdns domain of this cluster once.
    Renew(SettingsArgs),
    /// Print the rdns domain registered for this cluster.
    ShowDomain(SettingsArgs),
}

impl Args {
    fn settings(&self) -> &SettingsArgs {
        match self {
            Args::Controller(args) | Args::Renew(args) | Args::ShowDomain(args) => args,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let settings = Settings::try_from(args.settings().clone())?;
    init_tracing(settings.debug);
    debug!(?settings, "settings");

    match args {
        Args::Controller(_) => {
            run_controller(settings).await?;
        }
        Args::Renew(_) => {
            let rdns = rdns_client(&settings).await?;
            let domain = rdns.renew_domain().await?;
            info!(fqdn = %domain.fqdn, "renewed domain");
        }
        Args::ShowDomain(_) => {
            let rdns = rdns_client(&settings).await?;
            match rdns.current_domain().await? {
                Some(domain) => print!("{}", serde_yaml::to_string(&domain)?),
                None => println!("no domain registered for this cluster"),
            }
        }
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn kube_client() -> Result<kube::Client> {
    kube::Client::try_default().await.wrap_err(
        "Error while initializing connection to the Kubernetes apiserver. This most likely means that the cluster is \
         misconfigured (e.g. it has invalid apiserver certificates or service accounts configuration)",
    )
}

async fn rdns_client(settings: &Settings) -> Result<RdnsClient> {
    let client = kube_client().await?;
    let store = Arc::new(SecretTokenStore::new(client));
    Ok(RdnsClient::new(settings, store)?)
}

async fn run_controller(mut settings: Settings) -> Result<()> {
    let client = kube_client().await?;

    if settings.cluster_id.is_none() {
        settings.cluster_id = lookup_cluster_id(client.clone())
            .await
            .wrap_err("Failed to read the cluster id from kube-system/cluster-info")?;
    }
    info!(fqdn = ?settings.requested_fqdn(), "requested fqdn for new domains");
    let settings = Arc::new(settings);

    let store = Arc::new(SecretTokenStore::new(client.clone()));
    let rdns = Arc::new(RdnsClient::new(&settings, store)?);
    let queue = Arc::new(ChangeQueue::new());
    let stop = CancellationToken::new();

    let context = Arc::new(Context {
        cluster: Arc::new(KubeCluster::new(client.clone())),
        rdns: rdns.clone(),
        settings: settings.clone(),
    });

    tokio::spawn(shutdown_on_signal(stop.clone()));

    let health = tokio::spawn({
        let stop = stop.clone();
        let listen = settings.listen;
        async move {
            let result = health::run_health_server(listen, stop.clone()).await;
            if let Err(err) = &result {
                error!("Health check server failed: {err}");
                stop.cancel();
            }
            result
        }
    });

    let renew = tokio::spawn(renew::run_renew_loop(rdns, settings.renew_interval, stop.clone()));

    let watcher = tokio::spawn(ResourceWatcher::new(client, settings.clone(), queue.clone()).run(stop.clone()));

    info!("Starting controller");

    Reconciler::new(context, queue).run().await;

    stop.cancel();
    let (watcher, renew, health) = tokio::join!(watcher, renew, health);
    watcher?;
    renew?;
    health?.wrap_err("health check server failed")?;

    info!("Controller stopped");

    Ok(())
}

async fn shutdown_on_signal(stop: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{
            signal,
            SignalKind,
        };
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    stop.cancel();
}

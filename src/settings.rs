use clap::{
    Parser,
    ValueEnum,
};
use eyre::{
    ensure,
    Context as _,
    Result,
};
use reqwest::Url;
use std::{
    net::SocketAddr,
    time::Duration,
};

pub const DEFAULT_ROOT_DOMAIN: &str = "rancher.io";
pub const DEFAULT_BASE_RDNS_URL: &str = "https://api.rdns.rancher.io/v1";

/// Where the addresses registered for the cluster domain come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum AddressSource {
    /// The load balancer status of each ingress object.
    #[default]
    LoadBalancer,
    /// The nodes running the managed ingress-nginx controller pods.
    ControllerNodes,
}

#[derive(Parser, Clone, Debug)]
pub struct SettingsArgs {
    #[clap(short, long, env = "RANCHER_DEBUG", help = "Enable debug logging")]
    pub debug: bool,

    #[clap(
        long,
        env = "RANCHER_SERVER_LISTEN",
        help = "Address the health check server listens on",
        default_value = "0.0.0.0:9595"
    )]
    pub listen: SocketAddr,

    #[clap(
        long,
        env = "RANCHER_ROOT_DOMAIN",
        help = "Root domain of the rdns service",
        default_value = DEFAULT_ROOT_DOMAIN
    )]
    pub root_domain: String,

    #[clap(
        long,
        env = "RANCHER_BASE_RDNS_URL",
        help = "Base url of the rdns api",
        default_value = DEFAULT_BASE_RDNS_URL
    )]
    pub base_rdns_url: String,

    #[clap(
        long,
        env = "RANCHER_RENEW_DURATION",
        help = "How often the domain is renewed",
        default_value = "24h",
        value_parser = humantime::parse_duration
    )]
    pub renew_duration: Duration,

    #[clap(
        long,
        env = "RANCHER_INGRESS_RESYNC_DURATION",
        help = "How often all watched objects are listed again",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub ingress_resync_duration: Duration,

    #[clap(
        long,
        env = "RANCHER_HTTP_TIMEOUT",
        help = "Timeout of a single rdns api request",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub http_timeout: Duration,

    #[clap(
        long,
        env = "RANCHER_WATCH_NAMESPACE",
        help = "Only watch ingresses in this namespace. Watches all namespaces if not set"
    )]
    pub watch_namespace: Option<String>,

    #[clap(
        long,
        env = "RANCHER_ADDRESS_SOURCE",
        help = "Where the registered addresses are taken from",
        value_enum,
        default_value_t = AddressSource::LoadBalancer
    )]
    pub address_source: AddressSource,

    #[clap(
        long,
        env = "RANCHER_CLUSTER_ID",
        help = "Request <cluster-id>.<root-domain> as fqdn when the domain is created. Read from the kube-system/cluster-info config map if not set"
    )]
    pub cluster_id: Option<String>,
}

/// Immutable runtime configuration, built once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub debug: bool,
    pub listen: SocketAddr,
    pub root_domain: String,
    pub base_rdns_url: Url,
    pub renew_interval: Duration,
    pub ingress_resync: Duration,
    pub http_timeout: Duration,
    pub watch_namespace: Option<String>,
    pub address_source: AddressSource,
    pub cluster_id: Option<String>,
    pub controller: ControllerSettings,
}

/// Identifies the ingress-nginx controller used by [`AddressSource::ControllerNodes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    pub namespace: String,
    pub deployment: String,
    pub pod_selector: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: "ingress-nginx".to_string(),
            deployment: "nginx-ingress-controller".to_string(),
            pod_selector: "app=ingress-nginx".to_string(),
        }
    }
}

impl TryFrom<SettingsArgs> for Settings {
    type Error = eyre::Report;

    fn try_from(args: SettingsArgs) -> Result<Self> {
        let SettingsArgs {
            debug,
            listen,
            root_domain,
            base_rdns_url,
            renew_duration,
            ingress_resync_duration,
            http_timeout,
            watch_namespace,
            address_source,
            cluster_id,
        } = args;

        let base_rdns_url = Url::parse(base_rdns_url.trim_end_matches('/'))
            .with_context(|| format!("invalid rdns base url {base_rdns_url:?}"))?;
        ensure!(
            matches!(base_rdns_url.scheme(), "http" | "https"),
            "rdns base url must be http or https, got {base_rdns_url}"
        );

        let root_domain = root_domain.trim_matches('.').to_string();
        ensure!(!root_domain.is_empty(), "root domain must not be empty");

        ensure!(!renew_duration.is_zero(), "renew duration must be greater than zero");
        ensure!(
            !ingress_resync_duration.is_zero(),
            "ingress resync duration must be greater than zero"
        );
        ensure!(!http_timeout.is_zero(), "http timeout must be greater than zero");

        Ok(Settings {
            debug,
            listen,
            root_domain,
            base_rdns_url,
            renew_interval: renew_duration,
            ingress_resync: ingress_resync_duration,
            http_timeout,
            watch_namespace: watch_namespace.filter(|ns| !ns.is_empty()),
            address_source,
            cluster_id: cluster_id.filter(|id| !id.is_empty()),
            controller: ControllerSettings::default(),
        })
    }
}

impl Settings {
    /// The fqdn asked for when a new domain is created, if a cluster id is configured.
    pub fn requested_fqdn(&self) -> Option<String> {
        self.cluster_id
            .as_ref()
            .map(|id| format!("{id}.{}", self.root_domain))
    }

    /// Base url without a trailing slash, ready for appending api paths.
    pub fn api_base(&self) -> String {
        self.base_rdns_url.as_str().trim_end_matches('/').to_string()
    }
}

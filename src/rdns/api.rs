use super::store::{
    DomainCredentials,
    TokenStore,
};
use crate::settings::Settings;
use reqwest::{
    Method,
    StatusCode,
};
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use std::{
    sync::Arc,
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum RdnsError {
    #[error("rdns api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rdns api rejected the request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("unable to decode rdns api response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("rdns api response has no domain data")]
    MissingData,
    #[error("no rdns token and fqdn stored for this cluster")]
    MissingCredentials,
    #[error("hosts must not be empty")]
    EmptyHosts,
    #[error("rdns credential store error: {0}")]
    Store(#[from] kube::Error),
}

/// A domain registered with the rdns api.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Request payload for creating and updating a domain.
#[derive(Debug, Serialize)]
struct DomainOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    fqdn: Option<&'a str>,
    hosts: &'a [String],
}

/// Wraps every rdns api response.
#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    data: Option<Domain>,
    #[serde(default)]
    message: String,
}

/// Client of the rdns domain api. Credentials live in the [`TokenStore`], never in the client.
pub struct RdnsClient {
    http: reqwest::Client,
    base_url: String,
    requested_fqdn: Option<String>,
    store: Arc<dyn TokenStore>,
}

impl RdnsClient {
    pub fn new(settings: &Settings, store: Arc<dyn TokenStore>) -> Result<Self, RdnsError> {
        Self::with_base_url(settings.api_base(), settings.http_timeout, store)
            .map(|client| client.requesting_fqdn(settings.requested_fqdn()))
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        timeout: Duration,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, RdnsError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            requested_fqdn: None,
            store,
        })
    }

    /// Ask for a specific fqdn when a new domain gets created.
    pub fn requesting_fqdn(mut self, fqdn: Option<String>) -> Self {
        self.requested_fqdn = fqdn;
        self
    }

    /// Makes sure the cluster domain points at `hosts` and returns its fqdn.
    ///
    /// Creates the domain if no credentials are stored yet. Otherwise the registered hosts are compared as a set and
    /// the domain is only updated if they differ.
    #[instrument(level = "debug", skip(self))]
    pub async fn apply_domain(&self, hosts: &[String]) -> Result<String, RdnsError> {
        let desired = normalize_hosts(hosts);
        if desired.is_empty() {
            return Err(RdnsError::EmptyHosts);
        }

        let Some(DomainCredentials { token, fqdn }) = self.store.get().await? else {
            debug!(?desired, "no fqdn registered yet, creating a new domain");
            let credentials = self.create_domain(&desired).await?;
            self.store.set(&credentials).await?;
            return Ok(credentials.fqdn);
        };

        let current = self.get_domain(&fqdn).await?;
        if normalize_hosts(&current.hosts) == desired {
            debug!(%fqdn, "domain has no changes, no need to update");
            return Ok(fqdn);
        }

        info!(%fqdn, from = ?current.hosts, to = ?desired, "updating domain hosts");
        self.update_domain(&token, &fqdn, &desired).await?;
        Ok(fqdn)
    }

    /// Renews the domain stored for this cluster.
    pub async fn renew_domain(&self) -> Result<Domain, RdnsError> {
        let Some(DomainCredentials { token, fqdn }) = self.store.get().await? else {
            return Err(RdnsError::MissingCredentials);
        };
        let url = format!("{}/domain/{fqdn}/renew", self.base_url);
        let res = self.request::<()>(Method::PUT, &url, None, Some(&token)).await?;
        res.data.ok_or(RdnsError::MissingData)
    }

    /// Looks up the domain stored for this cluster, if any.
    pub async fn current_domain(&self) -> Result<Option<Domain>, RdnsError> {
        match self.store.get().await? {
            Some(credentials) => self.get_domain(&credentials.fqdn).await.map(Some),
            None => Ok(None),
        }
    }

    // -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

    /// Registers a new domain. The returned credentials are not persisted.
    pub async fn create_domain(&self, hosts: &[String]) -> Result<DomainCredentials, RdnsError> {
        let url = format!("{}/domain", self.base_url);
        let body = DomainOptions {
            fqdn: self.requested_fqdn.as_deref(),
            hosts,
        };
        let res = self.request(Method::POST, &url, Some(body), None).await?;
        let data = res.data.ok_or(RdnsError::MissingData)?;
        info!(fqdn = %data.fqdn, hosts = ?data.hosts, "created domain");
        Ok(DomainCredentials {
            token: res.token,
            fqdn: data.fqdn,
        })
    }

    pub async fn get_domain(&self, fqdn: &str) -> Result<Domain, RdnsError> {
        let url = format!("{}/domain/{fqdn}", self.base_url);
        let res = self.request::<()>(Method::GET, &url, None, None).await?;
        res.data.ok_or(RdnsError::MissingData)
    }

    pub async fn update_domain(&self, token: &str, fqdn: &str, hosts: &[String]) -> Result<Domain, RdnsError> {
        let url = format!("{}/domain/{fqdn}", self.base_url);
        let body = DomainOptions { fqdn: None, hosts };
        let res = self.request(Method::PUT, &url, Some(body), Some(token)).await?;
        res.data.ok_or(RdnsError::MissingData)
    }

    pub async fn delete_domain(&self, fqdn: &str) -> Result<(), RdnsError> {
        let url = format!("{}/domain/{fqdn}", self.base_url);
        self.request::<()>(Method::DELETE, &url, None, None).await?;
        Ok(())
    }

    async fn request<B>(
        &self,
        method: Method,
        url: &str,
        body: Option<B>,
        token: Option<&str>,
    ) -> Result<ApiResponse, RdnsError>
    where
        B: Serialize,
    {
        trace!(%method, %url, "rdns api request");

        let req = self
            .http
            .request(method, url)
            .header("Content-Type", "application/json");
        let req = if let Some(token) = token { req.bearer_auth(token) } else { req };
        let req = if let Some(body) = body { req.json(&body) } else { req };

        let res = req.send().await?;
        let status = res.status();
        let text = res.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiResponse>(&text)
                .ok()
                .map(|body| body.message)
                .filter(|message| !message.is_empty())
                .unwrap_or(text);
            return Err(RdnsError::Rejected { status, message });
        }

        decode(&text)
    }
}

fn decode<R: DeserializeOwned + Default>(text: &str) -> Result<R, RdnsError> {
    if text.trim().is_empty() {
        return Ok(R::default());
    }
    serde_json::from_str(text).map_err(RdnsError::Decode)
}

/// Sorted and de-duplicated, so host lists can be compared as sets.
pub fn normalize_hosts(hosts: &[String]) -> Vec<String> {
    let mut hosts = hosts
        .iter()
        .map(|host| host.trim())
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    hosts.sort();
    hosts.dedup();
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn normalize_is_order_insensitive() {
        assert_eq!(
            normalize_hosts(&hosts(&["10.0.0.6", "10.0.0.5"])),
            normalize_hosts(&hosts(&["10.0.0.5", "10.0.0.6"]))
        );
    }

    #[test]
    fn normalize_drops_duplicates_and_blanks() {
        assert_eq!(
            normalize_hosts(&hosts(&["10.0.0.5", "", " 10.0.0.5 ", "10.0.0.1"])),
            hosts(&["10.0.0.1", "10.0.0.5"])
        );
    }

    #[test]
    fn decodes_envelope() {
        let res: ApiResponse =
            decode(r#"{"token":"t","data":{"fqdn":"abc.rancher.io","hosts":["1.2.3.4"]}}"#).unwrap();
        assert_eq!(res.token, "t");
        assert_eq!(
            res.data,
            Some(Domain {
                fqdn: "abc.rancher.io".to_string(),
                hosts: hosts(&["1.2.3.4"]),
            })
        );

        let empty: ApiResponse = decode("{}").unwrap();
        assert!(empty.data.is_none());

        assert!(matches!(decode::<ApiResponse>("<html>"), Err(RdnsError::Decode(_))));
    }
}

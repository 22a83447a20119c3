use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Secret,
    ByteString,
};
use kube::{
    api::{
        ObjectMeta,
        Patch,
        PatchParams,
    },
    Api,
};
use std::collections::BTreeMap;

const SECRET_NAMESPACE: &str = "kube-system";
const SECRET_NAME: &str = "rdns-token";
const TOKEN_KEY: &str = "token";
const FQDN_KEY: &str = "fqdn";

/// The token and fqdn handed out by the rdns api when the domain was created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainCredentials {
    pub token: String,
    pub fqdn: String,
}

/// Persists the domain credentials of this cluster.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Returns `None` if no complete credentials are stored.
    async fn get(&self) -> Result<Option<DomainCredentials>, kube::Error>;

    async fn set(&self, credentials: &DomainCredentials) -> Result<(), kube::Error>;
}

/// [`TokenStore`] backed by the `kube-system/rdns-token` secret.
pub struct SecretTokenStore {
    api: Api<Secret>,
}

impl SecretTokenStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::namespaced(client, SECRET_NAMESPACE),
        }
    }
}

#[async_trait]
impl TokenStore for SecretTokenStore {
    async fn get(&self) -> Result<Option<DomainCredentials>, kube::Error> {
        let Some(secret) = self.api.get_opt(SECRET_NAME).await? else {
            debug!("secret {SECRET_NAMESPACE}/{SECRET_NAME} does not exist yet");
            return Ok(None);
        };
        Ok(credentials_from_secret(&secret))
    }

    async fn set(&self, credentials: &DomainCredentials) -> Result<(), kube::Error> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(SECRET_NAME.to_string()),
                namespace: Some(SECRET_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(BTreeMap::from_iter(vec![
                (TOKEN_KEY.to_string(), credentials.token.clone()),
                (FQDN_KEY.to_string(), credentials.fqdn.clone()),
            ])),
            ..Default::default()
        };

        self.api
            .patch(SECRET_NAME, &PatchParams::apply("rdns.cattle.io"), &Patch::Apply(&secret))
            .await?;

        info!(fqdn = %credentials.fqdn, "saved rdns token and fqdn");
        Ok(())
    }
}

fn credentials_from_secret(secret: &Secret) -> Option<DomainCredentials> {
    let token = secret_value(secret, TOKEN_KEY)?;
    let fqdn = secret_value(secret, FQDN_KEY)?;
    if token.is_empty() || fqdn.is_empty() {
        return None;
    }
    Some(DomainCredentials { token, fqdn })
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(key).cloned())
        .or_else(|| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .and_then(decode_bytes)
        })
}

fn decode_bytes(bytes: &ByteString) -> Option<String> {
    match String::from_utf8(bytes.0.clone()) {
        Ok(value) => Some(value),
        Err(_) => {
            error!("rdns secret value is not valid utf8");
            None
        }
    }
}

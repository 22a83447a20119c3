pub mod api;
pub mod store;

pub use api::{
    Domain,
    RdnsClient,
    RdnsError,
};
pub use store::{
    DomainCredentials,
    SecretTokenStore,
    TokenStore,
};

use crate::{
    cluster::Cluster,
    rdns::RdnsClient,
    settings::Settings,
};
use std::sync::Arc;

/// Shared state handed to the reconciler.
pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub rdns: Arc<RdnsClient>,
    pub settings: Arc<Settings>,
}

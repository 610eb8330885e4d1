use crate::acl::AclPolicy;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HnsError {
    #[error("endpoint {0} not found")]
    EndpointNotFound(String),

    #[error("HNS call {operation} failed: {message}")]
    Api { operation: String, message: String },
}

/// Host network service calls the backend needs. The production binding
/// lives outside this crate.
pub trait HnsClient: Send + Sync {
    /// Id of the network with this name, if it exists.
    fn network_id(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<String>, HnsError>> + Send;

    fn endpoints(
        &self,
        network_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, HnsError>> + Send;

    fn endpoint_acls(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Vec<AclPolicy>, HnsError>> + Send;

    fn add_acls(
        &self,
        endpoint: &str,
        acls: &[AclPolicy],
    ) -> impl Future<Output = Result<(), HnsError>> + Send;

    fn remove_acls(
        &self,
        endpoint: &str,
        acls: &[AclPolicy],
    ) -> impl Future<Output = Result<(), HnsError>> + Send;
}

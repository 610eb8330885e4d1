pub mod acl;
pub mod client;
pub mod manager;

pub use acl::{AclAction, AclDirection, AclPolicy, AclTransaction, EndpointChange, EndpointPolicyBuilder};
pub use client::{HnsClient, HnsError};
pub use manager::HnsPolicyManager;

// Host network service backend sharing the dataplane contract

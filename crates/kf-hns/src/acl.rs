use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclDirection {
    In,
    Out,
}

/// One ACL entry on an endpoint. Several entries may share an id; together
/// they make up one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPolicy {
    pub id: String,
    pub action: AclAction,
    pub direction: AclDirection,
    pub priority: u16,
    #[serde(default)]
    pub protocols: String,
    #[serde(default)]
    pub local_addresses: String,
    #[serde(default)]
    pub remote_addresses: String,
    #[serde(default)]
    pub local_ports: String,
    #[serde(default)]
    pub remote_ports: String,
}

impl AclPolicy {
    pub fn new(id: &str, action: AclAction, direction: AclDirection, priority: u16) -> Self {
        Self {
            id: id.to_string(),
            action,
            direction,
            priority,
            protocols: String::new(),
            local_addresses: String::new(),
            remote_addresses: String::new(),
            local_ports: String::new(),
            remote_ports: String::new(),
        }
    }

    pub fn protocols(mut self, protocols: &str) -> Self {
        self.protocols = protocols.to_string();
        self
    }

    pub fn remote_addresses(mut self, addresses: &str) -> Self {
        self.remote_addresses = addresses.to_string();
        self
    }
}

/// Working copy of the ACLs on one endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointPolicyBuilder {
    acls: Vec<AclPolicy>,
}

impl EndpointPolicyBuilder {
    pub fn new(acls: Vec<AclPolicy>) -> Self {
        Self { acls }
    }

    pub fn add_policy(&mut self, acl: AclPolicy) {
        self.acls.push(acl);
    }

    pub fn acls(&self) -> &[AclPolicy] {
        &self.acls
    }

    /// Remove every ACL with `id` and return them. A count that differs from
    /// `expected` means the endpoint drifted; it is logged, not fatal.
    pub fn compare_and_remove_policies(&mut self, id: &str, expected: usize) -> Vec<AclPolicy> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.acls).into_iter().partition(|acl| acl.id == id);
        self.acls = kept;

        if removed.len() != expected {
            warn!(
                policy = id,
                expected,
                found = removed.len(),
                "unexpected number of ACLs for policy"
            );
        }
        removed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointChange {
    pub add: Vec<AclPolicy>,
    /// Policy id and the number of ACLs it is expected to have.
    pub remove: Vec<(String, usize)>,
}

/// ACL adds and removals for a set of endpoints, applied per endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclTransaction {
    endpoints: BTreeMap<String, EndpointChange>,
}

impl AclTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_acl(&mut self, endpoint: &str, acl: AclPolicy) -> &mut Self {
        self.endpoints
            .entry(endpoint.to_string())
            .or_default()
            .add
            .push(acl);
        self
    }

    pub fn remove_policy(&mut self, endpoint: &str, id: &str, expected: usize) -> &mut Self {
        self.endpoints
            .entry(endpoint.to_string())
            .or_default()
            .remove
            .push((id.to_string(), expected));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &EndpointChange)> {
        self.endpoints.iter().map(|(e, c)| (e.as_str(), c))
    }

    /// Every policy id added or removed.
    pub fn policy_ids(&self) -> impl Iterator<Item = &str> {
        self.endpoints.values().flat_map(|change| {
            change
                .add
                .iter()
                .map(|acl| acl.id.as_str())
                .chain(change.remove.iter().map(|(id, _)| id.as_str()))
        })
    }
}

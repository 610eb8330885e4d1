use crate::acl::{AclTransaction, EndpointPolicyBuilder};
use crate::client::{HnsClient, HnsError};
use kf_core::{DataplaneError, ErrorId, ErrorRecorder, HnsConfig, LogRecorder, PolicyBackend};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Host-network-service backend: policies are ACL entries on endpoints.
pub struct HnsPolicyManager<C> {
    client: C,
    config: HnsConfig,
    network_id: Option<String>,
    /// endpoint -> policy id -> expected ACL count, for removals that failed
    pending: BTreeMap<String, BTreeMap<String, usize>>,
    recorder: Arc<dyn ErrorRecorder>,
}

impl<C: HnsClient> HnsPolicyManager<C> {
    pub fn new(client: C, config: HnsConfig) -> Self {
        Self {
            client,
            config,
            network_id: None,
            pending: BTreeMap::new(),
            recorder: Arc::new(LogRecorder),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ErrorRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn network_id(&self) -> Option<&str> {
        self.network_id.as_deref()
    }

    /// Endpoints with removals waiting for the next reconcile.
    pub fn pending_endpoints(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }

    fn fail(&self, operation: &str, failures: Vec<String>) -> DataplaneError {
        let err = DataplaneError::Backend {
            operation: operation.to_string(),
            message: failures.join("; "),
        };
        self.recorder.record_error(ErrorId::Hns, &err.to_string());
        err
    }

    fn is_own(&self, policy_id: &str) -> bool {
        policy_id.starts_with(&self.config.policy_id_prefix)
    }

    async fn resolve_network(&mut self) -> Result<String, DataplaneError> {
        if let Some(id) = &self.network_id {
            return Ok(id.clone());
        }
        let name = self.config.network_name.clone();
        match self.client.network_id(&name).await {
            Ok(Some(id)) => {
                info!(network = %name, id = %id, "resolved HNS network");
                self.network_id = Some(id.clone());
                Ok(id)
            }
            Ok(None) => Err(self.fail("initialize", vec![format!("network {} not found", name)])),
            Err(e) => Err(self.fail("initialize", vec![e.to_string()])),
        }
    }

    pub async fn initialize(&mut self) -> Result<(), DataplaneError> {
        self.resolve_network().await.map(|_| ())
    }

    /// Remove every ACL carrying our policy id prefix from every endpoint.
    pub async fn reset(&mut self) -> Result<(), DataplaneError> {
        let network = self.resolve_network().await?;
        let endpoints = match self.client.endpoints(&network).await {
            Ok(endpoints) => endpoints,
            Err(e) => return Err(self.fail("reset", vec![e.to_string()])),
        };

        let mut failures = Vec::new();
        for endpoint in &endpoints {
            let acls = match self.client.endpoint_acls(endpoint).await {
                Ok(acls) => acls,
                Err(HnsError::EndpointNotFound(_)) => continue,
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };

            let own: Vec<_> = acls.into_iter().filter(|acl| self.is_own(&acl.id)).collect();
            if own.is_empty() {
                continue;
            }
            if let Err(e) = self.client.remove_acls(endpoint, &own).await {
                failures.push(e.to_string());
            } else {
                debug!(endpoint = %endpoint, acls = own.len(), "removed ACLs");
            }
        }

        self.pending.clear();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(self.fail("reset", failures))
        }
    }

    /// Retry removals that failed earlier.
    pub async fn reconcile(&mut self) -> Result<(), DataplaneError> {
        let pending = std::mem::take(&mut self.pending);
        let mut failures = Vec::new();

        for (endpoint, policies) in pending {
            let acls = match self.client.endpoint_acls(&endpoint).await {
                Ok(acls) => acls,
                Err(HnsError::EndpointNotFound(_)) => {
                    debug!(endpoint = %endpoint, "endpoint gone, dropping pending removals");
                    continue;
                }
                Err(e) => {
                    failures.push(e.to_string());
                    self.pending.insert(endpoint, policies);
                    continue;
                }
            };

            let mut builder = EndpointPolicyBuilder::new(acls);
            let removed: Vec<_> = policies
                .iter()
                .flat_map(|(id, expected)| builder.compare_and_remove_policies(id, *expected))
                .collect();
            if removed.is_empty() {
                continue;
            }
            if let Err(e) = self.client.remove_acls(&endpoint, &removed).await {
                failures.push(e.to_string());
                self.pending.insert(endpoint, policies);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(self.fail("reconcile", failures))
        }
    }

    /// Per endpoint: removals first, then adds.
    pub async fn apply_transaction(&mut self, tx: AclTransaction) -> Result<(), DataplaneError> {
        if let Some(id) = tx.policy_ids().find(|id| !self.is_own(id)) {
            return Err(DataplaneError::Backend {
                operation: "apply".to_string(),
                message: format!("policy id {} does not carry the configured prefix", id),
            });
        }

        let mut failures = Vec::new();
        for (endpoint, change) in tx.endpoints() {
            let acls = match self.client.endpoint_acls(endpoint).await {
                Ok(acls) => acls,
                Err(HnsError::EndpointNotFound(_)) => {
                    warn!(endpoint, "skipping ACL changes for missing endpoint");
                    continue;
                }
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };

            let mut builder = EndpointPolicyBuilder::new(acls);
            for (id, expected) in &change.remove {
                let removed = builder.compare_and_remove_policies(id, *expected);
                if removed.is_empty() {
                    continue;
                }
                if let Err(e) = self.client.remove_acls(endpoint, &removed).await {
                    failures.push(e.to_string());
                    self.pending
                        .entry(endpoint.to_string())
                        .or_default()
                        .insert(id.clone(), *expected);
                }
            }

            if !change.add.is_empty() {
                if let Err(e) = self.client.add_acls(endpoint, &change.add).await {
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(self.fail("apply", failures))
        }
    }
}

impl<C: HnsClient> PolicyBackend for HnsPolicyManager<C> {
    type Transaction = AclTransaction;

    fn name(&self) -> &'static str {
        "hns"
    }

    async fn initialize(&mut self) -> Result<(), DataplaneError> {
        HnsPolicyManager::initialize(self).await
    }

    async fn reset(&mut self) -> Result<(), DataplaneError> {
        HnsPolicyManager::reset(self).await
    }

    async fn reconcile(&mut self) -> Result<(), DataplaneError> {
        HnsPolicyManager::reconcile(self).await
    }

    async fn apply_transaction(&mut self, transaction: AclTransaction) -> Result<(), DataplaneError> {
        HnsPolicyManager::apply_transaction(self, transaction).await
    }
}

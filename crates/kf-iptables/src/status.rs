use crate::exec::CommandExecutor;
use crate::manager::PolicyManager;
use anyhow::{Context, Result};
use kf_core::DataplaneStatus;

impl<E: CommandExecutor> PolicyManager<E> {
    /// Read-only snapshot of the jump rule and chains. Never mutates.
    pub async fn status(&self) -> Result<DataplaneStatus> {
        let iptables = &self.config.iptables;
        let positioner = self.positioner();

        let jump_line = positioner
            .line_number(&self.config.chains.top_level)
            .await
            .with_context(|| format!("Failed to list {} chain", iptables.shared_chain))?;
        let services_line = positioner
            .line_number(&iptables.services_chain)
            .await
            .with_context(|| format!("Failed to list {} chain", iptables.shared_chain))?;
        let policy_chains = self
            .policy_chain_names()
            .await
            .context("Failed to discover policy chains")?;

        Ok(DataplaneStatus {
            backend: "iptables".to_string(),
            shared_chain: iptables.shared_chain.clone(),
            jump_line,
            services_chain: iptables.services_chain.clone(),
            services_line,
            policy_chains,
            stale_chains: self.stale.iter().map(String::from).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::manager::PolicyManager;
    use crate::testing::FakeIptables;
    use kf_core::DataplaneConfig;

    #[tokio::test]
    async fn status_reports_ordering() {
        let fake = FakeIptables::new()
            .with_chain("KFENCE-EGRESS-4")
            .with_services_jump();
        let mut manager = PolicyManager::new(fake.clone(), DataplaneConfig::default());
        manager.initialize().await.unwrap();

        fake.clear_calls();
        let status = manager.status().await.unwrap();

        assert_eq!(status.jump_line, 2);
        assert_eq!(status.services_line, 1);
        assert!(status.ordering_ok());
        assert_eq!(status.policy_chains, vec!["KFENCE-EGRESS-4"]);
        assert!(status.stale_chains.is_empty());
        assert!(fake.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn status_before_initialize() {
        let fake = FakeIptables::new();
        let manager = PolicyManager::new(fake, DataplaneConfig::default());

        let status = manager.status().await.unwrap();
        assert!(!status.jump_present());
        assert!(!status.ordering_ok());
    }

    #[tokio::test]
    async fn status_propagates_listing_failures() {
        let fake = FakeIptables::new();
        fake.fail_on("-L", 4);
        let manager = PolicyManager::new(fake, DataplaneConfig::default());

        let err = manager.status().await.unwrap_err();
        assert!(err.to_string().contains("FORWARD"));
    }
}

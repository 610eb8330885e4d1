use crate::exec::{CommandExecutor, DELETE_FLAG, DESTROY_FLAG, IptablesRunner, SystemExecutor};
use crate::position::{ChainPositioner, PositionOutcome};
use crate::restore::{RestoreTransaction, rule_args};
use crate::stale::StaleChains;
use kf_core::{
    ChainFailure, CleanupError, CommandError, DataplaneConfig, DataplaneError, ErrorId,
    ErrorRecorder, ExitCode, LogRecorder, PolicyBackend, PositioningError,
};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static CHAIN_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Chain\s+(\S+)").expect("static regex"));

/// Owns the engine's chains in one iptables table.
///
/// Every mutating operation takes `&mut self`; callers serialize them.
pub struct PolicyManager<E = SystemExecutor> {
    pub(crate) config: DataplaneConfig,
    pub(crate) runner: IptablesRunner<E>,
    pub(crate) stale: StaleChains,
    recorder: Arc<dyn ErrorRecorder>,
}

impl PolicyManager<SystemExecutor> {
    pub fn system(config: DataplaneConfig) -> Self {
        Self::new(SystemExecutor, config)
    }
}

impl<E: CommandExecutor> PolicyManager<E> {
    pub fn new(executor: E, config: DataplaneConfig) -> Self {
        Self {
            runner: IptablesRunner::new(executor, &config.iptables),
            config,
            stale: StaleChains::new(),
            recorder: Arc::new(LogRecorder),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ErrorRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    pub fn stale_chains(&self) -> &StaleChains {
        &self.stale
    }

    /// Empty transaction for the managed table.
    pub fn new_transaction(&self) -> RestoreTransaction {
        RestoreTransaction::new(&self.config.iptables.table)
    }

    pub(crate) fn positioner(&self) -> ChainPositioner<'_, E> {
        ChainPositioner::new(
            &self.runner,
            &self.config.iptables.shared_chain,
            &self.config.iptables.services_chain,
            &self.config.chains.top_level,
        )
    }

    fn record(&self, id: ErrorId, err: &dyn std::error::Error) {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        self.recorder.record_error(id, &message);
    }

    /// Fixed chains with their baseline rules.
    pub fn init_transaction(&self) -> RestoreTransaction {
        let chains = &self.config.chains;
        let marks = &self.config.marks;
        let mut tx = self.new_transaction();

        for chain in chains.fixed() {
            tx.declare_chain(chain);
        }

        tx.append(&chains.top_level, rule_args(&["-j", chains.ingress.as_str()]))
            .append(&chains.top_level, rule_args(&["-j", chains.egress.as_str()]))
            .append(&chains.top_level, rule_args(&["-j", chains.accept.as_str()]));

        tx.append(
            &chains.ingress,
            with_comment(
                &["-j", "DROP", "-m", "mark", "--mark", marks.ingress_drop.as_str()],
                &format!("DROP-ON-INGRESS-DROP-MARK-{}", marks.ingress_drop),
            ),
        );

        tx.append(
            &chains.ingress_allow_mark,
            with_comment(
                &["-j", "MARK", "--set-mark", marks.ingress_allow.as_str()],
                &format!("SET-INGRESS-ALLOW-MARK-{}", marks.ingress_allow),
            ),
        )
        .append(&chains.ingress_allow_mark, rule_args(&["-j", chains.egress.as_str()]));

        tx.append(
            &chains.egress,
            with_comment(
                &["-j", "DROP", "-m", "mark", "--mark", marks.egress_drop.as_str()],
                &format!("DROP-ON-EGRESS-DROP-MARK-{}", marks.egress_drop),
            ),
        )
        .append(
            &chains.egress,
            with_comment(
                &["-j", chains.accept.as_str(), "-m", "mark", "--mark", marks.ingress_allow.as_str()],
                &format!("ACCEPT-ON-INGRESS-ALLOW-MARK-{}", marks.ingress_allow),
            ),
        );

        tx.append(
            &chains.accept,
            with_comment(
                &["-j", "MARK", "--set-mark", marks.clear.as_str()],
                &format!("CLEAR-{}-MARKS", chains.top_level),
            ),
        )
        .append(&chains.accept, rule_args(&["-j", "ACCEPT"]));

        tx
    }

    pub async fn initialize(&mut self) -> Result<(), DataplaneError> {
        info!(chain = %self.config.chains.top_level, "initializing chains");

        let tx = self.init_transaction();
        if let Err(source) = self.runner.restore(&tx.render()).await {
            let err = tx.failure(source);
            self.record(ErrorId::ChainInit, &err);
            return Err(DataplaneError::ChainInit(err));
        }

        self.position_jump()
            .await
            .map_err(DataplaneError::JumpReposition)?;
        Ok(())
    }

    /// Place the jump rule below the services jump, repairing it if needed.
    pub async fn position_jump(&self) -> Result<PositionOutcome, PositioningError> {
        match self.positioner().position().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.record(ErrorId::JumpReposition, &err);
                Err(err)
            }
        }
    }

    /// Remove the jump rule and every chain this engine has ever owned.
    pub async fn reset(&mut self) -> Result<(), DataplaneError> {
        let shared_chain = self.config.iptables.shared_chain.clone();
        let mut jump = vec![shared_chain.clone()];
        jump.extend(self.positioner().jump_rule());

        match self.runner.run(DELETE_FLAG, &jump).await {
            Ok(()) => info!(chain = %shared_chain, "deleted jump rule"),
            Err(e)
                if matches!(
                    e.exit_code(),
                    Some(ExitCode::DoesNotExist | ExitCode::CouldntLoadTarget)
                ) =>
            {
                debug!(chain = %shared_chain, "jump rule already absent");
            }
            Err(source) => {
                let err = DataplaneError::JumpRemoval {
                    chain: shared_chain,
                    source,
                };
                self.record(ErrorId::JumpRemoval, &err);
                return Err(err);
            }
        }

        let mut chains = self.config.chains.fixed_and_deprecated();
        match self.policy_chain_names().await {
            Ok(policy_chains) => {
                for chain in policy_chains {
                    if !chains.contains(&chain) {
                        chains.push(chain);
                    }
                }
            }
            // still flush what we know statically
            Err(err) => {
                self.record(ErrorId::PolicyChainDiscovery, &err);
                warn!(error = %err, "could not discover policy chains to remove");
            }
        }

        let mut tx = self.new_transaction();
        for chain in &chains {
            tx.declare_chain(chain);
        }
        if let Err(source) = self.runner.restore(&tx.render()).await {
            let err = tx.failure(source);
            self.record(ErrorId::ChainFlush, &err);
            return Err(DataplaneError::Flush(err));
        }

        // the flush declared every chain, so any destroy failure is real;
        // exit code 1 here also covers chains that are still referenced
        let mut failures = Vec::new();
        for chain in &chains {
            match self.runner.run(DESTROY_FLAG, std::slice::from_ref(chain)).await {
                Ok(()) => {}
                Err(source) => {
                    info!(chain = %chain, error = %source, "couldn't delete chain");
                    failures.push(ChainFailure {
                        chain: chain.clone(),
                        source,
                    });
                }
            }
        }

        // every chain is flushed at this point, so nothing stale can hold rules
        self.stale.clear();

        if failures.is_empty() {
            info!(chains = chains.len(), "removed all chains");
            Ok(())
        } else {
            let err = CleanupError { failures };
            self.record(ErrorId::ChainCleanup, &err);
            Err(err.into())
        }
    }

    /// Repair the jump position, then destroy chains retired earlier.
    ///
    /// Cleanup runs even when positioning fails; the positioning error wins.
    pub async fn reconcile(&mut self) -> Result<(), DataplaneError> {
        let positioned = self.position_jump().await;

        let chains = self.stale.drain();
        let cleaned = if chains.is_empty() {
            Ok(())
        } else {
            self.cleanup_chains(&chains).await
        };

        match (positioned, cleaned) {
            (Err(err), _) => Err(err.into()),
            (Ok(_), Err(err)) => Err(err.into()),
            (Ok(outcome), Ok(())) => {
                debug!(?outcome, cleaned = chains.len(), "reconciled");
                Ok(())
            }
        }
    }

    /// Destroy `chains` one by one. Missing chains count as destroyed;
    /// anything else goes back into the stale set for the next pass.
    pub async fn cleanup_chains(&mut self, chains: &[String]) -> Result<(), CleanupError> {
        let mut failures = Vec::new();

        for chain in chains {
            if !self.config.chains.is_owned(chain) {
                warn!(chain = %chain, "not cleaning up chain that is not ours");
                continue;
            }
            match self.runner.run(DESTROY_FLAG, std::slice::from_ref(chain)).await {
                Ok(()) => debug!(chain = %chain, "deleted stale chain"),
                Err(e) if e.is_not_found() => debug!(chain = %chain, "stale chain already gone"),
                Err(source) => {
                    self.stale.add(chain);
                    failures.push(ChainFailure {
                        chain: chain.clone(),
                        source,
                    });
                }
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        let err = CleanupError { failures };
        self.record(ErrorId::ChainCleanup, &err);
        Err(err)
    }

    /// Per-policy chains currently present in the table.
    pub async fn policy_chain_names(&self) -> Result<Vec<String>, CommandError> {
        let chains = &self.config.chains;
        let pattern = format!(
            "Chain {}-\\|Chain {}-",
            chains.ingress_policy_prefix, chains.egress_policy_prefix
        );
        let listing = self.runner.list_command(None);

        let Some(output) = self.runner.grep(&listing, &pattern).await? else {
            return Ok(vec![]);
        };

        let mut names: Vec<String> = Vec::new();
        for line in output.lines() {
            let Some(cap) = CHAIN_HEADER.captures(line) else {
                warn!(line, "unexpected line in policy chain listing");
                continue;
            };
            let name = &cap[1];
            if chains.is_policy_chain(name) && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Apply one policy change atomically.
    ///
    /// Only the fixed chains and our own policy chains may appear in the
    /// transaction. After a successful apply, declared chains leave the stale
    /// set and retired ones join it.
    pub async fn apply_transaction(&mut self, tx: RestoreTransaction) -> Result<(), DataplaneError> {
        let chains = &self.config.chains;
        if let Some(foreign) = tx
            .touched_chains()
            .find(|c| !chains.is_fixed(c) && !chains.is_policy_chain(c))
        {
            return Err(DataplaneError::ForeignChain(foreign.to_string()));
        }
        if let Some(fixed) = tx.retired().iter().find(|c| !chains.is_policy_chain(c)) {
            return Err(DataplaneError::ForeignChain(fixed.clone()));
        }

        if tx.is_empty() {
            debug!("skipping empty transaction");
            return Ok(());
        }

        if let Err(source) = self.runner.restore(&tx.render()).await {
            let err = tx.failure(source);
            self.record(ErrorId::TransactionApply, &err);
            return Err(DataplaneError::Apply(err));
        }

        for chain in tx.chains() {
            self.stale.remove(chain);
        }
        for chain in tx.retired() {
            self.stale.add(chain);
        }
        info!(
            lines = tx.len(),
            retired = tx.retired().len(),
            "applied policy transaction"
        );
        Ok(())
    }

    /// Apply `tx` and destroy the chains it retires right away.
    ///
    /// For one-shot callers whose stale set does not outlive the process.
    /// Chains that fail to destroy stay in the stale set.
    pub async fn apply_and_cleanup(&mut self, tx: RestoreTransaction) -> Result<(), DataplaneError> {
        let retired = tx.retired().to_vec();
        self.apply_transaction(tx).await?;
        if retired.is_empty() {
            return Ok(());
        }

        for chain in &retired {
            self.stale.remove(chain);
        }
        self.cleanup_chains(&retired).await?;
        Ok(())
    }

    #[cfg(feature = "reboot")]
    pub async fn reboot(&mut self) -> Result<(), DataplaneError> {
        self.reset().await?;
        self.initialize().await
    }

    #[cfg(not(feature = "reboot"))]
    pub async fn reboot(&mut self) -> Result<(), DataplaneError> {
        info!("reboot is disabled in this build, leaving chains untouched");
        Ok(())
    }
}

fn with_comment(args: &[&str], comment: &str) -> Vec<String> {
    let mut rule = rule_args(args);
    rule.extend(rule_args(&["-m", "comment", "--comment", comment]));
    rule
}

impl<E: CommandExecutor> PolicyBackend for PolicyManager<E> {
    type Transaction = RestoreTransaction;

    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn initialize(&mut self) -> Result<(), DataplaneError> {
        PolicyManager::initialize(self).await
    }

    async fn reset(&mut self) -> Result<(), DataplaneError> {
        PolicyManager::reset(self).await
    }

    async fn reconcile(&mut self) -> Result<(), DataplaneError> {
        PolicyManager::reconcile(self).await
    }

    async fn apply_transaction(&mut self, transaction: RestoreTransaction) -> Result<(), DataplaneError> {
        PolicyManager::apply_transaction(self, transaction).await
    }
}

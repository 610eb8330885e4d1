pub mod exec;
pub mod manager;
pub mod position;
pub mod restore;
pub mod stale;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use exec::{CommandExecutor, CommandSpec, IptablesRunner, SystemExecutor};
pub use manager::PolicyManager;
pub use position::{ChainPositioner, PositionOutcome};
pub use restore::{Directive, PolicyChange, RestoreTransaction};
pub use stale::StaleChains;

// iptables backend: chain lifecycle, jump positioning and atomic restores

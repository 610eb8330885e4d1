use std::fmt;
use thiserror::Error;

/// Non-zero exit codes of the iptables family of tools.
///
/// The values are the tools' own convention and callers branch on them:
/// `DoesNotExist` is a normal negative answer for check/delete/destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// 1: bad rule (does a matching rule exist in that chain?) or no
    /// chain/target/match by that name.
    DoesNotExist,
    /// 2: couldn't load target, i.e. the jump target chain is missing.
    CouldntLoadTarget,
    Other(i32),
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::DoesNotExist => 1,
            ExitCode::CouldntLoadTarget => 2,
            ExitCode::Other(code) => code,
        }
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        match code {
            1 => ExitCode::DoesNotExist,
            2 => ExitCode::CouldntLoadTarget,
            other => ExitCode::Other(other),
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::DoesNotExist => write!(f, "1 (does not exist)"),
            ExitCode::CouldntLoadTarget => write!(f, "2 (couldn't load target)"),
            ExitCode::Other(code) => write!(f, "{}", code),
        }
    }
}

/// Failure of a single external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start [{command}]: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run command [{command}] exit code {code} Stderr: [{output}]")]
    Exit {
        command: String,
        code: ExitCode,
        output: String,
    },

    #[error("command [{command}] was terminated by a signal")]
    Signal { command: String },
}

impl CommandError {
    pub fn exit_code(&self) -> Option<ExitCode> {
        match self {
            CommandError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the tool reported that the rule or chain is absent.
    pub fn is_not_found(&self) -> bool {
        self.exit_code() == Some(ExitCode::DoesNotExist)
    }
}

/// The atomic restore was rejected. Nothing from it was applied.
#[derive(Debug, Error)]
#[error("failed to restore {directives} line(s){}", describe_line(.failed_line, .failed_directive))]
pub struct TransactionError {
    pub directives: usize,
    /// 1-based line of the restore program the tool blamed, if it said so.
    pub failed_line: Option<usize>,
    pub failed_directive: Option<String>,
    #[source]
    pub source: CommandError,
}

fn describe_line(line: &Option<usize>, directive: &Option<String>) -> String {
    match (line, directive) {
        (Some(line), Some(directive)) => format!(", line {} failed: {}", line, directive),
        (Some(line), None) => format!(", line {} failed", line),
        _ => String::new(),
    }
}

/// A sub-step of jump rule positioning failed.
#[derive(Debug, Error)]
pub enum PositioningError {
    #[error("failed to get line number of jump from {shared_chain} chain to {chain} chain")]
    LineLookup {
        shared_chain: String,
        chain: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to check if jump to {chain} chain exists")]
    Check {
        chain: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to insert jump to {chain} chain at line {index}")]
    Insert {
        chain: String,
        index: usize,
        #[source]
        source: CommandError,
    },

    #[error("failed to delete misplaced jump to {chain} chain")]
    Delete {
        chain: String,
        #[source]
        source: CommandError,
    },

    #[error("after deleting, failed to insert jump to {chain} chain at line {index}")]
    Reinsert {
        chain: String,
        index: usize,
        #[source]
        source: CommandError,
    },
}

impl PositioningError {
    pub fn command_error(&self) -> &CommandError {
        match self {
            PositioningError::LineLookup { source, .. }
            | PositioningError::Check { source, .. }
            | PositioningError::Insert { source, .. }
            | PositioningError::Delete { source, .. }
            | PositioningError::Reinsert { source, .. } => source,
        }
    }
}

#[derive(Debug)]
pub struct ChainFailure {
    pub chain: String,
    pub source: CommandError,
}

/// One or more chains could not be destroyed. Every failed chain is listed.
#[derive(Debug, Error)]
#[error("failed to clean up {} chain(s): {}", .failures.len(), describe_failures(.failures))]
pub struct CleanupError {
    pub failures: Vec<ChainFailure>,
}

impl CleanupError {
    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.chain.as_str())
    }
}

fn describe_failures(failures: &[ChainFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.chain, f.source))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("failed to initialize chains")]
    ChainInit(#[source] TransactionError),

    /// Chains exist but traffic is not routed into them yet. Retry the
    /// positioning (reconcile does), not the whole initialization.
    #[error("chains were created but the jump rule could not be positioned")]
    JumpReposition(#[source] PositioningError),

    #[error(transparent)]
    Positioning(#[from] PositioningError),

    #[error("failed to delete jump from {chain} chain")]
    JumpRemoval {
        chain: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to flush chains")]
    Flush(#[source] TransactionError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("failed to apply policy transaction")]
    Apply(#[source] TransactionError),

    #[error("refusing to modify chain {0} which is not owned by this engine")]
    ForeignChain(String),

    #[error("{operation} failed: {message}")]
    Backend { operation: String, message: String },
}

impl DataplaneError {
    /// Whether running the same operation again later may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DataplaneError::ForeignChain(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(code: i32) -> CommandError {
        CommandError::Exit {
            command: "iptables -w 60 -X KFENCE-INGRESS-1".into(),
            code: code.into(),
            output: "iptables: No chain/target/match by that name.".into(),
        }
    }

    #[test]
    fn exit_codes_keep_their_meaning() {
        assert_eq!(ExitCode::from(1), ExitCode::DoesNotExist);
        assert_eq!(ExitCode::from(2), ExitCode::CouldntLoadTarget);
        assert_eq!(ExitCode::from(4), ExitCode::Other(4));
        assert_eq!(ExitCode::CouldntLoadTarget.code(), 2);
    }

    #[test]
    fn only_does_not_exist_is_not_found() {
        assert!(exit(1).is_not_found());
        assert!(!exit(2).is_not_found());
        assert!(!exit(4).is_not_found());
        assert!(
            !CommandError::Signal {
                command: "iptables".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn transaction_error_names_failed_line() {
        let err = TransactionError {
            directives: 3,
            failed_line: Some(4),
            failed_directive: Some("-A KFENCE -j KFENCE-INGRESS".into()),
            source: exit(1),
        };
        assert_eq!(
            err.to_string(),
            "failed to restore 3 line(s), line 4 failed: -A KFENCE -j KFENCE-INGRESS"
        );
    }

    #[test]
    fn cleanup_error_lists_every_chain() {
        let err = CleanupError {
            failures: vec![
                ChainFailure {
                    chain: "KFENCE-INGRESS-1".into(),
                    source: exit(4),
                },
                ChainFailure {
                    chain: "KFENCE-EGRESS-2".into(),
                    source: exit(4),
                },
            ],
        };
        let chains: Vec<_> = err.chains().collect();
        assert_eq!(chains, vec!["KFENCE-INGRESS-1", "KFENCE-EGRESS-2"]);
        assert!(err.to_string().starts_with("failed to clean up 2 chain(s): KFENCE-INGRESS-1"));
    }
}

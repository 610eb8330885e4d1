use std::fmt;

/// Stable identifiers for the failure classes reported to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorId {
    ChainInit,
    JumpReposition,
    JumpRemoval,
    ChainFlush,
    ChainCleanup,
    PolicyChainDiscovery,
    TransactionApply,
    Hns,
}

impl ErrorId {
    pub const ALL: [ErrorId; 8] = [
        ErrorId::ChainInit,
        ErrorId::JumpReposition,
        ErrorId::JumpRemoval,
        ErrorId::ChainFlush,
        ErrorId::ChainCleanup,
        ErrorId::PolicyChainDiscovery,
        ErrorId::TransactionApply,
        ErrorId::Hns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorId::ChainInit => "chain_init",
            ErrorId::JumpReposition => "jump_reposition",
            ErrorId::JumpRemoval => "jump_removal",
            ErrorId::ChainFlush => "chain_flush",
            ErrorId::ChainCleanup => "chain_cleanup",
            ErrorId::PolicyChainDiscovery => "policy_chain_discovery",
            ErrorId::TransactionApply => "transaction_apply",
            ErrorId::Hns => "hns",
        }
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for error events. The dataplane only calls this; the backend that
/// stores or exports the events lives elsewhere.
pub trait ErrorRecorder: Send + Sync {
    fn record_error(&self, id: ErrorId, message: &str);
}

/// Recorder that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecorder;

impl ErrorRecorder for LogRecorder {
    fn record_error(&self, id: ErrorId, message: &str) {
        tracing::error!(error_id = %id, "{}", message);
    }
}

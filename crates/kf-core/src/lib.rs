pub mod backend;
pub mod config;
pub mod error;
pub mod status;
pub mod telemetry;
pub mod validator;

pub use backend::PolicyBackend;
pub use config::{ChainNames, DataplaneConfig, HnsConfig, IptablesConfig, MarkConfig};
pub use error::{
    ChainFailure, CleanupError, CommandError, DataplaneError, ExitCode, PositioningError,
    TransactionError,
};
pub use status::DataplaneStatus;
pub use telemetry::{ErrorId, ErrorRecorder, LogRecorder};
pub use validator::{ConfigValidator, ValidationWarning};

use crate::error::DataplaneError;
use std::future::Future;

/// Contract shared by every dataplane backend.
///
/// Mutating operations take `&mut self`: callers must serialize them, and a
/// reconciliation pass must never overlap an apply.
pub trait PolicyBackend {
    /// A complete, backend-specific description of one policy change.
    type Transaction;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn initialize(&mut self) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    fn reset(&mut self) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    fn reconcile(&mut self) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    fn apply_transaction(
        &mut self,
        transaction: Self::Transaction,
    ) -> impl Future<Output = Result<(), DataplaneError>> + Send;
}

use thiserror::Error;

use crate::types::JobId;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — the caller can fix it; surfaced as-is
/// - `Retryable`   — the session layer SHOULD restart the transaction
/// - `Transient`   — timeout, lost notification, SQL hiccup; retry after back-off
/// - `InternalBug` — should never happen; logged with full state before surfacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    /// A blocking operation was aborted because its cancellation token fired.
    /// Propagated as-is through every layer.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    /// The transaction was used in an impossible state, or `commit` was
    /// called with unflushed statement writes. Signals a programming bug in
    /// the session layer, never user input.
    #[error("invalid transaction")]
    InvalidTransaction,

    /// The KV layer asks for the whole transaction to be restarted.
    #[error("transaction retryable: {0}")]
    Retryable(String),

    /// Timestamp acquisition failed while promoting a pending transaction.
    #[error("wait timestamp future failed: {0}")]
    FutureWait(String),

    /// Pessimistic lock acquisition failed in the KV layer.
    #[error("lock keys failed: {0}")]
    LockFailed(String),
}

/// DDL dispatcher / job store errors.
#[derive(Error, Debug)]
pub enum DdlError {
    /// The reorg progress record for this job does not exist. Callers may
    /// treat this as "no prior progress".
    #[error("reorg handle not found for {0}")]
    ReorgHandleMissing(JobId),

    /// Any SQL error during candidate scanning. The dispatcher logs it and
    /// retries on the next wakeup.
    #[error("job selection failed: {0}")]
    JobSelection(String),

    /// SQL execution against the internal session failed.
    #[error("internal sql failed: {0}")]
    Sql(String),

    /// Legacy meta (KV queue) operation failed during migration.
    #[error("meta operation failed: {0}")]
    Meta(String),

    /// The node lost ownership mid-operation.
    #[error("not the DDL owner")]
    NotOwner,

    #[error("job meta codec failed: {0}")]
    Codec(String),
}

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Txn(TxnError::InvalidTransaction) => ErrorKind::InternalBug,
            KestrelError::Txn(TxnError::Retryable(_)) => ErrorKind::Retryable,
            KestrelError::Txn(TxnError::FutureWait(_)) => ErrorKind::Transient,
            KestrelError::Txn(TxnError::LockFailed(_)) => ErrorKind::Retryable,

            KestrelError::Ddl(DdlError::ReorgHandleMissing(_)) => ErrorKind::UserError,
            KestrelError::Ddl(DdlError::JobSelection(_)) => ErrorKind::Transient,
            KestrelError::Ddl(DdlError::Sql(_)) => ErrorKind::Transient,
            KestrelError::Ddl(DdlError::Meta(_)) => ErrorKind::Transient,
            KestrelError::Ddl(DdlError::NotOwner) => ErrorKind::Retryable,
            KestrelError::Ddl(DdlError::Codec(_)) => ErrorKind::InternalBug,

            // Cancellation is terminal for the operation; callers stop, not retry.
            KestrelError::Cancelled => ErrorKind::UserError,

            KestrelError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the session layer should restart the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a transient error worth retrying after back-off.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if this is an internal bug that should never occur.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, KestrelError::Cancelled)
    }

    /// Add context to the message, preserving classification where the
    /// variant carries a string.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            KestrelError::Internal(msg) => KestrelError::Internal(format!("{ctx}: {msg}")),
            KestrelError::Txn(TxnError::Retryable(msg)) => {
                KestrelError::Txn(TxnError::Retryable(format!("{ctx}: {msg}")))
            }
            KestrelError::Txn(TxnError::FutureWait(msg)) => {
                KestrelError::Txn(TxnError::FutureWait(format!("{ctx}: {msg}")))
            }
            KestrelError::Ddl(DdlError::Sql(msg)) => {
                KestrelError::Ddl(DdlError::Sql(format!("{ctx}: {msg}")))
            }
            KestrelError::Ddl(DdlError::JobSelection(msg)) => {
                KestrelError::Ddl(DdlError::JobSelection(format!("{ctx}: {msg}")))
            }
            KestrelError::Ddl(DdlError::Meta(msg)) => {
                KestrelError::Ddl(DdlError::Meta(format!("{ctx}: {msg}")))
            }
            other => other,
        }
    }

    /// Emit a structured log entry for InternalBug errors. Must be called
    /// before surfacing an InternalBug to the caller.
    pub fn log_if_bug(&self, component: &'static str) {
        if self.is_internal_bug() {
            tracing::error!(component, error = %self, "internal bug surfaced");
        }
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `some_result.ctx("stage=dispatch")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> KestrelResult<T>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> KestrelResult<T>;
}

impl<T, E: Into<KestrelError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> KestrelResult<T> {
        self.map_err(|e| e.into().with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> KestrelResult<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod error_classification {
    use super::*;

    #[test]
    fn test_invalid_transaction_is_internal_bug() {
        let e = KestrelError::Txn(TxnError::InvalidTransaction);
        assert_eq!(e.kind(), ErrorKind::InternalBug);
        assert!(e.is_internal_bug());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_txn_retryable_is_retryable() {
        let e = KestrelError::Txn(TxnError::Retryable("write conflict".into()));
        assert_eq!(e.kind(), ErrorKind::Retryable);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_future_wait_is_transient() {
        let e = KestrelError::Txn(TxnError::FutureWait("tso unavailable".into()));
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_transient());
    }

    #[test]
    fn test_job_selection_is_transient() {
        let e = KestrelError::Ddl(DdlError::JobSelection("scan failed".into()));
        assert_eq!(e.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_reorg_handle_missing_is_user_error() {
        let e = KestrelError::Ddl(DdlError::ReorgHandleMissing(JobId(7)));
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(e.to_string().contains("job:7"));
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let e = KestrelError::Cancelled;
        assert!(e.is_cancelled());
        assert!(!e.is_retryable());
        assert!(!e.is_transient());
    }

    #[test]
    fn test_with_context_preserves_classification() {
        let e = KestrelError::Txn(TxnError::Retryable("conflict".into()));
        let e2 = e.with_context("stage=commit");
        assert_eq!(e2.kind(), ErrorKind::Retryable);
        assert!(e2.to_string().contains("stage=commit"));
        assert!(e2.to_string().contains("conflict"));
    }

    #[test]
    fn test_with_context_noop_on_unit_variants() {
        let e = KestrelError::Txn(TxnError::InvalidTransaction);
        let e2 = e.with_context("anything");
        assert!(matches!(e2, KestrelError::Txn(TxnError::InvalidTransaction)));
    }

    #[test]
    fn test_error_context_trait() {
        let result: Result<(), DdlError> = Err(DdlError::Sql("syntax".into()));
        let err = result.ctx("label=insert_job").unwrap_err();
        assert!(err.to_string().contains("label=insert_job"));
    }

    #[test]
    fn test_error_context_ok_passthrough() {
        let result: Result<i32, TxnError> = Ok(42);
        assert_eq!(result.ctx("unused").unwrap(), 42);
    }
}

//! Port Interfaces
//!
//! Contracts for external systems following the Hexagonal Architecture
//! pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`StorageSink`]: the time-series store the batch writer flushes to.
//!   The store is a collaborator, not part of this pipeline: it must accept
//!   bulk inserts of [`TickRow`]s keyed by `(timestamp, symbol)` with
//!   upsert-on-conflict semantics, which is what makes flush retries
//!   idempotent.

use async_trait::async_trait;

use crate::domain::message::TickRow;

/// Errors a storage sink may return from a bulk write.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store could not be reached; the write may be retried.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the rows; retrying the same rows will not help.
    #[error("storage rejected write: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Whether the batch writer should retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Bulk-upsert contract for the time-series store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Write a batch of rows in one operation.
    ///
    /// Implementations must upsert on the `(timestamp, symbol)` key so a
    /// retried, possibly partially-applied batch never produces duplicate
    /// rows.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] for transient failures and
    /// [`StorageError::Rejected`] for permanent ones.
    async fn write_rows(&self, rows: &[TickRow]) -> Result<(), StorageError>;
}

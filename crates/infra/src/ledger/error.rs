use thiserror::Error;

use stockledger_core::DomainError;
use stockledger_inventory::{BatchId, ProductId};

use crate::batch_store::BatchStoreError;
use crate::sales_store::SalesStoreError;

/// Ledger operation error.
///
/// Every allocating operation is all-or-nothing: when one of these is
/// returned, partial reservations and consumptions made by the failed call
/// have already been rolled back.
///
/// Only `ConcurrencyConflict` is transient; the caller may retry the whole
/// operation. Everything else is deterministic for the same ledger state.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    #[error("unit price {unit_price} is below the minimum {min_sale_price} of batch {batch_id}")]
    PriceBelowMinimum {
        batch_id: BatchId,
        unit_price: u64,
        min_sale_price: u64,
    },

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict(_))
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => LedgerError::InvariantViolation(msg),
            DomainError::Conflict(msg) => LedgerError::ConcurrencyConflict(msg),
            DomainError::NotFound => LedgerError::NotFound("entity".to_string()),
        }
    }
}

impl From<BatchStoreError> for LedgerError {
    fn from(value: BatchStoreError) -> Self {
        match value {
            BatchStoreError::Concurrency(msg) => LedgerError::ConcurrencyConflict(msg),
            // A concurrent intake created the same batch number first.
            BatchStoreError::Duplicate(msg) => LedgerError::ConcurrencyConflict(msg),
            BatchStoreError::NotFound(id) => LedgerError::BatchNotFound(id),
            BatchStoreError::Rejected(err) => err.into(),
            BatchStoreError::Backend(msg) => LedgerError::Storage(msg),
        }
    }
}

impl From<SalesStoreError> for LedgerError {
    fn from(value: SalesStoreError) -> Self {
        match value {
            SalesStoreError::Concurrency(msg) => LedgerError::ConcurrencyConflict(msg),
            SalesStoreError::NotFound(id) => LedgerError::NotFound(format!("sales document {id}")),
            SalesStoreError::Duplicate(id) => {
                LedgerError::Validation(format!("sales document {id} already exists"))
            }
            SalesStoreError::Backend(msg) => LedgerError::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::EntityId;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(LedgerError::ConcurrencyConflict("stale".into()).is_retryable());
        assert!(!LedgerError::InsufficientStock {
            product_id: ProductId::new(EntityId::new()),
            requested: 2,
            available: 1,
        }
        .is_retryable());
        assert!(!LedgerError::Validation("x".into()).is_retryable());
    }

    #[test]
    fn store_errors_map_onto_the_ledger_taxonomy() {
        let id = BatchId::new(EntityId::new());
        assert!(matches!(
            LedgerError::from(BatchStoreError::NotFound(id)),
            LedgerError::BatchNotFound(b) if b == id
        ));
        assert!(matches!(
            LedgerError::from(BatchStoreError::Rejected(DomainError::invariant("reserved cannot exceed on_hand"))),
            LedgerError::InvariantViolation(_)
        ));
        assert!(LedgerError::from(BatchStoreError::Duplicate("A".into())).is_retryable());
    }
}

//! Inventory queries: which batches a caller wants to see, and the totals
//! derived from them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, BatchNumber, ProductId};

/// Batch visibility filter for inventory lookups.
///
/// The default view is what can be sold today: active, unexpired batches with
/// stock on hand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFilter {
    pub include_expired: bool,
    pub include_depleted: bool,
    pub include_inactive: bool,
    pub batch_number: Option<BatchNumber>,
    /// Only batches expiring strictly before this date (undated never match).
    pub expiring_before: Option<NaiveDate>,
}

impl InventoryFilter {
    /// Everything, including history.
    pub fn all() -> Self {
        Self {
            include_expired: true,
            include_depleted: true,
            include_inactive: true,
            ..Self::default()
        }
    }

    pub fn with_batch_number(mut self, batch_number: BatchNumber) -> Self {
        self.batch_number = Some(batch_number);
        self
    }

    pub fn expiring_before(mut self, date: NaiveDate) -> Self {
        self.expiring_before = Some(date);
        self
    }

    pub fn including_expired(mut self) -> Self {
        self.include_expired = true;
        self
    }

    pub fn matches(&self, batch: &Batch, today: NaiveDate) -> bool {
        if !self.include_inactive && !batch.is_active {
            return false;
        }
        if !self.include_depleted && batch.is_depleted() {
            return false;
        }
        if !self.include_expired && batch.is_expired(today) {
            return false;
        }
        if let Some(number) = &self.batch_number {
            if &batch.batch_number != number {
                return false;
            }
        }
        if let Some(before) = self.expiring_before {
            match batch.expiry_date {
                Some(expiry) if expiry < before => {}
                _ => return false,
            }
        }
        true
    }
}

/// Per-product stock position derived from a set of batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub product_id: ProductId,
    pub on_hand: i64,
    pub reserved: i64,
    pub available: i64,
    /// Quantity that can be allocated today (active, unexpired batches).
    pub sellable: i64,
    pub batches: Vec<Batch>,
}

impl InventorySummary {
    pub fn from_batches(product_id: ProductId, batches: Vec<Batch>, today: NaiveDate) -> Self {
        let on_hand = batches.iter().map(|b| b.on_hand).sum();
        let reserved = batches.iter().map(|b| b.reserved).sum();
        let sellable = batches
            .iter()
            .filter(|b| b.is_sellable(today))
            .map(|b| b.available())
            .sum();
        Self {
            product_id,
            on_hand,
            reserved,
            available: on_hand - reserved,
            sellable,
            batches,
        }
    }

    pub fn is_below(&self, threshold: i64) -> bool {
        self.sellable < threshold
    }
}

//! Candidate ordering and allocation records.

use core::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::batch::{Batch, BatchId, ProductId};

/// Order in which batches of a product are drawn down.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMode {
    /// First-expiry-first-out, creation order as tiebreak.
    #[default]
    Fefo,
    /// First-in-first-out by creation time.
    Fifo,
}

impl AllocationMode {
    /// Total order over candidate batches for this mode.
    ///
    /// Undated batches sort after every dated one under FEFO. The batch id
    /// breaks remaining ties so the order is deterministic.
    pub fn compare(self, a: &Batch, b: &Batch) -> Ordering {
        let by_created = a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id));
        match self {
            AllocationMode::Fefo => compare_expiry(a, b).then(by_created),
            AllocationMode::Fifo => by_created,
        }
    }
}

impl core::str::FromStr for AllocationMode {
    type Err = stockledger_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fefo" => Ok(AllocationMode::Fefo),
            "fifo" => Ok(AllocationMode::Fifo),
            other => Err(stockledger_core::DomainError::validation(format!(
                "unknown allocation mode '{other}'"
            ))),
        }
    }
}

fn compare_expiry(a: &Batch, b: &Batch) -> Ordering {
    match (a.expiry_date, b.expiry_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Sort candidate batches in draw-down order.
pub fn sort_candidates(batches: &mut [Batch], mode: AllocationMode) {
    batches.sort_by(|a, b| mode.compare(a, b));
}

/// Quantity taken from one batch to satisfy (part of) a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub quantity: i64,
}

impl Allocation {
    pub fn new(batch_id: BatchId, product_id: ProductId, quantity: i64) -> Self {
        Self {
            batch_id,
            product_id,
            quantity,
        }
    }
}

pub fn total_quantity(allocations: &[Allocation]) -> i64 {
    allocations.iter().map(|a| a.quantity).sum()
}

/// Merge allocations against the same batch, keeping first-seen order and
/// dropping empty entries.
pub fn coalesce(allocations: &[Allocation]) -> Vec<Allocation> {
    let mut out: Vec<Allocation> = Vec::with_capacity(allocations.len());
    for a in allocations {
        if a.quantity == 0 {
            continue;
        }
        match out.iter_mut().find(|o| o.batch_id == a.batch_id) {
            Some(existing) => existing.quantity += a.quantity,
            None => out.push(*a),
        }
    }
    out.retain(|a| a.quantity != 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchNumber, BatchPricing, NewBatch};
    use chrono::{DateTime, Duration, NaiveDate, Utc};
    use stockledger_core::{EntityId, TenantId};

    fn batch(expiry: Option<(i32, u32, u32)>, created_at: DateTime<Utc>) -> Batch {
        Batch::create(
            BatchId::new(EntityId::new()),
            NewBatch {
                tenant_id: TenantId::new(),
                product_id: ProductId::new(EntityId::new()),
                batch_number: BatchNumber::parse("LOT").unwrap(),
                expiry_date: expiry.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
                quantity: 10,
                unit_cost: 1,
                pricing: BatchPricing::default(),
                occurred_at: created_at,
            },
        )
        .unwrap()
    }

    #[test]
    fn fefo_orders_by_expiry_then_creation() {
        let t0 = Utc::now();
        let late = batch(Some((2024, 2, 1)), t0);
        let early_new = batch(Some((2024, 1, 1)), t0 + Duration::hours(2));
        let early_old = batch(Some((2024, 1, 1)), t0 + Duration::hours(1));
        let undated = batch(None, t0 - Duration::days(30));

        let mut batches = vec![undated.clone(), late.clone(), early_new.clone(), early_old.clone()];
        sort_candidates(&mut batches, AllocationMode::Fefo);

        let ids: Vec<_> = batches.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![early_old.id, early_new.id, late.id, undated.id]);
    }

    #[test]
    fn fifo_ignores_expiry() {
        let t0 = Utc::now();
        let first = batch(Some((2030, 1, 1)), t0);
        let second = batch(Some((2024, 1, 1)), t0 + Duration::minutes(5));

        let mut batches = vec![second.clone(), first.clone()];
        sort_candidates(&mut batches, AllocationMode::Fifo);
        assert_eq!(batches[0].id, first.id);
        assert_eq!(batches[1].id, second.id);
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("FEFO".parse::<AllocationMode>().unwrap(), AllocationMode::Fefo);
        assert_eq!(" fifo ".parse::<AllocationMode>().unwrap(), AllocationMode::Fifo);
        assert!("lifo".parse::<AllocationMode>().is_err());
    }

    #[test]
    fn coalesce_merges_same_batch() {
        let product = ProductId::new(EntityId::new());
        let a = BatchId::new(EntityId::new());
        let b = BatchId::new(EntityId::new());
        let merged = coalesce(&[
            Allocation::new(a, product, 5),
            Allocation::new(b, product, 3),
            Allocation::new(a, product, 2),
            Allocation::new(b, product, -3),
        ]);
        assert_eq!(merged, vec![Allocation::new(a, product, 7)]);
        assert_eq!(total_quantity(&merged), 7);
    }
}

//! Per-product diff between a document's recorded allocations and a new set
//! of requested lines.
//!
//! Recorded allocations are kept wherever the new lines still need them, so
//! an update only touches the batches whose quantity actually changes.
//! Pinned lines claim allocations on their own batch first. Unpinned lines
//! then claim the remaining allocations in recording order, which means a
//! reduction gives back the most recently allocated stock first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stockledger_inventory::{Allocation, ProductId, coalesce};

use crate::document::{SaleLine, SalesAllocationLine, SalesDocumentId};

/// An allocation that survives the update, possibly at a new price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedAllocation {
    pub line: SalesAllocationLine,
    pub previous_unit_price: u64,
}

impl RetainedAllocation {
    pub fn price_changed(&self) -> bool {
        self.line.unit_price != self.previous_unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiff {
    pub product_id: ProductId,
    pub retained: Vec<RetainedAllocation>,
    /// Consumed quantities to give back to their batches.
    pub released: Vec<Allocation>,
    /// Quantities that need fresh allocation.
    pub additions: Vec<SaleLine>,
}

impl LineDiff {
    pub fn retained_quantity(&self) -> i64 {
        self.retained.iter().map(|r| r.line.quantity).sum()
    }

    pub fn released_quantity(&self) -> i64 {
        self.released.iter().map(|a| a.quantity).sum()
    }

    pub fn added_quantity(&self) -> i64 {
        self.additions.iter().map(|l| l.quantity).sum()
    }

    pub fn is_unchanged(&self) -> bool {
        self.released.is_empty()
            && self.additions.is_empty()
            && self.retained.iter().all(|r| !r.price_changed())
    }
}

struct Pool {
    line: SalesAllocationLine,
    remaining: i64,
}

/// Diff recorded `previous` allocations against the new requested `lines`,
/// one entry per product touched by either side, ordered by product id.
///
/// `lines` are expected to be validated (positive quantities).
pub fn diff_lines(
    document_id: SalesDocumentId,
    previous: &[SalesAllocationLine],
    lines: &[SaleLine],
) -> Vec<LineDiff> {
    let mut pools: BTreeMap<ProductId, Vec<Pool>> = BTreeMap::new();
    let mut wanted: BTreeMap<ProductId, Vec<&SaleLine>> = BTreeMap::new();

    for a in previous.iter().filter(|a| a.quantity > 0) {
        pools.entry(a.product_id).or_default().push(Pool {
            line: *a,
            remaining: a.quantity,
        });
        wanted.entry(a.product_id).or_default();
    }
    for line in lines {
        wanted.entry(line.product_id).or_default().push(line);
        pools.entry(line.product_id).or_default();
    }

    wanted
        .into_iter()
        .map(|(product_id, requested)| {
            let product_pools = pools.remove(&product_id).unwrap_or_default();
            diff_product(document_id, product_id, product_pools, &requested)
        })
        .collect()
}

fn diff_product(
    document_id: SalesDocumentId,
    product_id: ProductId,
    mut pools: Vec<Pool>,
    requested: &[&SaleLine],
) -> LineDiff {
    let mut diff = LineDiff {
        product_id,
        retained: Vec::new(),
        released: Vec::new(),
        additions: Vec::new(),
    };

    let pinned = requested.iter().filter(|l| l.batch_id.is_some());
    let unpinned = requested.iter().filter(|l| l.batch_id.is_none());

    for line in pinned.chain(unpinned) {
        let mut need = line.quantity;
        for pool in pools.iter_mut() {
            if need == 0 {
                break;
            }
            if pool.remaining == 0 {
                continue;
            }
            if let Some(batch_id) = line.batch_id {
                if pool.line.batch_id != batch_id {
                    continue;
                }
            }
            let take = need.min(pool.remaining);
            pool.remaining -= take;
            need -= take;
            diff.retained.push(RetainedAllocation {
                line: SalesAllocationLine {
                    document_id,
                    quantity: take,
                    unit_price: line.unit_price,
                    ..pool.line
                },
                previous_unit_price: pool.line.unit_price,
            });
        }
        if need > 0 {
            diff.additions.push(SaleLine {
                quantity: need,
                ..(*line).clone()
            });
        }
    }

    let leftovers: Vec<Allocation> = pools
        .iter()
        .filter(|p| p.remaining > 0)
        .map(|p| Allocation::new(p.line.batch_id, product_id, p.remaining))
        .collect();
    diff.released = coalesce(&leftovers);
    diff
}

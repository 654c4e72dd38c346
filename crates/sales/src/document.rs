use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, Entity, EntityId, TenantId, Versioned};
use stockledger_inventory::{Allocation, BatchId, ProductId};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub EntityId);

        impl $name {
            pub fn new(id: EntityId) -> Self {
                Self(id)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_newtype!(
    /// Sales document (invoice) identifier.
    SalesDocumentId
);
id_newtype!(CustomerId);
id_newtype!(
    /// Employee responsible for a sale (salesman, delivery).
    EmployeeId
);

/// Sales document lifecycle. Both states are terminal for inventory purposes:
/// a finalized document holds consumed stock, a deleted one has given it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SalesDocumentStatus {
    Finalized,
    Deleted,
}

/// Requested line: product, quantity, unit price, optionally a specific batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: ProductId,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: u64,
    /// Sell only from this batch instead of letting FEFO/FIFO pick.
    pub batch_id: Option<BatchId>,
}

impl SaleLine {
    pub fn new(product_id: ProductId, quantity: i64, unit_price: u64) -> Self {
        Self {
            product_id,
            quantity,
            unit_price,
            batch_id: None,
        }
    }

    pub fn pinned_to(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "line quantity must be positive (product {})",
                self.product_id
            )));
        }
        Ok(())
    }
}

/// How much of one line was fulfilled from one batch, at what price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesAllocationLine {
    pub document_id: SalesDocumentId,
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: u64,
}

impl SalesAllocationLine {
    pub fn allocation(&self) -> Allocation {
        Allocation::new(self.batch_id, self.product_id, self.quantity)
    }
}

/// Command: create (finalize) a sales document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesRequest {
    pub tenant_id: TenantId,
    pub document_id: SalesDocumentId,
    pub customer_id: CustomerId,
    pub employee_ids: Vec<EmployeeId>,
    pub lines: Vec<SaleLine>,
    pub occurred_at: DateTime<Utc>,
}

impl SalesRequest {
    pub fn validate(&self) -> DomainResult<()> {
        validate_lines(&self.lines)
    }
}

pub(crate) fn validate_lines(lines: &[SaleLine]) -> DomainResult<()> {
    if lines.is_empty() {
        return Err(DomainError::validation("sales document needs at least one line"));
    }
    lines.iter().try_for_each(SaleLine::validate)
}

/// A finalized sales document and the batch allocations backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesDocument {
    id: SalesDocumentId,
    tenant_id: TenantId,
    customer_id: CustomerId,
    employee_ids: Vec<EmployeeId>,
    status: SalesDocumentStatus,
    lines: Vec<SaleLine>,
    allocations: Vec<SalesAllocationLine>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl SalesDocument {
    /// Build a finalized document (version 1) from a request and the
    /// allocations that fulfilled it.
    pub fn finalize(request: &SalesRequest, allocations: Vec<SalesAllocationLine>) -> DomainResult<Self> {
        request.validate()?;
        check_fulfilment(request.document_id, &request.lines, &allocations)?;

        Ok(Self {
            id: request.document_id,
            tenant_id: request.tenant_id,
            customer_id: request.customer_id,
            employee_ids: request.employee_ids.clone(),
            status: SalesDocumentStatus::Finalized,
            lines: request.lines.clone(),
            allocations,
            created_at: request.occurred_at,
            updated_at: request.occurred_at,
            version: 1,
        })
    }

    pub fn id_typed(&self) -> SalesDocumentId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn employee_ids(&self) -> &[EmployeeId] {
        &self.employee_ids
    }

    pub fn status(&self) -> SalesDocumentStatus {
        self.status
    }

    pub fn lines(&self) -> &[SaleLine] {
        &self.lines
    }

    pub fn allocations(&self) -> &[SalesAllocationLine] {
        &self.allocations
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, SalesDocumentStatus::Finalized)
    }

    /// Replace the lines and their backing allocations.
    pub fn revise(
        &mut self,
        lines: Vec<SaleLine>,
        allocations: Vec<SalesAllocationLine>,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_active()?;
        validate_lines(&lines)?;
        check_fulfilment(self.id, &lines, &allocations)?;
        self.lines = lines;
        self.allocations = allocations;
        self.touch(at);
        Ok(())
    }

    /// Mark deleted. Allocation lines are kept as history.
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_active()?;
        self.status = SalesDocumentStatus::Deleted;
        self.touch(at);
        Ok(())
    }

    /// Undo a deletion whose stock could not be returned. The version still
    /// advances so the store sees a new write.
    pub fn reinstate(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.is_active() {
            return Err(DomainError::invariant(format!(
                "sales document {} is not deleted",
                self.id
            )));
        }
        self.status = SalesDocumentStatus::Finalized;
        self.touch(at);
        Ok(())
    }

    fn ensure_active(&self) -> DomainResult<()> {
        if !self.is_active() {
            return Err(DomainError::invariant(format!(
                "sales document {} is deleted",
                self.id
            )));
        }
        Ok(())
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.version += 1;
    }
}

impl Entity for SalesDocument {
    type Id = SalesDocumentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Versioned for SalesDocument {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Allocations must belong to the document and cover exactly the requested
/// quantity of every product.
fn check_fulfilment(
    document_id: SalesDocumentId,
    lines: &[SaleLine],
    allocations: &[SalesAllocationLine],
) -> DomainResult<()> {
    let mut outstanding: BTreeMap<ProductId, i64> = BTreeMap::new();
    for line in lines {
        *outstanding.entry(line.product_id).or_default() += line.quantity;
    }
    for a in allocations {
        if a.document_id != document_id {
            return Err(DomainError::invariant("allocation belongs to another document"));
        }
        if a.quantity <= 0 {
            return Err(DomainError::invariant("allocation quantity must be positive"));
        }
        *outstanding.entry(a.product_id).or_default() -= a.quantity;
    }
    match outstanding.iter().find(|(_, q)| **q != 0) {
        Some((product_id, q)) => Err(DomainError::invariant(format!(
            "allocations for product {product_id} are off by {q}"
        ))),
        None => Ok(()),
    }
}

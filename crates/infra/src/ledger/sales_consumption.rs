//! Sales documents against batch stock.
//!
//! Create, update and delete are each all-or-nothing. The write order is
//! chosen so the last step that can fail on stock bounds comes before the
//! document is saved:
//!
//! 1. reserve whatever the document newly needs (rolled back on failure)
//! 2. check minimum prices, then consume the reservations
//! 3. save the document under its version guard (consumption reversed on failure)
//! 4. give back stock the document no longer needs
//!
//! Step 4 only ever adds stock, so it cannot be refused by the bounds check.
//! When it fails anyway (a backend error), the stock it did return is taken
//! back, the document is restored to its previous content and step 2 is
//! undone.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use stockledger_core::{DomainResult, ExpectedVersion, TenantId, Versioned};
use stockledger_inventory::{Allocation, MovementReference};
use stockledger_sales::{
    SaleLine, SalesAllocationLine, SalesDocument, SalesDocumentId, SalesRequest, diff_lines,
};

use crate::batch_store::BatchStore;
use crate::directory::Directory;
use crate::sales_store::SalesDocumentStore;

use super::allocation::{AllocationEngine, OperationContext};
use super::error::LedgerError;
use super::feed::MovementLog;

pub struct SalesConsumptionCoordinator<S, D, Q> {
    engine: AllocationEngine<S>,
    directory: D,
    documents: Q,
}

impl<S, D, Q> SalesConsumptionCoordinator<S, D, Q>
where
    S: BatchStore,
    D: Directory,
    Q: SalesDocumentStore,
{
    pub fn new(engine: AllocationEngine<S>, directory: D, documents: Q) -> Self {
        Self {
            engine,
            directory,
            documents,
        }
    }

    pub fn engine(&self) -> &AllocationEngine<S> {
        &self.engine
    }

    pub fn documents(&self) -> &Q {
        &self.documents
    }

    /// Finalize a new sales document: allocate every line, enforce batch
    /// price floors, consume, and store the document with its allocations.
    #[instrument(
        skip(self, request, log),
        fields(
            tenant_id = %request.tenant_id.as_uuid(),
            document_id = %request.document_id,
            lines = request.lines.len()
        ),
        err
    )]
    pub fn allocate_for_sale(&self, request: &SalesRequest, log: &mut MovementLog) -> Result<SalesDocument, LedgerError> {
        request.validate()?;
        self.check_parties(request)?;
        self.check_products(request.tenant_id, &request.lines)?;
        if self.documents.get(request.tenant_id, request.document_id)?.is_some() {
            return Err(LedgerError::Validation(format!(
                "sales document {} already exists",
                request.document_id
            )));
        }

        let ctx = context(request.tenant_id, request.document_id, request.occurred_at);
        let taken = self.reserve_lines(&ctx, request.document_id, &request.lines, log)?;
        let allocations = allocations_of(&taken);

        if let Err(err) = self
            .check_price_floors(request.tenant_id, &taken)
            .and_then(|()| self.engine.consume(&ctx, &allocations, log))
        {
            self.engine.rollback_reservations(&ctx, &allocations, log);
            return Err(err);
        }

        let stored = SalesDocument::finalize(request, taken)
            .map_err(LedgerError::from)
            .and_then(|document| Ok(self.documents.insert(document)?));
        match stored {
            Ok(document) => {
                info!(batches = allocations.len(), "sales document finalized");
                Ok(document)
            }
            Err(err) => {
                self.give_back(&ctx, &allocations, log);
                Err(err)
            }
        }
    }

    /// Re-allocate a finalized document to `lines`. Only the per-product
    /// difference touches stock; untouched lines keep their batches.
    #[instrument(
        skip(self, lines, log),
        fields(tenant_id = %tenant_id.as_uuid(), document_id = %document_id, lines = lines.len()),
        err
    )]
    pub fn update_sale_allocation(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
        lines: Vec<SaleLine>,
        at: DateTime<Utc>,
        log: &mut MovementLog,
    ) -> Result<SalesDocument, LedgerError> {
        if lines.is_empty() {
            return Err(LedgerError::Validation("sales document needs at least one line".into()));
        }
        lines.iter().try_for_each(SaleLine::validate)?;

        let document = self.load(tenant_id, document_id)?;
        if !document.is_active() {
            return Err(LedgerError::Validation(format!("sales document {document_id} is deleted")));
        }
        self.check_products(tenant_id, &lines)?;

        let diffs = diff_lines(document_id, document.allocations(), &lines);
        let retained: Vec<SalesAllocationLine> = diffs
            .iter()
            .flat_map(|d| d.retained.iter().map(|r| r.line))
            .collect();
        let repriced: Vec<SalesAllocationLine> = diffs
            .iter()
            .flat_map(|d| d.retained.iter().filter(|r| r.price_changed()).map(|r| r.line))
            .collect();
        let additions: Vec<SaleLine> = diffs.iter().flat_map(|d| d.additions.iter().cloned()).collect();
        let released: Vec<Allocation> = diffs.iter().flat_map(|d| d.released.iter().copied()).collect();

        self.check_price_floors(tenant_id, &repriced)?;

        let ctx = context(tenant_id, document_id, at);
        let added = self.reserve_lines(&ctx, document_id, &additions, log)?;
        let added_allocations = allocations_of(&added);
        if let Err(err) = self
            .check_price_floors(tenant_id, &added)
            .and_then(|()| self.engine.consume(&ctx, &added_allocations, log))
        {
            self.engine.rollback_reservations(&ctx, &added_allocations, log);
            return Err(err);
        }

        let expected = ExpectedVersion::Exact(document.version());
        let prior_lines = document.lines().to_vec();
        let prior_allocations = document.allocations().to_vec();
        let mut revised = document;
        let allocations = retained.into_iter().chain(added).collect();
        let saved = revised
            .revise(lines, allocations, at)
            .map_err(LedgerError::from)
            .and_then(|()| Ok(self.documents.save(revised, expected)?));
        let saved = match saved {
            Ok(saved) => saved,
            Err(err) => {
                self.give_back(&ctx, &added_allocations, log);
                return Err(err);
            }
        };

        if let Err(err) = self.engine.reverse_consumption(&ctx, &released, log) {
            error!(error = %err, "released stock could not be returned, restoring previous lines");
            self.restore(saved, at, |doc, at| doc.revise(prior_lines, prior_allocations, at));
            self.give_back(&ctx, &added_allocations, log);
            return Err(err);
        }

        info!(
            added = added_allocations.len(),
            released = released.len(),
            version = saved.version(),
            "sales document revised"
        );
        Ok(saved)
    }

    /// Delete a finalized document and return all of its stock.
    #[instrument(skip(self, log), fields(tenant_id = %tenant_id.as_uuid(), document_id = %document_id), err)]
    pub fn release_sale_allocation(
        &self,
        tenant_id: TenantId,
        document_id: SalesDocumentId,
        at: DateTime<Utc>,
        log: &mut MovementLog,
    ) -> Result<SalesDocument, LedgerError> {
        let document = self.load(tenant_id, document_id)?;
        let allocations = allocations_of(document.allocations());
        let expected = ExpectedVersion::Exact(document.version());

        // Marking first makes a second, concurrent delete lose on the version
        // guard instead of returning the stock twice.
        let mut deleted = document;
        deleted.mark_deleted(at)?;
        let saved = self.documents.save(deleted, expected)?;

        let ctx = context(tenant_id, document_id, at);
        if let Err(err) = self.engine.reverse_consumption(&ctx, &allocations, log) {
            error!(error = %err, "stock of the deleted document could not be returned, reinstating it");
            self.restore(saved, at, SalesDocument::reinstate);
            return Err(err);
        }

        info!(batches = allocations.len(), "sales document deleted");
        Ok(saved)
    }

    fn load(&self, tenant_id: TenantId, document_id: SalesDocumentId) -> Result<SalesDocument, LedgerError> {
        self.documents
            .get(tenant_id, document_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("sales document {document_id}")))
    }

    /// Reserve every line; on any failure release what this call took.
    fn reserve_lines(
        &self,
        ctx: &OperationContext,
        document_id: SalesDocumentId,
        lines: &[SaleLine],
        log: &mut MovementLog,
    ) -> Result<Vec<SalesAllocationLine>, LedgerError> {
        let mode = self.engine.config().allocation_mode;
        let mut taken: Vec<SalesAllocationLine> = Vec::new();

        for line in lines {
            let result = match line.batch_id {
                Some(batch_id) => self
                    .engine
                    .reserve_from_batch(ctx, line.product_id, batch_id, line.quantity, log)
                    .map(|a| vec![a]),
                None => self
                    .engine
                    .select_and_reserve(ctx, line.product_id, line.quantity, mode, log),
            };
            match result {
                Ok(allocations) => taken.extend(allocations.into_iter().map(|a| SalesAllocationLine {
                    document_id,
                    batch_id: a.batch_id,
                    product_id: a.product_id,
                    quantity: a.quantity,
                    unit_price: line.unit_price,
                })),
                Err(err) => {
                    warn!(product_id = %line.product_id, error = %err, "line could not be allocated");
                    self.engine.rollback_reservations(ctx, &allocations_of(&taken), log);
                    return Err(err);
                }
            }
        }
        Ok(taken)
    }

    fn check_price_floors(&self, tenant_id: TenantId, lines: &[SalesAllocationLine]) -> Result<(), LedgerError> {
        for line in lines {
            let batch = self
                .engine
                .store()
                .get(tenant_id, line.batch_id)?
                .ok_or(LedgerError::BatchNotFound(line.batch_id))?;
            if !batch.pricing.allows(line.unit_price) {
                return Err(LedgerError::PriceBelowMinimum {
                    batch_id: batch.id,
                    unit_price: line.unit_price,
                    min_sale_price: batch.pricing.min_sale_price,
                });
            }
        }
        Ok(())
    }

    fn check_parties(&self, request: &SalesRequest) -> Result<(), LedgerError> {
        if !self.directory.customer_exists(request.tenant_id, request.customer_id) {
            return Err(LedgerError::NotFound(format!("customer {}", request.customer_id)));
        }
        for employee_id in &request.employee_ids {
            if !self.directory.employee_exists(request.tenant_id, *employee_id) {
                return Err(LedgerError::NotFound(format!("employee {employee_id}")));
            }
        }
        Ok(())
    }

    fn check_products(&self, tenant_id: TenantId, lines: &[SaleLine]) -> Result<(), LedgerError> {
        let products: BTreeSet<_> = lines.iter().map(|l| l.product_id).collect();
        match products
            .into_iter()
            .find(|p| !self.directory.product_exists(tenant_id, *p))
        {
            Some(product_id) => Err(LedgerError::NotFound(format!("product {product_id}"))),
            None => Ok(()),
        }
    }

    /// Write back the state a failed operation started from. Best effort.
    fn restore(
        &self,
        mut current: SalesDocument,
        at: DateTime<Utc>,
        undo: impl FnOnce(&mut SalesDocument, DateTime<Utc>) -> DomainResult<()>,
    ) {
        let expected = ExpectedVersion::Exact(current.version());
        let restored = undo(&mut current, at)
            .map_err(LedgerError::from)
            .and_then(|()| Ok(self.documents.save(current, expected)?));
        if let Err(err) = restored {
            error!(error = %err, "sales document could not be restored");
        }
    }

    /// Undo consumption of a failed operation. Best effort; the caller
    /// returns the original error.
    fn give_back(&self, ctx: &OperationContext, allocations: &[Allocation], log: &mut MovementLog) {
        if let Err(err) = self.engine.reverse_consumption(ctx, allocations, log) {
            error!(error = %err, "consumed stock of a failed sale could not be returned");
        }
    }
}

fn context(tenant_id: TenantId, document_id: SalesDocumentId, at: DateTime<Utc>) -> OperationContext {
    OperationContext::new(tenant_id, at).with_reference(MovementReference::SalesDocument(document_id.0))
}

fn allocations_of(lines: &[SalesAllocationLine]) -> Vec<Allocation> {
    lines.iter().map(SalesAllocationLine::allocation).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{NaiveDate, TimeZone};
    use stockledger_core::EntityId;
    use stockledger_inventory::{
        Batch, BatchId, BatchNumber, BatchPricing, MovementKind, NewBatch, ProductId,
    };
    use stockledger_sales::{CustomerId, EmployeeId, SalesDocumentStatus};

    use crate::directory::InMemoryDirectory;
    use crate::ledger::config::LedgerConfig;
    use crate::testing::{FlakyBatchStore, FlakyDocumentStore};

    type Coordinator =
        SalesConsumptionCoordinator<Arc<FlakyBatchStore>, Arc<InMemoryDirectory>, Arc<FlakyDocumentStore>>;

    struct Fixture {
        coordinator: Coordinator,
        store: Arc<FlakyBatchStore>,
        documents: Arc<FlakyDocumentStore>,
        directory: Arc<InMemoryDirectory>,
        tenant_id: TenantId,
        product_id: ProductId,
        customer_id: CustomerId,
        employee_id: EmployeeId,
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 12, 15, 10, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let store = Arc::new(FlakyBatchStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let documents = Arc::new(FlakyDocumentStore::new());
        let tenant_id = TenantId::new();
        let product_id = ProductId::new(EntityId::new());
        let customer_id = CustomerId::new(EntityId::new());
        let employee_id = EmployeeId::new(EntityId::new());
        directory.register_product(tenant_id, product_id, "Amoxicillin 500mg");
        directory.register_customer(tenant_id, customer_id, "Corner Pharmacy");
        directory.register_employee(tenant_id, employee_id, "Sales rep");

        let engine = AllocationEngine::new(Arc::clone(&store), LedgerConfig::default());
        Fixture {
            coordinator: SalesConsumptionCoordinator::new(engine, Arc::clone(&directory), Arc::clone(&documents)),
            store,
            documents,
            directory,
            tenant_id,
            product_id,
            customer_id,
            employee_id,
        }
    }

    impl Fixture {
        fn batch(&self, number: &str, on_hand: i64, expiry: (i32, u32, u32), min_sale_price: u64) -> Batch {
            self.batch_of(self.product_id, number, on_hand, expiry, min_sale_price)
        }

        fn batch_of(
            &self,
            product_id: ProductId,
            number: &str,
            on_hand: i64,
            expiry: (i32, u32, u32),
            min_sale_price: u64,
        ) -> Batch {
            let batch = Batch::create(
                BatchId::new(EntityId::new()),
                NewBatch {
                    tenant_id: self.tenant_id,
                    product_id,
                    batch_number: BatchNumber::parse(number).unwrap(),
                    expiry_date: NaiveDate::from_ymd_opt(expiry.0, expiry.1, expiry.2),
                    quantity: on_hand,
                    unit_cost: 50,
                    pricing: BatchPricing {
                        min_sale_price,
                        ..BatchPricing::default()
                    },
                    occurred_at: at(),
                },
            )
            .unwrap();
            self.coordinator.engine().store().create(batch).unwrap()
        }

        fn reload(&self, batch: &Batch) -> Batch {
            self.coordinator
                .engine()
                .store()
                .get(self.tenant_id, batch.id)
                .unwrap()
                .unwrap()
        }

        fn quantities(&self, batch: &Batch) -> (i64, i64) {
            let batch = self.reload(batch);
            (batch.on_hand, batch.reserved)
        }

        fn stored(&self, document_id: SalesDocumentId) -> SalesDocument {
            self.documents.get(self.tenant_id, document_id).unwrap().unwrap()
        }

        /// Units the active documents hold against `batch`.
        fn held_by_documents(&self, batch: &Batch) -> i64 {
            self.documents
                .active_allocations_for_batch(self.tenant_id, batch.id)
                .unwrap()
                .iter()
                .map(|a| a.quantity)
                .sum()
        }

        fn request(&self, lines: Vec<SaleLine>) -> SalesRequest {
            SalesRequest {
                tenant_id: self.tenant_id,
                document_id: SalesDocumentId::new(EntityId::new()),
                customer_id: self.customer_id,
                employee_ids: vec![self.employee_id],
                lines,
                occurred_at: at(),
            }
        }
    }

    #[test]
    fn sale_consumes_in_fefo_order() {
        let f = fixture();
        let a = f.batch("A", 50, (2024, 1, 1), 0);
        let b = f.batch("B", 30, (2024, 2, 1), 0);

        let mut log = MovementLog::new();
        let document = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 60, 120)]), &mut log)
            .unwrap();

        assert_eq!(document.allocations().len(), 2);
        let (a, b) = (f.reload(&a), f.reload(&b));
        assert_eq!((a.on_hand, a.reserved), (0, 0));
        assert_eq!((b.on_hand, b.reserved), (20, 0));

        let consumed = log.iter().filter(|m| m.kind == MovementKind::Consumed).count();
        assert_eq!(consumed, 2);
    }

    #[test]
    fn price_below_floor_consumes_nothing() {
        let f = fixture();
        let a = f.batch("A", 10, (2024, 1, 1), 100);

        let err = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 4, 99)]), &mut MovementLog::new())
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::PriceBelowMinimum { unit_price: 99, min_sale_price: 100, .. }
        ));
        let a = f.reload(&a);
        assert_eq!((a.on_hand, a.reserved), (10, 0));
    }

    #[test]
    fn failing_line_releases_earlier_lines() {
        let f = fixture();
        let other = ProductId::new(EntityId::new());
        f.directory.register_product(f.tenant_id, other, "Out of stock item");
        let a = f.batch("A", 10, (2024, 1, 1), 0);

        let err = f
            .coordinator
            .allocate_for_sale(
                &f.request(vec![SaleLine::new(f.product_id, 5, 10), SaleLine::new(other, 1, 10)]),
                &mut MovementLog::new(),
            )
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientStock { product_id, .. } if product_id == other));
        assert_eq!(f.reload(&a).reserved, 0);
    }

    #[test]
    fn unknown_collaborators_are_rejected_before_touching_stock() {
        let f = fixture();
        let a = f.batch("A", 10, (2024, 1, 1), 0);

        let mut request = f.request(vec![SaleLine::new(f.product_id, 1, 10)]);
        request.customer_id = CustomerId::new(EntityId::new());
        assert!(matches!(
            f.coordinator.allocate_for_sale(&request, &mut MovementLog::new()),
            Err(LedgerError::NotFound(_))
        ));

        let unknown = ProductId::new(EntityId::new());
        assert!(matches!(
            f.coordinator
                .allocate_for_sale(&f.request(vec![SaleLine::new(unknown, 1, 10)]), &mut MovementLog::new()),
            Err(LedgerError::NotFound(_))
        ));
        assert_eq!(f.reload(&a).version, 1);
    }

    #[test]
    fn reducing_a_line_returns_exactly_the_difference() {
        let f = fixture();
        let a = f.batch("A", 50, (2024, 1, 1), 0);
        let mut log = MovementLog::new();

        let document = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 20, 10)]), &mut log)
            .unwrap();
        assert_eq!(f.reload(&a).on_hand, 30);

        let revised = f
            .coordinator
            .update_sale_allocation(
                f.tenant_id,
                document.id_typed(),
                vec![SaleLine::new(f.product_id, 15, 10)],
                at(),
                &mut log,
            )
            .unwrap();

        assert_eq!(f.reload(&a).on_hand, 35);
        assert_eq!(f.reload(&a).reserved, 0);
        assert_eq!(revised.version(), document.version() + 1);
        let allocated: i64 = revised.allocations().iter().map(|l| l.quantity).sum();
        assert_eq!(allocated, 15);
    }

    #[test]
    fn growing_a_line_allocates_only_the_increase() {
        let f = fixture();
        let a = f.batch("A", 10, (2024, 1, 1), 0);
        let b = f.batch("B", 10, (2024, 3, 1), 0);
        let mut log = MovementLog::new();

        let document = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 8, 10)]), &mut log)
            .unwrap();
        f.coordinator
            .update_sale_allocation(
                f.tenant_id,
                document.id_typed(),
                vec![SaleLine::new(f.product_id, 14, 10)],
                at(),
                &mut log,
            )
            .unwrap();

        assert_eq!(f.reload(&a).on_hand, 0);
        assert_eq!(f.reload(&b).on_hand, 6);
    }

    #[test]
    fn failed_update_leaves_document_and_stock_alone() {
        let f = fixture();
        let a = f.batch("A", 10, (2024, 1, 1), 0);
        let mut log = MovementLog::new();

        let document = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 6, 10)]), &mut log)
            .unwrap();
        let err = f
            .coordinator
            .update_sale_allocation(
                f.tenant_id,
                document.id_typed(),
                vec![SaleLine::new(f.product_id, 11, 10)],
                at(),
                &mut log,
            )
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        let a = f.reload(&a);
        assert_eq!((a.on_hand, a.reserved), (4, 0));
        let stored = f
            .coordinator
            .documents()
            .get(f.tenant_id, document.id_typed())
            .unwrap()
            .unwrap();
        assert_eq!(stored, document);
    }

    #[test]
    fn delete_restores_stock_and_is_terminal() {
        let f = fixture();
        let a = f.batch("A", 50, (2024, 1, 1), 0);
        let b = f.batch("B", 30, (2024, 2, 1), 0);
        let mut log = MovementLog::new();

        let document = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 60, 10)]), &mut log)
            .unwrap();
        let deleted = f
            .coordinator
            .release_sale_allocation(f.tenant_id, document.id_typed(), at(), &mut log)
            .unwrap();

        assert_eq!(deleted.status(), SalesDocumentStatus::Deleted);
        assert_eq!(f.reload(&a).on_hand, 50);
        assert_eq!(f.reload(&b).on_hand, 30);

        assert!(f
            .coordinator
            .release_sale_allocation(f.tenant_id, document.id_typed(), at(), &mut log)
            .is_err());
        assert_eq!(f.reload(&a).on_hand, 50);
    }

    #[test]
    fn pinned_line_draws_from_its_batch() {
        let f = fixture();
        let early = f.batch("EARLY", 10, (2024, 1, 1), 0);
        let late = f.batch("LATE", 10, (2024, 6, 1), 0);

        f.coordinator
            .allocate_for_sale(
                &f.request(vec![SaleLine::new(f.product_id, 3, 10).pinned_to(late.id)]),
                &mut MovementLog::new(),
            )
            .unwrap();

        assert_eq!(f.reload(&early).on_hand, 10);
        assert_eq!(f.reload(&late).on_hand, 7);
    }

    #[test]
    fn failed_insert_gives_the_consumed_stock_back() {
        let f = fixture();
        let a = f.batch("A", 50, (2024, 1, 1), 0);
        let b = f.batch("B", 30, (2024, 2, 1), 0);
        let request = f.request(vec![SaleLine::new(f.product_id, 60, 10)]);

        f.documents.inserts.fail_nth(1);
        let err = f.coordinator.allocate_for_sale(&request, &mut MovementLog::new()).unwrap_err();

        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(f.quantities(&a), (50, 0));
        assert_eq!(f.quantities(&b), (30, 0));
        assert!(f.documents.get(f.tenant_id, request.document_id).unwrap().is_none());
    }

    #[test]
    fn failed_delete_keeps_the_document_and_its_stock() {
        let f = fixture();
        let a = f.batch("A", 50, (2024, 1, 1), 0);
        let b = f.batch("B", 30, (2024, 2, 1), 0);
        let document = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 60, 10)]), &mut MovementLog::new())
            .unwrap();
        assert_eq!(f.held_by_documents(&a), 50);
        assert_eq!(f.held_by_documents(&b), 10);

        // A's stock is returned, then the first write against B fails.
        f.store.writes.fail_nth(3);
        let err = f
            .coordinator
            .release_sale_allocation(f.tenant_id, document.id_typed(), at(), &mut MovementLog::new())
            .unwrap_err();

        assert!(matches!(err, LedgerError::Storage(_)));
        let stored = f.stored(document.id_typed());
        assert_eq!(stored.status(), SalesDocumentStatus::Finalized);
        assert_eq!(stored.allocations(), document.allocations());
        assert_eq!(f.quantities(&a), (0, 0));
        assert_eq!(f.quantities(&b), (20, 0));
        assert_eq!(f.held_by_documents(&a), 50);

        // The caller can simply retry.
        f.coordinator
            .release_sale_allocation(f.tenant_id, document.id_typed(), at(), &mut MovementLog::new())
            .unwrap();
        assert_eq!(f.quantities(&a), (50, 0));
        assert_eq!(f.quantities(&b), (30, 0));
        assert_eq!(f.held_by_documents(&a), 0);
    }

    #[test]
    fn failed_return_during_update_restores_previous_lines() {
        let f = fixture();
        let other = ProductId::new(EntityId::new());
        f.directory.register_product(f.tenant_id, other, "Saline 0.9%");
        let a = f.batch("A", 50, (2024, 1, 1), 0);
        let o = f.batch_of(other, "O", 10, (2024, 3, 1), 0);
        let document = f
            .coordinator
            .allocate_for_sale(&f.request(vec![SaleLine::new(f.product_id, 20, 10)]), &mut MovementLog::new())
            .unwrap();

        // Reserve and consume of the new line succeed; returning A's 5 units fails.
        f.store.writes.fail_nth(3);
        let err = f
            .coordinator
            .update_sale_allocation(
                f.tenant_id,
                document.id_typed(),
                vec![SaleLine::new(f.product_id, 15, 10), SaleLine::new(other, 4, 10)],
                at(),
                &mut MovementLog::new(),
            )
            .unwrap_err();

        assert!(matches!(err, LedgerError::Storage(_)));
        let stored = f.stored(document.id_typed());
        assert!(stored.is_active());
        assert_eq!(stored.lines(), document.lines());
        assert_eq!(stored.allocations(), document.allocations());
        assert_eq!(f.quantities(&a), (30, 0));
        assert_eq!(f.quantities(&o), (10, 0));
        assert_eq!(f.held_by_documents(&o), 0);
    }
}

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;

use stockledger_core::{EntityId, TenantId};
use stockledger_events::{EventEnvelope, InMemoryEventBus};
use stockledger_infra::batch_store::{BatchStore, InMemoryBatchStore};
use stockledger_infra::directory::InMemoryDirectory;
use stockledger_infra::ledger::{AllocationEngine, InventoryLedger, LedgerConfig, MovementLog, OperationContext};
use stockledger_infra::sales_store::InMemorySalesDocumentStore;
use stockledger_inventory::{
    AllocationMode, Batch, BatchId, BatchNumber, BatchPricing, NewBatch, ProductId, StockMovement,
};
use stockledger_purchasing::PurchaseIntake;
use stockledger_sales::{CustomerId, EmployeeId, SaleLine, SalesDocumentId, SalesRequest};

type Ledger = InventoryLedger<
    Arc<InMemoryBatchStore>,
    Arc<InMemoryDirectory>,
    Arc<InMemorySalesDocumentStore>,
    Arc<InMemoryEventBus<EventEnvelope<StockMovement>>>,
>;

fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

fn intake(tenant_id: TenantId, product_id: ProductId, i: usize, quantity: i64) -> PurchaseIntake {
    PurchaseIntake {
        tenant_id,
        product_id,
        batch_number: BatchNumber::parse(format!("LOT-{i:05}")).unwrap(),
        // Spread expiries so FEFO ordering has work to do.
        expiry_date: NaiveDate::from_ymd_opt(2025, 1 + (i % 12) as u32, 1 + (i % 28) as u32),
        quantity,
        unit_cost: 100 + i as u64,
        pricing: None,
        purchase_id: None,
        occurred_at: at(),
    }
}

struct Setup {
    ledger: Ledger,
    tenant_id: TenantId,
    product_id: ProductId,
    customer_id: CustomerId,
    employee_id: EmployeeId,
}

fn setup(batches: usize, per_batch: i64) -> Setup {
    let directory = Arc::new(InMemoryDirectory::new());
    let ledger = InventoryLedger::new(
        Arc::new(InMemoryBatchStore::new()),
        Arc::clone(&directory),
        Arc::new(InMemorySalesDocumentStore::new()),
        Arc::new(InMemoryEventBus::new()),
        LedgerConfig::default().with_max_candidates(batches.max(1)),
    );
    let tenant_id = TenantId::new();
    let product_id = ProductId::new(EntityId::new());
    let customer_id = CustomerId::new(EntityId::new());
    let employee_id = EmployeeId::new(EntityId::new());
    directory.register_product(tenant_id, product_id, "Bench product");
    directory.register_customer(tenant_id, customer_id, "Bench customer");
    directory.register_employee(tenant_id, employee_id, "Bench employee");

    for i in 0..batches {
        ledger
            .create_or_merge_batch(tenant_id, &intake(tenant_id, product_id, i, per_batch))
            .unwrap();
    }

    Setup {
        ledger,
        tenant_id,
        product_id,
        customer_id,
        employee_id,
    }
}

fn bench_reserve_release_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_release_latency");
    group.sample_size(500);

    for batch_count in [1usize, 8, 64].iter() {
        group.bench_with_input(
            BenchmarkId::new("spanning_batches", batch_count),
            batch_count,
            |b, &batch_count| {
                let s = setup(batch_count, 10);
                // Take every unit so the request spans all batches.
                let quantity = batch_count as i64 * 10;
                b.iter(|| {
                    let held = s
                        .ledger
                        .reserve(s.tenant_id, s.product_id, black_box(quantity), at())
                        .unwrap();
                    s.ledger.release(s.tenant_id, &held, at()).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_candidate_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("candidate_selection");

    for batch_count in [16usize, 256, 1024].iter() {
        group.throughput(Throughput::Elements(*batch_count as u64));
        group.bench_with_input(
            BenchmarkId::new("fefo_candidates", batch_count),
            batch_count,
            |b, &batch_count| {
                let s = setup(batch_count, 5);
                b.iter(|| {
                    let candidates = s
                        .ledger
                        .store()
                        .find_candidates(s.tenant_id, s.product_id, AllocationMode::Fefo, at().date_naive(), 64)
                        .unwrap();
                    black_box(candidates);
                });
            },
        );
    }

    group.finish();
}

fn bench_sale_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("sale_lifecycle");
    group.sample_size(200);

    group.bench_function("finalize_then_delete", |b| {
        let s = setup(4, 1_000);
        b.iter(|| {
            let request = SalesRequest {
                tenant_id: s.tenant_id,
                document_id: SalesDocumentId::new(EntityId::new()),
                customer_id: s.customer_id,
                employee_ids: vec![s.employee_id],
                lines: vec![SaleLine::new(s.product_id, 25, 500)],
                occurred_at: at(),
            };
            let document = s.ledger.allocate_for_sale(s.tenant_id, &request).unwrap();
            s.ledger
                .release_sale_allocation(s.tenant_id, document.id_typed(), at())
                .unwrap();
        });
    });

    group.bench_function("engine_only_reserve_consume", |b| {
        let store = Arc::new(InMemoryBatchStore::new());
        let engine = AllocationEngine::new(Arc::clone(&store), LedgerConfig::default());
        let s = setup(0, 0);
        for i in 0..4 {
            let cmd = intake(s.tenant_id, s.product_id, i, 1_000_000_000);
            let new = NewBatch {
                tenant_id: cmd.tenant_id,
                product_id: cmd.product_id,
                batch_number: cmd.batch_number,
                expiry_date: cmd.expiry_date,
                quantity: cmd.quantity,
                unit_cost: cmd.unit_cost,
                pricing: BatchPricing::default(),
                occurred_at: cmd.occurred_at,
            };
            store.create(Batch::create(BatchId::new(EntityId::new()), new).unwrap()).unwrap();
        }
        let ctx = OperationContext::new(s.tenant_id, at());
        b.iter(|| {
            let mut log = MovementLog::new();
            let held = engine
                .select_and_reserve(&ctx, s.product_id, black_box(3), AllocationMode::Fefo, &mut log)
                .unwrap();
            engine.consume(&ctx, &held, &mut log).unwrap();
            black_box(log.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_reserve_release_latency,
    bench_candidate_selection,
    bench_sale_lifecycle
);
criterion_main!(benches);

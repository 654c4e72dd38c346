//! Postgres-backed batch store.
//!
//! Quantity changes are a single guarded `UPDATE`: the row is only touched if
//! the resulting quantities keep `0 <= reserved <= on_hand` (and, for
//! `ExpectedVersion::Exact`, the version still matches). When no row comes
//! back the store re-reads it to report why.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | BatchStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (check constraint violation) | `23514` | `Rejected` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / Io / other | N/A | `Backend` |
//!
//! Schema lives in `crates/infra/migrations/` (see [`PostgresBatchStore::migrate`]).

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{Span, instrument};

use stockledger_core::{DomainError, EntityId, ExpectedVersion, TenantId, UserId};
use stockledger_inventory::{
    AdjustmentId, AdjustmentReason, AdjustmentRecord, AllocationMode, Batch, BatchId, BatchNumber,
    BatchPricing, InventoryFilter, ProductId, StockDelta,
};

use super::r#trait::{BatchStore, BatchStoreError};

const BATCH_COLUMNS: &str = r#"
    id, tenant_id, product_id, batch_number, expiry_date, on_hand, reserved,
    last_purchase_price, average_cost, min_sale_price, sale_price, retail_price,
    invoice_price, is_active, created_at, updated_at, version
"#;

/// Postgres-backed batch store.
///
/// The async methods are the native API. The synchronous [`BatchStore`]
/// implementation drives them on the runtime handle given at construction, so
/// the ledger can be called from plain worker threads as well as from inside
/// a multi-threaded tokio runtime.
#[derive(Debug, Clone)]
pub struct PostgresBatchStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresBatchStore {
    /// Synchronous calls made from inside a tokio runtime need a
    /// multi-threaded one; on a `current_thread` runtime they fail with
    /// `Backend` instead of blocking the only worker.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), BatchStoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| BatchStoreError::Backend(format!("migration failed: {e}")))
    }

    fn run<T>(&self, fut: impl Future<Output = Result<T, BatchStoreError>>) -> Result<T, BatchStoreError> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => Err(BatchStoreError::Backend(
                "synchronous batch store calls need a multi-threaded tokio runtime".to_string(),
            )),
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(fut)),
            Err(_) => self.runtime.block_on(fut),
        }
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id.as_uuid(), batch_id = %batch_id),
        err
    )]
    pub async fn get(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(batch_id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_batch(&r)).transpose()
    }

    #[instrument(
        skip(self, filter),
        fields(tenant_id = %tenant_id.as_uuid(), product_id = %product_id),
        err
    )]
    pub async fn find_by_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches
             WHERE tenant_id = $1 AND product_id = $2
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(product_id.0.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_product", e))?;

        decode_filtered(&rows, filter, today)
    }

    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id.as_uuid(),
            product_id = %product_id,
            candidate_count = tracing::field::Empty
        ),
        err
    )]
    pub async fn find_candidates(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        mode: AllocationMode,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        let order_by = match mode {
            AllocationMode::Fefo => "expiry_date ASC NULLS LAST, created_at ASC, id ASC",
            AllocationMode::Fifo => "created_at ASC, id ASC",
        };
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches
             WHERE tenant_id = $1 AND product_id = $2
               AND is_active
               AND on_hand - reserved > 0
               AND (expiry_date IS NULL OR expiry_date >= $3)
             ORDER BY {order_by}
             LIMIT $4"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(product_id.0.as_uuid())
            .bind(today)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_candidates", e))?;

        Span::current().record("candidate_count", rows.len());
        rows.iter().map(decode_batch).collect()
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id.as_uuid(), product_id = %product_id, batch_number = %batch_number),
        err
    )]
    pub async fn find_by_number(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        batch_number: &BatchNumber,
    ) -> Result<Option<Batch>, BatchStoreError> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches
             WHERE tenant_id = $1 AND product_id = $2 AND batch_number = $3"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(product_id.0.as_uuid())
            .bind(batch_number.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_number", e))?;

        row.map(|r| decode_batch(&r)).transpose()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id.as_uuid()), err)]
    pub async fn list_tenant(
        &self,
        tenant_id: TenantId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batches
             WHERE tenant_id = $1
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_tenant", e))?;

        decode_filtered(&rows, filter, today)
    }

    #[instrument(
        skip(self, batch),
        fields(tenant_id = %batch.tenant_id.as_uuid(), batch_id = %batch.id, batch_number = %batch.batch_number),
        err
    )]
    pub async fn create(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
        batch.check_invariants().map_err(BatchStoreError::Rejected)?;

        let sql = format!(
            "INSERT INTO batches ({BATCH_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
             RETURNING {BATCH_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(batch.id.0.as_uuid())
            .bind(batch.tenant_id.as_uuid())
            .bind(batch.product_id.0.as_uuid())
            .bind(batch.batch_number.as_str())
            .bind(batch.expiry_date)
            .bind(batch.on_hand)
            .bind(batch.reserved)
            .bind(money_to_db(batch.last_purchase_price)?)
            .bind(money_to_db(batch.average_cost)?)
            .bind(money_to_db(batch.pricing.min_sale_price)?)
            .bind(money_to_db(batch.pricing.sale_price)?)
            .bind(money_to_db(batch.pricing.retail_price)?)
            .bind(money_to_db(batch.pricing.invoice_price)?)
            .bind(batch.is_active)
            .bind(batch.created_at)
            .bind(batch.updated_at)
            .bind(version_to_db(batch.version)?)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create", e))?;

        decode_batch(&row)
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id.as_uuid(), batch_id = %batch_id, expected_version = ?expected_version),
        err
    )]
    pub async fn apply_delta(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: StockDelta,
        expected_version: ExpectedVersion,
        at: DateTime<Utc>,
    ) -> Result<Batch, BatchStoreError> {
        let row = guarded_update(tenant_id, batch_id, delta, expected_version, at)?
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_delta", e))?;

        match row {
            Some(r) => decode_batch(&r),
            None => Err(self.explain_miss(tenant_id, batch_id, delta, expected_version).await),
        }
    }

    #[instrument(
        skip(self, record),
        fields(
            tenant_id = %record.tenant_id.as_uuid(),
            batch_id = %record.batch_id,
            delta = record.delta,
            expected_version = ?expected_version
        ),
        err
    )]
    pub async fn apply_adjustment(
        &self,
        mut record: AdjustmentRecord,
        expected_version: ExpectedVersion,
    ) -> Result<(Batch, AdjustmentRecord), BatchStoreError> {
        let delta = StockDelta::on_hand(record.delta);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = guarded_update(record.tenant_id, record.batch_id, delta, expected_version, record.occurred_at)?
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("apply_adjustment", e))?;

        let Some(row) = row else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(self
                .explain_miss(record.tenant_id, record.batch_id, delta, expected_version)
                .await);
        };
        let batch = decode_batch(&row)?;
        if batch.product_id != record.product_id {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(BatchStoreError::Rejected(DomainError::invariant(
                "adjustment product does not match batch",
            )));
        }
        record.on_hand_after = batch.on_hand;

        sqlx::query(
            r#"
            INSERT INTO batch_adjustments (
                id, tenant_id, batch_id, product_id, delta, reason, actor_id, on_hand_after, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id.0.as_uuid())
        .bind(record.tenant_id.as_uuid())
        .bind(record.batch_id.0.as_uuid())
        .bind(record.product_id.0.as_uuid())
        .bind(record.delta)
        .bind(record.reason.as_str())
        .bind(record.actor.as_uuid())
        .bind(record.on_hand_after)
        .bind(record.occurred_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_adjustment", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok((batch, record))
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id.as_uuid(), batch_id = %batch_id),
        err
    )]
    pub async fn adjustments_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<AdjustmentRecord>, BatchStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, batch_id, product_id, delta, reason, actor_id, on_hand_after, occurred_at
            FROM batch_adjustments
            WHERE tenant_id = $1 AND batch_id = $2
            ORDER BY seq ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(batch_id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("adjustments_for_batch", e))?;

        rows.iter().map(decode_adjustment).collect()
    }

    #[instrument(
        skip(self, batch),
        fields(tenant_id = %batch.tenant_id.as_uuid(), batch_id = %batch.id, expected_version = ?expected_version),
        err
    )]
    pub async fn update(&self, batch: &Batch, expected_version: ExpectedVersion) -> Result<Batch, BatchStoreError> {
        batch.check_invariants().map_err(BatchStoreError::Rejected)?;

        let sql = format!(
            "UPDATE batches SET
                 on_hand = $5,
                 reserved = $6,
                 last_purchase_price = $7,
                 average_cost = $8,
                 min_sale_price = $9,
                 sale_price = $10,
                 retail_price = $11,
                 invoice_price = $12,
                 is_active = $13,
                 updated_at = $14,
                 version = version + 1
             WHERE tenant_id = $1 AND id = $2 AND product_id = $3 AND batch_number = $4
               AND ($15::bigint IS NULL OR version = $15)
             RETURNING {BATCH_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(batch.tenant_id.as_uuid())
            .bind(batch.id.0.as_uuid())
            .bind(batch.product_id.0.as_uuid())
            .bind(batch.batch_number.as_str())
            .bind(batch.on_hand)
            .bind(batch.reserved)
            .bind(money_to_db(batch.last_purchase_price)?)
            .bind(money_to_db(batch.average_cost)?)
            .bind(money_to_db(batch.pricing.min_sale_price)?)
            .bind(money_to_db(batch.pricing.sale_price)?)
            .bind(money_to_db(batch.pricing.retail_price)?)
            .bind(money_to_db(batch.pricing.invoice_price)?)
            .bind(batch.is_active)
            .bind(batch.updated_at)
            .bind(expected_version.exact().map(version_to_db).transpose()?)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        if let Some(r) = row {
            return decode_batch(&r);
        }
        match self.get(batch.tenant_id, batch.id).await? {
            None => Err(BatchStoreError::NotFound(batch.id)),
            Some(current) if current.product_id != batch.product_id || current.batch_number != batch.batch_number => {
                Err(BatchStoreError::Rejected(DomainError::invariant(
                    "batch product and number cannot change",
                )))
            }
            Some(current) => Err(BatchStoreError::Concurrency(format!(
                "batch {}: expected {:?}, found version {}",
                batch.id, expected_version, current.version
            ))),
        }
    }

    /// Work out why a guarded update matched no row.
    async fn explain_miss(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: StockDelta,
        expected_version: ExpectedVersion,
    ) -> BatchStoreError {
        let current = match self.get(tenant_id, batch_id).await {
            Ok(Some(b)) => b,
            Ok(None) => return BatchStoreError::NotFound(batch_id),
            Err(e) => return e,
        };
        if !expected_version.matches(current.version) {
            return BatchStoreError::Concurrency(format!(
                "batch {batch_id}: expected {expected_version:?}, found version {}",
                current.version
            ));
        }
        match current.preview(delta) {
            Err(e) => BatchStoreError::Rejected(e),
            // The row moved between the update and this read.
            Ok(_) => BatchStoreError::Concurrency(format!("batch {batch_id} changed during update")),
        }
    }
}

fn guarded_update(
    tenant_id: TenantId,
    batch_id: BatchId,
    delta: StockDelta,
    expected_version: ExpectedVersion,
    at: DateTime<Utc>,
) -> Result<Query<'static, Postgres, PgArguments>, BatchStoreError> {
    let expected = expected_version.exact().map(version_to_db).transpose()?;
    Ok(sqlx::query(GUARDED_UPDATE)
        .bind(*tenant_id.as_uuid())
        .bind(*batch_id.0.as_uuid())
        .bind(delta.on_hand)
        .bind(delta.reserved)
        .bind(at)
        .bind(expected))
}

const GUARDED_UPDATE: &str = r#"
    UPDATE batches SET
        on_hand = on_hand + $3,
        reserved = reserved + $4,
        updated_at = $5,
        version = version + 1
    WHERE tenant_id = $1 AND id = $2
      AND ($6::bigint IS NULL OR version = $6)
      AND on_hand + $3 >= 0
      AND reserved + $4 >= 0
      AND reserved + $4 <= on_hand + $3
    RETURNING
        id, tenant_id, product_id, batch_number, expiry_date, on_hand, reserved,
        last_purchase_price, average_cost, min_sale_price, sale_price, retail_price,
        invoice_price, is_active, created_at, updated_at, version
"#;

impl BatchStore for PostgresBatchStore {
    fn get(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Option<Batch>, BatchStoreError> {
        self.run(PostgresBatchStore::get(self, tenant_id, batch_id))
    }

    fn find_by_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        self.run(PostgresBatchStore::find_by_product(self, tenant_id, product_id, filter, today))
    }

    fn find_candidates(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        mode: AllocationMode,
        today: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        self.run(PostgresBatchStore::find_candidates(
            self, tenant_id, product_id, mode, today, limit,
        ))
    }

    fn find_by_number(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        batch_number: &BatchNumber,
    ) -> Result<Option<Batch>, BatchStoreError> {
        self.run(PostgresBatchStore::find_by_number(self, tenant_id, product_id, batch_number))
    }

    fn list_tenant(
        &self,
        tenant_id: TenantId,
        filter: &InventoryFilter,
        today: NaiveDate,
    ) -> Result<Vec<Batch>, BatchStoreError> {
        self.run(PostgresBatchStore::list_tenant(self, tenant_id, filter, today))
    }

    fn create(&self, batch: Batch) -> Result<Batch, BatchStoreError> {
        self.run(PostgresBatchStore::create(self, batch))
    }

    fn apply_delta(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        delta: StockDelta,
        expected_version: ExpectedVersion,
        at: DateTime<Utc>,
    ) -> Result<Batch, BatchStoreError> {
        self.run(PostgresBatchStore::apply_delta(
            self,
            tenant_id,
            batch_id,
            delta,
            expected_version,
            at,
        ))
    }

    fn apply_adjustment(
        &self,
        record: AdjustmentRecord,
        expected_version: ExpectedVersion,
    ) -> Result<(Batch, AdjustmentRecord), BatchStoreError> {
        self.run(PostgresBatchStore::apply_adjustment(self, record, expected_version))
    }

    fn adjustments_for_batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Vec<AdjustmentRecord>, BatchStoreError> {
        self.run(PostgresBatchStore::adjustments_for_batch(self, tenant_id, batch_id))
    }

    fn update(&self, batch: &Batch, expected_version: ExpectedVersion) -> Result<Batch, BatchStoreError> {
        self.run(PostgresBatchStore::update(self, batch, expected_version))
    }
}

/// Map SQLx errors to `BatchStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> BatchStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => BatchStoreError::Duplicate(msg),
                Some("23514") => BatchStoreError::Rejected(DomainError::invariant(msg)),
                _ => BatchStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            BatchStoreError::Backend(format!("connection pool closed in {}", operation))
        }
        other => BatchStoreError::Backend(format!("{} failed: {}", operation, other)),
    }
}

fn money_to_db(value: u64) -> Result<i64, BatchStoreError> {
    i64::try_from(value)
        .map_err(|_| BatchStoreError::Rejected(DomainError::validation(format!("amount {value} out of range"))))
}

fn money_from_db(value: i64) -> Result<u64, BatchStoreError> {
    u64::try_from(value).map_err(|_| BatchStoreError::Backend(format!("negative amount {value} in row")))
}

fn version_to_db(value: u64) -> Result<i64, BatchStoreError> {
    i64::try_from(value).map_err(|_| BatchStoreError::Backend(format!("version {value} out of range")))
}

fn decode_filtered(rows: &[PgRow], filter: &InventoryFilter, today: NaiveDate) -> Result<Vec<Batch>, BatchStoreError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let batch = decode_batch(row)?;
        if filter.matches(&batch, today) {
            out.push(batch);
        }
    }
    Ok(out)
}

fn decode_batch(row: &PgRow) -> Result<Batch, BatchStoreError> {
    BatchRow::from_row(row)
        .map_err(|e| BatchStoreError::Backend(format!("failed to deserialize batch row: {}", e)))?
        .try_into()
}

fn decode_adjustment(row: &PgRow) -> Result<AdjustmentRecord, BatchStoreError> {
    AdjustmentRow::from_row(row)
        .map_err(|e| BatchStoreError::Backend(format!("failed to deserialize adjustment row: {}", e)))?
        .try_into()
}

// SQLx row types

#[derive(Debug)]
struct BatchRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    product_id: uuid::Uuid,
    batch_number: String,
    expiry_date: Option<NaiveDate>,
    on_hand: i64,
    reserved: i64,
    last_purchase_price: i64,
    average_cost: i64,
    min_sale_price: i64,
    sale_price: i64,
    retail_price: i64,
    invoice_price: i64,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for BatchRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            product_id: row.try_get("product_id")?,
            batch_number: row.try_get("batch_number")?,
            expiry_date: row.try_get("expiry_date")?,
            on_hand: row.try_get("on_hand")?,
            reserved: row.try_get("reserved")?,
            last_purchase_price: row.try_get("last_purchase_price")?,
            average_cost: row.try_get("average_cost")?,
            min_sale_price: row.try_get("min_sale_price")?,
            sale_price: row.try_get("sale_price")?,
            retail_price: row.try_get("retail_price")?,
            invoice_price: row.try_get("invoice_price")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<BatchRow> for Batch {
    type Error = BatchStoreError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        let batch_number = BatchNumber::parse(&row.batch_number)
            .map_err(|e| BatchStoreError::Backend(format!("stored batch number is invalid: {e}")))?;
        Ok(Batch {
            id: BatchId::new(EntityId::from_uuid(row.id)),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            product_id: ProductId::new(EntityId::from_uuid(row.product_id)),
            batch_number,
            expiry_date: row.expiry_date,
            on_hand: row.on_hand,
            reserved: row.reserved,
            last_purchase_price: money_from_db(row.last_purchase_price)?,
            average_cost: money_from_db(row.average_cost)?,
            pricing: BatchPricing {
                min_sale_price: money_from_db(row.min_sale_price)?,
                sale_price: money_from_db(row.sale_price)?,
                retail_price: money_from_db(row.retail_price)?,
                invoice_price: money_from_db(row.invoice_price)?,
            },
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version.max(0) as u64,
        })
    }
}

#[derive(Debug)]
struct AdjustmentRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    batch_id: uuid::Uuid,
    product_id: uuid::Uuid,
    delta: i64,
    reason: String,
    actor_id: uuid::Uuid,
    on_hand_after: i64,
    occurred_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AdjustmentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AdjustmentRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            batch_id: row.try_get("batch_id")?,
            product_id: row.try_get("product_id")?,
            delta: row.try_get("delta")?,
            reason: row.try_get("reason")?,
            actor_id: row.try_get("actor_id")?,
            on_hand_after: row.try_get("on_hand_after")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

impl TryFrom<AdjustmentRow> for AdjustmentRecord {
    type Error = BatchStoreError;

    fn try_from(row: AdjustmentRow) -> Result<Self, Self::Error> {
        let reason = AdjustmentReason::parse(&row.reason)
            .map_err(|e| BatchStoreError::Backend(format!("stored adjustment reason is invalid: {e}")))?;
        Ok(AdjustmentRecord {
            id: AdjustmentId::new(EntityId::from_uuid(row.id)),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            batch_id: BatchId::new(EntityId::from_uuid(row.batch_id)),
            product_id: ProductId::new(EntityId::from_uuid(row.product_id)),
            delta: row.delta,
            reason,
            actor: UserId::from_uuid(row.actor_id),
            on_hand_after: row.on_hand_after,
            occurred_at: row.occurred_at,
        })
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a reachable Postgres (`DATABASE_URL`) and are ignored
    //! by default: `cargo test -p stockledger-infra -- --ignored`.

    use super::*;
    use stockledger_inventory::NewBatch;

    struct Harness {
        _runtime: tokio::runtime::Runtime,
        store: PostgresBatchStore,
    }

    fn harness() -> Harness {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let pool = runtime.block_on(PgPool::connect(&url)).unwrap();
        let store = PostgresBatchStore::new(pool, runtime.handle().clone());
        runtime.block_on(store.migrate()).unwrap();
        Harness {
            _runtime: runtime,
            store,
        }
    }

    fn new_batch(tenant_id: TenantId, on_hand: i64) -> Batch {
        Batch::create(
            BatchId::new(EntityId::new()),
            NewBatch {
                tenant_id,
                product_id: ProductId::new(EntityId::new()),
                batch_number: BatchNumber::parse("PG-1").unwrap(),
                expiry_date: NaiveDate::from_ymd_opt(2030, 1, 1),
                quantity: on_hand,
                unit_cost: 120,
                pricing: BatchPricing::default(),
                occurred_at: Utc::now(),
            },
        )
        .unwrap()
    }

    #[test]
    #[ignore]
    fn guarded_update_rejects_overdraw_and_stale_versions() {
        let h = harness();
        let store: &dyn BatchStore = &h.store;
        let tenant_id = TenantId::new();
        let batch = store.create(new_batch(tenant_id, 10)).unwrap();

        let after = store
            .apply_delta(tenant_id, batch.id, StockDelta::reserve(10), ExpectedVersion::Exact(1), Utc::now())
            .unwrap();
        assert_eq!(after.version, 2);

        let overdraw = store
            .apply_delta(tenant_id, batch.id, StockDelta::reserve(1), ExpectedVersion::Any, Utc::now())
            .unwrap_err();
        assert!(matches!(overdraw, BatchStoreError::Rejected(_)));

        let stale = store
            .apply_delta(tenant_id, batch.id, StockDelta::release(1), ExpectedVersion::Exact(1), Utc::now())
            .unwrap_err();
        assert!(matches!(stale, BatchStoreError::Concurrency(_)));
    }

    #[test]
    #[ignore]
    fn adjustment_and_audit_row_commit_together() {
        let h = harness();
        let store: &dyn BatchStore = &h.store;
        let tenant_id = TenantId::new();
        let batch = store.create(new_batch(tenant_id, 10)).unwrap();

        let record = AdjustmentRecord {
            id: AdjustmentId::new(EntityId::new()),
            tenant_id,
            batch_id: batch.id,
            product_id: batch.product_id,
            delta: -4,
            reason: AdjustmentReason::parse("stock count").unwrap(),
            actor: UserId::new(),
            on_hand_after: 0,
            occurred_at: Utc::now(),
        };
        let (after, stored) = store.apply_adjustment(record.clone(), ExpectedVersion::Any).unwrap();
        assert_eq!(after.on_hand, 6);
        assert_eq!(stored.on_hand_after, 6);

        let too_much = AdjustmentRecord {
            id: AdjustmentId::new(EntityId::new()),
            delta: -7,
            ..record
        };
        assert!(store.apply_adjustment(too_much, ExpectedVersion::Any).is_err());
        assert_eq!(store.adjustments_for_batch(tenant_id, batch.id).unwrap().len(), 1);
    }

    #[test]
    fn sync_calls_on_a_current_thread_runtime_fail_instead_of_blocking() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            // Lazy: nothing connects unless a query actually runs.
            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/stockledger")
                .unwrap();
            let store = PostgresBatchStore::new(pool, Handle::current());

            let err = BatchStore::get(&store, TenantId::new(), BatchId::new(EntityId::new())).unwrap_err();
            assert!(matches!(err, BatchStoreError::Backend(msg) if msg.contains("multi-threaded")));
        });
    }
}


use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, Entity, EntityId, TenantId, Versioned};

/// Product identifier. Products are owned by the catalog; the ledger only
/// references them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub EntityId);

impl ProductId {
    pub fn new(id: EntityId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Batch identifier (tenant-scoped via the `tenant_id` field of the row).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub EntityId);

impl BatchId {
    pub fn new(id: EntityId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Supplier/lot number printed on the goods. Unique per tenant + product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchNumber(String);

impl BatchNumber {
    pub const MAX_LEN: usize = 64;

    pub fn parse(raw: impl AsRef<str>) -> DomainResult<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("batch number cannot be empty"));
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(DomainError::validation(format!(
                "batch number cannot exceed {} characters",
                Self::MAX_LEN
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BatchNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BatchNumber> for String {
    fn from(value: BatchNumber) -> Self {
        value.0
    }
}

impl core::fmt::Display for BatchNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selling prices attached to a batch, in smallest currency unit (e.g. cents).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPricing {
    /// Floor below which a sale line is rejected.
    pub min_sale_price: u64,
    pub sale_price: u64,
    pub retail_price: u64,
    pub invoice_price: u64,
}

impl BatchPricing {
    pub fn validate(&self) -> DomainResult<()> {
        if self.sale_price > 0 && self.sale_price < self.min_sale_price {
            return Err(DomainError::validation(
                "sale_price cannot be below min_sale_price",
            ));
        }
        Ok(())
    }

    pub fn allows(&self, unit_price: u64) -> bool {
        unit_price >= self.min_sale_price
    }
}

/// Signed change applied to a batch's quantities.
///
/// This is the only way quantities move. Every flow (reservation, consumption,
/// release, reversal, intake, adjustment) is expressed as one of these.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDelta {
    pub on_hand: i64,
    pub reserved: i64,
}

impl StockDelta {
    pub fn new(on_hand: i64, reserved: i64) -> Self {
        Self { on_hand, reserved }
    }

    /// Hold `n` units without removing them from on-hand.
    pub fn reserve(n: i64) -> Self {
        Self::new(0, n)
    }

    /// Drop a hold of `n` units.
    pub fn release(n: i64) -> Self {
        Self::new(0, -n)
    }

    /// Turn a hold of `n` units into permanent removal.
    pub fn consume(n: i64) -> Self {
        Self::new(-n, -n)
    }

    /// Put back `n` previously consumed units as held stock.
    pub fn unconsume(n: i64) -> Self {
        Self::new(n, n)
    }

    /// Plain on-hand change (intake, adjustment, intake reversal).
    pub fn on_hand(n: i64) -> Self {
        Self::new(n, 0)
    }

    pub fn is_zero(&self) -> bool {
        self.on_hand == 0 && self.reserved == 0
    }

    pub fn inverse(&self) -> Self {
        Self::new(-self.on_hand, -self.reserved)
    }
}

/// Input for creating a brand-new batch row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatch {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub batch_number: BatchNumber,
    pub expiry_date: Option<NaiveDate>,
    pub quantity: i64,
    pub unit_cost: u64,
    pub pricing: BatchPricing,
    pub occurred_at: DateTime<Utc>,
}

/// A distinct lot of a product with its own expiry date and cost basis.
///
/// Invariant: `0 <= reserved <= on_hand`. A batch with `on_hand == 0` is
/// depleted but kept for history; batches are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub batch_number: BatchNumber,
    pub expiry_date: Option<NaiveDate>,
    pub on_hand: i64,
    pub reserved: i64,
    pub last_purchase_price: u64,
    pub average_cost: u64,
    pub pricing: BatchPricing,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Batch {
    /// Build the first persisted state of a batch (version 1).
    pub fn create(id: BatchId, new: NewBatch) -> DomainResult<Self> {
        if new.quantity < 0 {
            return Err(DomainError::validation("quantity cannot be negative"));
        }
        new.pricing.validate()?;

        Ok(Self {
            id,
            tenant_id: new.tenant_id,
            product_id: new.product_id,
            batch_number: new.batch_number,
            expiry_date: new.expiry_date,
            on_hand: new.quantity,
            reserved: 0,
            last_purchase_price: new.unit_cost,
            average_cost: new.unit_cost,
            pricing: new.pricing,
            is_active: true,
            created_at: new.occurred_at,
            updated_at: new.occurred_at,
            version: 1,
        })
    }

    /// Sellable quantity: on-hand minus held.
    pub fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }

    pub fn is_depleted(&self) -> bool {
        self.on_hand == 0
    }

    /// Expired batches are past their expiry date (the expiry day itself is
    /// still sellable).
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|d| d < today)
    }

    /// Eligible as an allocation candidate.
    pub fn is_sellable(&self, today: NaiveDate) -> bool {
        self.is_active && !self.is_expired(today) && self.available() > 0
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        check_quantities(self.on_hand, self.reserved)
    }

    /// Quantities that would result from `delta`, validated against the
    /// invariants. Does not mutate.
    pub fn preview(&self, delta: StockDelta) -> DomainResult<(i64, i64)> {
        let on_hand = self
            .on_hand
            .checked_add(delta.on_hand)
            .ok_or_else(|| DomainError::invariant("on_hand overflow"))?;
        let reserved = self
            .reserved
            .checked_add(delta.reserved)
            .ok_or_else(|| DomainError::invariant("reserved overflow"))?;
        check_quantities(on_hand, reserved)?;
        Ok((on_hand, reserved))
    }

    /// Apply a quantity change and bump the version.
    ///
    /// Never clamps: a delta that would break `0 <= reserved <= on_hand` is
    /// rejected and leaves the batch untouched.
    pub fn apply_delta(&mut self, delta: StockDelta, at: DateTime<Utc>) -> DomainResult<()> {
        let (on_hand, reserved) = self.preview(delta)?;
        self.on_hand = on_hand;
        self.reserved = reserved;
        self.touch(at);
        Ok(())
    }

    /// Merge an incoming purchase: add quantity and take the new average cost.
    pub fn replenish(
        &mut self,
        quantity: i64,
        unit_cost: u64,
        average_cost: u64,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if quantity <= 0 {
            return Err(DomainError::validation("replenish quantity must be positive"));
        }
        let (on_hand, reserved) = self.preview(StockDelta::on_hand(quantity))?;
        self.on_hand = on_hand;
        self.reserved = reserved;
        self.last_purchase_price = unit_cost;
        self.average_cost = average_cost;
        self.is_active = true;
        self.touch(at);
        Ok(())
    }

    /// Take the batch out of circulation. Held stock must be released first.
    pub fn deactivate(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_active {
            return Err(DomainError::invariant("batch is already inactive"));
        }
        if self.reserved > 0 {
            return Err(DomainError::invariant(
                "cannot deactivate a batch with reserved stock",
            ));
        }
        self.is_active = false;
        self.touch(at);
        Ok(())
    }

    pub fn reprice(&mut self, pricing: BatchPricing, at: DateTime<Utc>) -> DomainResult<()> {
        pricing.validate()?;
        self.pricing = pricing;
        self.touch(at);
        Ok(())
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.version += 1;
    }
}

impl Entity for Batch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Versioned for Batch {
    fn version(&self) -> u64 {
        self.version
    }
}

fn check_quantities(on_hand: i64, reserved: i64) -> DomainResult<()> {
    if on_hand < 0 {
        return Err(DomainError::invariant("on_hand cannot go negative"));
    }
    if reserved < 0 {
        return Err(DomainError::invariant("reserved cannot go negative"));
    }
    if reserved > on_hand {
        return Err(DomainError::invariant("reserved cannot exceed on_hand"));
    }
    Ok(())
}

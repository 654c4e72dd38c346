//! Collaborator lookups: products, customers and employees are owned by
//! other parts of the system. The ledger only asks whether they exist for
//! the calling tenant.

mod tenant_store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stockledger_core::TenantId;
use stockledger_inventory::ProductId;
use stockledger_sales::{CustomerId, EmployeeId};

pub use tenant_store::{InMemoryTenantStore, TenantStore};

pub trait ProductDirectory: Send + Sync {
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool;
}

pub trait PartyDirectory: Send + Sync {
    fn customer_exists(&self, tenant_id: TenantId, customer_id: CustomerId) -> bool;
    fn employee_exists(&self, tenant_id: TenantId, employee_id: EmployeeId) -> bool;
}

/// Everything the sales flow needs to validate a document.
pub trait Directory: ProductDirectory + PartyDirectory {}

impl<T: ProductDirectory + PartyDirectory> Directory for T {}

impl<S: ProductDirectory + ?Sized> ProductDirectory for Arc<S> {
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        (**self).product_exists(tenant_id, product_id)
    }
}

impl<S: PartyDirectory + ?Sized> PartyDirectory for Arc<S> {
    fn customer_exists(&self, tenant_id: TenantId, customer_id: CustomerId) -> bool {
        (**self).customer_exists(tenant_id, customer_id)
    }

    fn employee_exists(&self, tenant_id: TenantId, employee_id: EmployeeId) -> bool {
        (**self).employee_exists(tenant_id, employee_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRecord {
    pub name: String,
}

/// In-memory directory for tests/dev, fed by whoever owns the catalog and
/// party data.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    products: InMemoryTenantStore<ProductId, ProductRecord>,
    customers: InMemoryTenantStore<CustomerId, PartyRecord>,
    employees: InMemoryTenantStore<EmployeeId, PartyRecord>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_product(&self, tenant_id: TenantId, product_id: ProductId, name: impl Into<String>) {
        self.products.upsert(
            tenant_id,
            product_id,
            ProductRecord {
                id: product_id,
                name: name.into(),
            },
        );
    }

    pub fn register_customer(&self, tenant_id: TenantId, customer_id: CustomerId, name: impl Into<String>) {
        self.customers
            .upsert(tenant_id, customer_id, PartyRecord { name: name.into() });
    }

    pub fn register_employee(&self, tenant_id: TenantId, employee_id: EmployeeId, name: impl Into<String>) {
        self.employees
            .upsert(tenant_id, employee_id, PartyRecord { name: name.into() });
    }

    pub fn remove_product(&self, tenant_id: TenantId, product_id: ProductId) {
        self.products.remove(tenant_id, &product_id);
    }

    pub fn products(&self, tenant_id: TenantId) -> Vec<ProductRecord> {
        self.products.list(tenant_id)
    }
}

impl ProductDirectory for InMemoryDirectory {
    fn product_exists(&self, tenant_id: TenantId, product_id: ProductId) -> bool {
        self.products.get(tenant_id, &product_id).is_some()
    }
}

impl PartyDirectory for InMemoryDirectory {
    fn customer_exists(&self, tenant_id: TenantId, customer_id: CustomerId) -> bool {
        self.customers.get(tenant_id, &customer_id).is_some()
    }

    fn employee_exists(&self, tenant_id: TenantId, employee_id: EmployeeId) -> bool {
        self.employees.get(tenant_id, &employee_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::EntityId;

    #[test]
    fn lookups_are_tenant_scoped() {
        let dir = InMemoryDirectory::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let product_id = ProductId::new(EntityId::new());
        let customer_id = CustomerId::new(EntityId::new());

        dir.register_product(tenant_a, product_id, "Paracetamol 500mg");
        dir.register_customer(tenant_a, customer_id, "City Pharmacy");

        assert!(dir.product_exists(tenant_a, product_id));
        assert!(!dir.product_exists(tenant_b, product_id));
        assert!(dir.customer_exists(tenant_a, customer_id));
        assert!(!dir.customer_exists(tenant_b, customer_id));
        assert_eq!(dir.products(tenant_a).len(), 1);

        dir.remove_product(tenant_a, product_id);
        assert!(!dir.product_exists(tenant_a, product_id));
    }
}

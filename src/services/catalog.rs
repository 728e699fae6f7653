use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;

/// The fields of a catalog product the order core copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CatalogProduct {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Read-only view of the product catalog.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn product(&self, id: Uuid) -> Result<Option<CatalogProduct>, ServiceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: DashMap<Uuid, CatalogProduct>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = CatalogProduct>) -> Self {
        let catalog = Self::new();
        for product in products {
            catalog.upsert(product);
        }
        catalog
    }

    /// Loads a JSON array of products.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::InternalError(format!("reading catalog {}: {}", path.display(), e))
        })?;
        let products: Vec<CatalogProduct> = serde_json::from_str(&raw).map_err(|e| {
            ServiceError::InternalError(format!("parsing catalog {}: {}", path.display(), e))
        })?;
        info!(count = products.len(), path = %path.display(), "catalog loaded");
        Ok(Self::with_products(products))
    }

    pub fn upsert(&self, product: CatalogProduct) {
        self.products.insert(product.id, product);
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

#[async_trait]
impl ProductCatalog for InMemoryCatalog {
    async fn product(&self, id: Uuid) -> Result<Option<CatalogProduct>, ServiceError> {
        Ok(self.products.get(&id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[tokio::test]
    async fn loads_products_from_json() {
        let id = Uuid::new_v4();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "{}", "name": "Desk Lamp", "price": "500.00"}}]"#,
            id
        )
        .unwrap();

        let catalog = InMemoryCatalog::from_json_file(file.path()).unwrap();
        let product = catalog.product(id).await.unwrap().unwrap();
        assert_eq!(product.name, "Desk Lamp");
        assert_eq!(product.price, dec!(500));
        assert!(product.active);
        assert!(catalog.product(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(InMemoryCatalog::from_json_file(file.path()).is_err());
    }
}

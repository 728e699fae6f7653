use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const ORDERS: &str = "orders";

/// Monotonic counters backing human-facing order numbers.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_number_sequences")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    pub last_value: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub fn format_order_number(value: i64) -> String {
    format!("ORD-{:06}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_are_zero_padded() {
        assert_eq!(format_order_number(1), "ORD-000001");
        assert_eq!(format_order_number(1234567), "ORD-1234567");
    }
}

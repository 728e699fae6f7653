pub use sea_orm_migration::prelude::*;

mod m20241001_000001_create_carts_tables;
mod m20241001_000002_create_coupons_table;
mod m20241001_000003_create_orders_tables;
mod m20241001_000004_create_order_number_sequences;
mod m20241001_000005_add_order_indexes;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20241001_000001_create_carts_tables::Migration),
            Box::new(m20241001_000002_create_coupons_table::Migration),
            Box::new(m20241001_000003_create_orders_tables::Migration),
            Box::new(m20241001_000004_create_order_number_sequences::Migration),
            Box::new(m20241001_000005_add_order_indexes::Migration),
        ]
    }
}

use sea_orm_migration::prelude::*;

use crate::m20241001_000003_create_orders_tables::{OrderItems, Orders};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Callback and poll lookups arrive keyed by the gateway's reference
        manager
            .create_index(
                Index::create()
                    .name("idx_orders_gateway_order_id")
                    .table(Orders::Table)
                    .col(Orders::Gateway)
                    .col(Orders::GatewayOrderId)
                    .to_owned(),
            )
            .await?;

        // Order history per user, newest first
        manager
            .create_index(
                Index::create()
                    .name("idx_orders_user_created")
                    .table(Orders::Table)
                    .col(Orders::UserId)
                    .col((Orders::CreatedAt, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        // Reconciliation sweep scans stale pending orders
        manager
            .create_index(
                Index::create()
                    .name("idx_orders_payment_status_created")
                    .table(Orders::Table)
                    .col(Orders::PaymentStatus)
                    .col(Orders::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_order_items_order_id")
                    .table(OrderItems::Table)
                    .col(OrderItems::OrderId)
                    .col(OrderItems::Position)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_order_items_order_id")
                    .table(OrderItems::Table)
                    .to_owned(),
            )
            .await?;
        for name in [
            "idx_orders_gateway_order_id",
            "idx_orders_user_created",
            "idx_orders_payment_status_created",
        ] {
            manager
                .drop_index(Index::drop().name(name).table(Orders::Table).to_owned())
                .await?;
        }
        Ok(())
    }
}

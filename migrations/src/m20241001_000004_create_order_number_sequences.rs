use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

pub const ORDER_SEQUENCE: &str = "orders";

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OrderNumberSequences::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OrderNumberSequences::Name)
                            .string_len(32)
                            .primary_key()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OrderNumberSequences::LastValue)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        let seed = Query::insert()
            .into_table(OrderNumberSequences::Table)
            .columns([OrderNumberSequences::Name, OrderNumberSequences::LastValue])
            .values_panic([ORDER_SEQUENCE.into(), 0i64.into()])
            .to_owned();
        manager.exec_stmt(seed).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OrderNumberSequences::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum OrderNumberSequences {
    Table,
    Name,
    LastValue,
}

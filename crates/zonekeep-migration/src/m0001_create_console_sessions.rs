use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConsoleSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConsoleSessions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConsoleSessions::Machine).string().not_null())
                    .col(ColumnDef::new(ConsoleSessions::Port).integer().not_null())
                    .col(ColumnDef::new(ConsoleSessions::Host).string().not_null())
                    .col(ColumnDef::new(ConsoleSessions::Pid).big_integer().not_null())
                    .col(ColumnDef::new(ConsoleSessions::Status).string().not_null())
                    .col(
                        ColumnDef::new(ConsoleSessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ConsoleSessions::LastAccessedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_console_sessions_machine")
                    .table(ConsoleSessions::Table)
                    .col(ConsoleSessions::Machine)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_console_sessions_status")
                    .table(ConsoleSessions::Table)
                    .col(ConsoleSessions::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_console_sessions_status")
                    .table(ConsoleSessions::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_console_sessions_machine")
                    .table(ConsoleSessions::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ConsoleSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConsoleSessions {
    Table,
    Id,
    Machine,
    Port,
    Host,
    Pid,
    Status,
    CreatedAt,
    LastAccessedAt,
}

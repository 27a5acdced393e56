use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Access requests awaiting (or holding) an approver decision
        manager
            .create_table(
                Table::create()
                    .table(AccessRequests::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccessRequests::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(AccessRequests::Requester))
                    .col(string(AccessRequests::Profile))
                    .col(string(AccessRequests::Justification))
                    .col(big_integer(AccessRequests::DurationSecs))
                    .col(
                        ColumnDef::new(AccessRequests::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(big_integer(AccessRequests::CreatedAt))
                    .col(big_integer(AccessRequests::UpdatedAt))
                    .col(big_integer(AccessRequests::ExpiresAt))
                    .col(string_null(AccessRequests::Approver))
                    .col(string_null(AccessRequests::ApproverComment))
                    .col(
                        ColumnDef::new(AccessRequests::Version)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_requests_requester")
                    .table(AccessRequests::Table)
                    .col(AccessRequests::Requester)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_requests_status")
                    .table(AccessRequests::Table)
                    .col(AccessRequests::Status)
                    .to_owned(),
            )
            .await?;

        // Break-glass events
        manager
            .create_table(
                Table::create()
                    .table(BreakGlassEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BreakGlassEvents::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(BreakGlassEvents::Invoker))
                    .col(string(BreakGlassEvents::Profile))
                    .col(string(BreakGlassEvents::ReasonCode))
                    .col(string(BreakGlassEvents::Justification))
                    .col(big_integer(BreakGlassEvents::DurationSecs))
                    .col(
                        ColumnDef::new(BreakGlassEvents::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(big_integer(BreakGlassEvents::CreatedAt))
                    .col(big_integer(BreakGlassEvents::UpdatedAt))
                    .col(big_integer(BreakGlassEvents::ExpiresAt))
                    .col(string_null(BreakGlassEvents::ClosedBy))
                    .col(string_null(BreakGlassEvents::ClosedReason))
                    .col(string_null(BreakGlassEvents::RequestId))
                    .col(
                        ColumnDef::new(BreakGlassEvents::Version)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_break_glass_events_invoker")
                    .table(BreakGlassEvents::Table)
                    .col(BreakGlassEvents::Invoker)
                    .col(BreakGlassEvents::Profile)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_break_glass_events_status")
                    .table(BreakGlassEvents::Table)
                    .col(BreakGlassEvents::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BreakGlassEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AccessRequests::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum AccessRequests {
    Table,
    Id,
    Requester,
    Profile,
    Justification,
    DurationSecs,
    Status,
    CreatedAt,
    UpdatedAt,
    ExpiresAt,
    Approver,
    ApproverComment,
    Version,
}

#[derive(DeriveIden)]
enum BreakGlassEvents {
    Table,
    Id,
    Invoker,
    Profile,
    ReasonCode,
    Justification,
    DurationSecs,
    Status,
    CreatedAt,
    UpdatedAt,
    ExpiresAt,
    ClosedBy,
    ClosedReason,
    RequestId,
    Version,
}

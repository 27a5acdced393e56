use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ServerSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ServerSessions::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(ServerSessions::User))
                    .col(string(ServerSessions::Profile))
                    .col(
                        ColumnDef::new(ServerSessions::Status)
                            .string()
                            .not_null()
                            .default("active"),
                    )
                    .col(big_integer(ServerSessions::StartedAt))
                    .col(big_integer(ServerSessions::LastAccessAt))
                    .col(big_integer(ServerSessions::ExpiresAt))
                    .col(big_integer(ServerSessions::UpdatedAt))
                    .col(
                        ColumnDef::new(ServerSessions::RequestCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(string(ServerSessions::ServerInstanceId))
                    .col(string(ServerSessions::SourceIdentity))
                    .col(string_null(ServerSessions::DeviceId))
                    .col(string_null(ServerSessions::RevokedBy))
                    .col(string_null(ServerSessions::RevokedReason))
                    .col(
                        ColumnDef::new(ServerSessions::Version)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        for (name, col) in [
            ("idx_server_sessions_user", ServerSessions::User),
            ("idx_server_sessions_status", ServerSessions::Status),
            ("idx_server_sessions_profile", ServerSessions::Profile),
            ("idx_server_sessions_device_id", ServerSessions::DeviceId),
            (
                "idx_server_sessions_server_instance_id",
                ServerSessions::ServerInstanceId,
            ),
        ] {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name(name)
                        .table(ServerSessions::Table)
                        .col(col)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ServerSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ServerSessions {
    Table,
    Id,
    User,
    Profile,
    Status,
    StartedAt,
    LastAccessAt,
    ExpiresAt,
    UpdatedAt,
    RequestCount,
    ServerInstanceId,
    SourceIdentity,
    DeviceId,
    RevokedBy,
    RevokedReason,
    Version,
}

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// Partial indexes are not expressible through the index builder; both
// SQLite and Postgres accept this statement as written.
const CREATE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS \
    idx_break_glass_events_single_active \
    ON break_glass_events (invoker, profile) WHERE status = 'active'";

const DROP_INDEX: &str = "DROP INDEX IF EXISTS idx_break_glass_events_single_active";

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // At most one active break-glass event per invoker and profile
        manager
            .get_connection()
            .execute_unprepared(CREATE_INDEX)
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(DROP_INDEX)
            .await?;
        Ok(())
    }
}

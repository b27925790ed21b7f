use sea_orm::sea_query::{ColumnDef, Index, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection};

use crate::entity::kv_entries;
use any2json_domain::storage::StorageResult;

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let backend = db.get_database_backend();

    let kv_table = Table::create()
        .table(kv_entries::Entity)
        .col(
            ColumnDef::new(kv_entries::Column::Namespace)
                .string_len(32)
                .not_null(),
        )
        .col(
            ColumnDef::new(kv_entries::Column::Key)
                .string_len(255)
                .not_null(),
        )
        .col(ColumnDef::new(kv_entries::Column::Value).text().not_null())
        .col(
            ColumnDef::new(kv_entries::Column::Version)
                .big_integer()
                .not_null()
                .default(1),
        )
        .col(
            ColumnDef::new(kv_entries::Column::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .primary_key(
            Index::create()
                .col(kv_entries::Column::Namespace)
                .col(kv_entries::Column::Key),
        )
        .to_owned();
    create_table(db, backend, kv_table).await?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(crate::errors::StorageError::from_source)?;
    Ok(())
}

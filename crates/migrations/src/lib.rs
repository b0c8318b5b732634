pub mod sql;

use indoc::indoc;
use sql::COURIER_MIGRATIONS;
use sqlx::{query, query_as, FromRow, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Database is using courier schema revision {} which includes breaking migration {}, but the currently running worker only supports up to revision {}. It would be unsafe to continue; please ensure all versions of courier are compatible.", .latest_migration, .latest_breaking_migration, .highest_migration)]
    IncompatibleRevision {
        latest_migration: i64,
        latest_breaking_migration: i64,
        highest_migration: u32,
    },
    #[error("Error occured while migrate: {0}")]
    SqlError(#[from] sqlx::Error),
}

#[derive(FromRow, Default, Debug)]
pub struct LastMigration {
    id: Option<i64>,
    biggest_breaking_id: Option<i64>,
}

impl LastMigration {
    fn is_before_number(&self, migration_number: u32) -> bool {
        self.id.is_none_or(|id| i64::from(migration_number) > id)
    }
}

/// Creates the migrations table if needed and returns the last applied migration.
async fn get_last_migration(pool: &SqlitePool) -> Result<LastMigration, MigrateError> {
    query(indoc! {r#"
        create table if not exists courier_migrations (
            id integer primary key,
            ts integer not null default (cast(strftime('%s', 'now') as integer) * 1000),
            breaking boolean not null default 0
        );
    "#})
    .execute(pool)
    .await?;

    let last_migration = query_as::<_, LastMigration>(indoc! {r#"
        select
            (select id from courier_migrations order by id desc limit 1) as id,
            (select id from courier_migrations where breaking order by id desc limit 1) as biggest_breaking_id;
    "#})
    .fetch_one(pool)
    .await?;

    Ok(last_migration)
}

/// Runs the pending migrations against the database, one transaction per migration.
pub async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    let last_migration = get_last_migration(pool).await?;
    let latest_migration = last_migration.id;
    let latest_breaking_migration = last_migration.biggest_breaking_id;

    let mut highest_migration = 0;
    let mut migrated = false;
    for migration in COURIER_MIGRATIONS.iter() {
        let migration_number = migration.migration_number();

        if migration_number > highest_migration {
            highest_migration = migration_number;
        }

        if last_migration.is_before_number(migration_number) {
            info!(
                migration_number,
                migration_name = migration.name(),
                is_breaking_migration = migration.is_breaking(),
                "Running {} migration {}",
                if migration.is_breaking() {
                    "breaking"
                } else {
                    "backwards-compatible"
                },
                migration.name(),
            );
            let mut tx = pool.begin().await?;
            // Recording the migration first takes the write lock and lets a
            // concurrent migrator that got there first win.
            let recorded = query("insert or ignore into courier_migrations (id, breaking) values (?1, ?2)")
                .bind(i64::from(migration_number))
                .bind(migration.is_breaking())
                .execute(&mut *tx)
                .await?;
            if recorded.rows_affected() == 0 {
                continue;
            }
            migration.execute(&mut *tx).await?;
            tx.commit().await?;
            migrated = true;
        }
    }

    if migrated {
        info!("Migrations complete");
    }

    if let Some(latest_breaking_migration) = latest_breaking_migration {
        if i64::from(highest_migration) < latest_breaking_migration {
            return Err(MigrateError::IncompatibleRevision {
                latest_migration: latest_migration.unwrap_or(0),
                latest_breaking_migration,
                highest_migration,
            });
        }
    }

    if let Some(latest_migration) = latest_migration {
        if i64::from(highest_migration) < latest_migration {
            warn!(
                latest_migration,
                highest_migration,
                "Database is using courier schema revision {}, but the currently running worker only supports up to revision {} which may or may not be compatible. Attempting to continue regardless.",
                latest_migration,
                highest_migration,
            );
        }
    }

    Ok(())
}

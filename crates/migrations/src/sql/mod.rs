use sqlx::SqliteConnection;

pub mod m000001;
pub mod m000002;
pub mod m000003;
pub mod m000004;

pub struct CourierMigration {
    name: &'static str,
    is_breaking: bool,
    pub(crate) stmts: &'static [&'static str],
}

impl CourierMigration {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_breaking(&self) -> bool {
        self.is_breaking
    }

    /// Migration number parsed from its name (`m000003` → 3).
    pub fn migration_number(&self) -> u32 {
        self.name
            .trim_start_matches('m')
            .parse()
            .unwrap_or_default()
    }

    pub async fn execute(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        for stmt in self.stmts {
            sqlx::query(stmt).execute(&mut *conn).await?;
        }

        Ok(())
    }
}

pub const COURIER_MIGRATIONS: &[CourierMigration] = &[
    m000001::M000001_MIGRATION,
    m000002::M000002_MIGRATION,
    m000003::M000003_MIGRATION,
    m000004::M000004_MIGRATION,
];

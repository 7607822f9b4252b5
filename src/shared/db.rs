use std::time::Duration;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use log::{info, warn};

use crate::config::DatabaseConfig;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to the primary endpoint, then the local fallback. Both failing is
/// fatal for the caller; there is no degraded no-database mode.
pub fn connect_with_fallback(config: &DatabaseConfig, online: bool) -> anyhow::Result<DbPool> {
    if online {
        match try_connect(&config.primary_url) {
            Ok(pool) => {
                info!("connected to primary database");
                return Ok(pool);
            }
            Err(e) => warn!("primary database unreachable: {e}; trying local fallback"),
        }
    } else {
        warn!("offline; skipping primary database endpoint");
    }

    let pool = try_connect(&config.fallback_url)?;
    info!("connected to fallback database");
    Ok(pool)
}

fn try_connect(database_url: &str) -> anyhow::Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .connection_timeout(CONNECT_TIMEOUT)
        .build(manager)?;
    // r2d2 builds lazily in some configurations; force a real checkout.
    pool.get()?;
    Ok(pool)
}

pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migration failure: {e}"))?;
    Ok(())
}

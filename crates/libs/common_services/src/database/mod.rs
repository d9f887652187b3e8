use app_state::AppSettings;
use color_eyre::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Get a database connection pool, optionally running the embedded migrations first.
///
/// # Errors
///
/// * `PgPool::connect` can return an error if the database connection fails.
/// * `sqlx::migrate` can return an error if migrations fail.
pub async fn get_db_pool(settings: &AppSettings, run_migrations: bool) -> Result<PgPool> {
    let db = &settings.database;
    info!("Connecting to database.");
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .min_connections(db.min_connections)
        .max_lifetime(Duration::from_secs(db.max_lifetime))
        .idle_timeout(Duration::from_secs(db.idle_timeout))
        .acquire_timeout(Duration::from_secs(db.acquire_timeout))
        .test_before_acquire(true)
        .connect(&settings.secrets.database_url)
        .await?;

    if run_migrations {
        info!("Running migrations.");
        sqlx::migrate!("./migrations").run(&pool).await?;
    }

    Ok(pool)
}

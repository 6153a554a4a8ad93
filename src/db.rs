use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;
use turso::{Builder, Connection, Database};

use crate::constants::SEED_MODELS;
use crate::error::GatewayError;

/// Global database instance
static DATABASE: OnceCell<Arc<Database>> = OnceCell::const_new();

// ---------------------------------------------------------------------------
// Migration framework
// ---------------------------------------------------------------------------

type MigrationFn =
    fn(&Connection) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>>;

struct Migration {
    version: i64,
    description: &'static str,
    migrate: MigrationFn,
}

/// Ordered list of all migrations. Each migration assumes all prior migrations
/// have already been applied. New migrations are appended at the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core schema: accounts, groups, users, api_keys, subscriptions",
        migrate: migrate_v1,
    },
    Migration {
        version: 2,
        description: "metering: usage_log, models, redeem_codes, proxies",
        migrate: migrate_v2,
    },
    Migration {
        version: 3,
        description: "ops: per-minute metrics rollups, advisory locks",
        migrate: migrate_v3,
    },
];

/// Read the current schema version (0 if table is empty or doesn't exist yet).
async fn get_schema_version(conn: &Connection) -> Result<i64, GatewayError> {
    let mut rows = conn
        .query("SELECT version FROM schema_version LIMIT 1", ())
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to read schema version: {e}")))?;
    let version = rows
        .next()
        .await
        .ok()
        .flatten()
        .and_then(|r| r.get::<i64>(0).ok())
        .unwrap_or(0);
    Ok(version)
}

/// Set the schema version (insert or update the single row).
async fn set_schema_version(conn: &Connection, version: i64) -> Result<(), GatewayError> {
    conn.execute("DELETE FROM schema_version", ())
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to clear schema version: {e}")))?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        (version,),
    )
    .await
    .map_err(|e| GatewayError::Database(format!("Failed to set schema version: {e}")))?;
    Ok(())
}

/// Run all pending migrations.
async fn run_migrations(conn: &Connection) -> Result<(), GatewayError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        (),
    )
    .await
    .map_err(|e| GatewayError::Database(format!("Failed to create schema_version table: {e}")))?;

    let mut current = get_schema_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current {
            info!(
                "Running migration v{}: {}",
                migration.version, migration.description
            );
            (migration.migrate)(conn).await?;
            set_schema_version(conn, migration.version).await?;
            current = migration.version;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Init + access
// ---------------------------------------------------------------------------

/// Initialize the database at the given path and run migrations.
pub async fn init_db(path: &Path) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GatewayError::Database(format!("Failed to create data dir: {e}")))?;
    }

    let db = Builder::new_local(path.to_string_lossy().as_ref())
        .build()
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to open database: {e}")))?;

    let db = Arc::new(db);
    let conn = db
        .connect()
        .map_err(|e| GatewayError::Database(format!("Failed to connect: {e}")))?;
    run_migrations(&conn).await?;

    DATABASE
        .set(db)
        .map_err(|_| GatewayError::Database("Database already initialized".to_string()))?;
    Ok(())
}

/// Initialize an in-memory database (tests). Safe to call repeatedly — only
/// the first call creates the database.
pub async fn init_memory() -> Result<(), GatewayError> {
    DATABASE
        .get_or_try_init(|| async {
            let db = Builder::new_local(":memory:")
                .build()
                .await
                .map_err(|e| GatewayError::Database(format!("Failed to open memory db: {e}")))?;
            let db = Arc::new(db);
            let conn = db
                .connect()
                .map_err(|e| GatewayError::Database(format!("Failed to connect: {e}")))?;
            run_migrations(&conn).await?;
            Ok::<_, GatewayError>(db)
        })
        .await?;
    Ok(())
}

/// Get a connection to the global database.
pub async fn get_conn() -> Result<Connection, GatewayError> {
    let db = DATABASE
        .get()
        .ok_or_else(|| GatewayError::Database("Database not initialized".to_string()))?;
    db.connect()
        .map_err(|e| GatewayError::Database(format!("Failed to connect: {e}")))
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Seed the models table with default pricing if it's empty.
async fn seed_models_if_empty(conn: &Connection) -> Result<(), GatewayError> {
    let mut count_rows = conn
        .query("SELECT COUNT(*) FROM models", ())
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to count models: {e}")))?;
    let model_count: i64 = count_rows
        .next()
        .await
        .ok()
        .flatten()
        .and_then(|r| r.get::<i64>(0).ok())
        .unwrap_or(0);

    if model_count == 0 {
        info!("Seeding models table with {} default models", SEED_MODELS.len());
        for &(id, input_price, output_price, cache_read_price, cache_write_price) in SEED_MODELS {
            conn.execute(
                "INSERT INTO models (id, input_price, output_price, cache_read_price, cache_write_price) VALUES (?, ?, ?, ?, ?)",
                (id, input_price, output_price, cache_read_price, cache_write_price),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to seed model {id}: {e}")))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Migration v1 — core schema
// ---------------------------------------------------------------------------

fn migrate_v1(
    conn: &Connection,
) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                account_type TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                credentials TEXT NOT NULL DEFAULT '{}',
                extra TEXT NOT NULL DEFAULT '{}',
                proxy_id TEXT,
                concurrency INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 50,
                status TEXT NOT NULL DEFAULT 'active',
                schedulable INTEGER NOT NULL DEFAULT 1,
                session_window_start INTEGER,
                session_window_end INTEGER,
                session_window_status TEXT NOT NULL DEFAULT '',
                rate_limit_reset_at INTEGER,
                overloaded_until INTEGER,
                temp_unschedulable_until INTEGER,
                temp_unschedulable_reason TEXT NOT NULL DEFAULT '',
                last_used_at INTEGER,
                error_message TEXT NOT NULL DEFAULT '',
                crs_account_id TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create accounts table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                platform TEXT NOT NULL,
                rate_multiplier REAL NOT NULL DEFAULT 1.0,
                is_exclusive INTEGER NOT NULL DEFAULT 0,
                subscription_type TEXT NOT NULL DEFAULT 'standard',
                daily_limit_usd REAL,
                weekly_limit_usd REAL,
                monthly_limit_usd REAL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create groups table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS account_groups (
                account_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                PRIMARY KEY (account_id, group_id)
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create account_groups table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL DEFAULT 'user',
                status TEXT NOT NULL DEFAULT 'active',
                balance REAL NOT NULL DEFAULT 0,
                concurrency INTEGER NOT NULL DEFAULT 0,
                allowed_groups TEXT NOT NULL DEFAULT '[]',
                token_version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create users table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                key TEXT NOT NULL UNIQUE,
                group_id TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL,
                last_used_at INTEGER
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create api_keys table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS user_subscriptions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                starts_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                daily_window_start INTEGER,
                daily_usage_usd REAL NOT NULL DEFAULT 0,
                weekly_window_start INTEGER,
                weekly_usage_usd REAL NOT NULL DEFAULT 0,
                monthly_window_start INTEGER,
                monthly_usage_usd REAL NOT NULL DEFAULT 0,
                assigned_by TEXT NOT NULL DEFAULT '',
                notes TEXT NOT NULL DEFAULT '',
                UNIQUE (user_id, group_id)
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            GatewayError::Database(format!("Failed to create user_subscriptions table: {e}"))
        })?;

        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Migration v2 — metering + entitlements
// ---------------------------------------------------------------------------

fn migrate_v2(
    conn: &Connection,
) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                api_key_id TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                cache_write_tokens INTEGER NOT NULL DEFAULT 0,
                cost_microdollars INTEGER NOT NULL DEFAULT 0,
                stream INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                first_token_ms INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create usage_log table: {e}")))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_log_account_time ON usage_log (account_id, created_at)",
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to index usage_log: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                input_price REAL NOT NULL DEFAULT 0,
                output_price REAL NOT NULL DEFAULT 0,
                cache_read_price REAL NOT NULL DEFAULT 0,
                cache_write_price REAL NOT NULL DEFAULT 0
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create models table: {e}")))?;

        seed_models_if_empty(conn).await?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS redeem_codes (
                code TEXT PRIMARY KEY,
                code_type TEXT NOT NULL,
                value REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'unused',
                group_id TEXT,
                validity_days INTEGER NOT NULL DEFAULT 0,
                used_by TEXT,
                used_at INTEGER
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create redeem_codes table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id TEXT PRIMARY KEY,
                protocol TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT ''
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create proxies table: {e}")))?;

        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Migration v3 — ops rollups + advisory locks
// ---------------------------------------------------------------------------

fn migrate_v3(
    conn: &Connection,
) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>> {
    Box::pin(async move {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ops_metrics (
                minute INTEGER PRIMARY KEY,
                requests INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_microdollars INTEGER NOT NULL DEFAULT 0
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create ops_metrics table: {e}")))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS advisory_locks (
                name_hash INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            (),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to create advisory_locks table: {e}")))?;

        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Row helpers shared by the stores
// ---------------------------------------------------------------------------

/// Read an i64 column, defaulting to 0 on NULL or type mismatch.
pub fn get_i64(row: &turso::Row, idx: usize) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

/// Read an optional i64 column (NULL → None).
pub fn opt_i64(row: &turso::Row, idx: usize) -> Option<i64> {
    row.get::<i64>(idx).ok()
}

/// Read a string column, defaulting to "".
pub fn get_string(row: &turso::Row, idx: usize) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Read an optional string column (NULL → None).
pub fn opt_string(row: &turso::Row, idx: usize) -> Option<String> {
    row.get::<String>(idx).ok().filter(|s| !s.is_empty())
}

/// Read an f64 column, defaulting to 0.0.
pub fn get_f64(row: &turso::Row, idx: usize) -> f64 {
    row.get::<f64>(idx).unwrap_or(0.0)
}

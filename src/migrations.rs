//! 数据库迁移模块
//!
//! 版本 1 是基线（`SCHEMA_SQL` 创建的表结构）；之后的表结构变更按版本追加到
//! `MIGRATIONS`，待执行的迁移在同一事务中执行并记录到 `schema_migrations`。

use rusqlite::{Connection, Result as SqliteResult};
use tracing::{info, warn};

/// 迁移函数
type MigrationFn = fn(&Connection) -> SqliteResult<()>;

/// 单个迁移
struct Migration {
    version: i64,
    name: &'static str,
    apply: MigrationFn,
}

/// 全部迁移，按版本递增
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "baseline schema",
    apply: baseline,
}];

/// 迁移 1: 基线，表结构由 `SCHEMA_SQL` 创建
fn baseline(_conn: &Connection) -> SqliteResult<()> {
    Ok(())
}

/// 初始化迁移系统
pub fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    // 创建迁移版本表
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    Ok(())
}

/// 获取当前数据库版本
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;

    Ok(version.unwrap_or(0))
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    let current_time_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, current_time_ms],
    )?;

    Ok(())
}

/// 执行所有待应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    apply_migrations(conn, MIGRATIONS)
}

fn apply_migrations(conn: &Connection, migrations: &[Migration]) -> SqliteResult<()> {
    initialize_migrations(conn)?;

    let current_version = get_current_version(conn)?;
    tracing::debug!("Current database version: {}", current_version);

    let target = migrations.iter().map(|m| m.version).max().unwrap_or(0);
    if current_version >= target {
        return Ok(());
    }

    // 执行迁移（事务保证原子性）
    let tx = conn.unchecked_transaction()?;

    for migration in migrations.iter().filter(|m| m.version > current_version) {
        info!("Running migration {:03}: {}", migration.version, migration.name);
        if let Err(e) = (migration.apply)(&tx) {
            warn!("Migration {} failed: {}", migration.version, e);
            return Err(e);
        }
        record_migration(&tx, migration.version)?;
    }

    tx.commit()?;

    info!("All migrations applied successfully, current version: {}", target);
    Ok(())
}

// ==========================================
// 健康数据导入引擎 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 统一 busy_timeout，减少并发读写时的偶发 busy 错误
// - 建表幂等（CREATE ... IF NOT EXISTS）
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::path::PathBuf;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 数据库路径环境变量
pub const DB_PATH_ENV: &str = "HEALTH_IMPORT_DB_PATH";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- 每个种类一个命名槽位，整段序列以 JSON 保存
CREATE TABLE IF NOT EXISTS metric_series (
    slot_key      TEXT PRIMARY KEY,
    payload_json  TEXT NOT NULL,
    sample_count  INTEGER NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS import_history (
    seq                    INTEGER PRIMARY KEY AUTOINCREMENT,
    import_id              TEXT NOT NULL UNIQUE,
    imported_at            TEXT NOT NULL,
    source_file_name       TEXT NOT NULL,
    source_file_size_bytes INTEGER NOT NULL,
    source_format          TEXT NOT NULL,
    per_kind_counts_json   TEXT NOT NULL,
    range_start            TEXT,
    range_end              TEXT,
    skipped_records        INTEGER NOT NULL DEFAULT 0,
    elapsed_ms             INTEGER NOT NULL DEFAULT 0
);

-- 历史账本仅追加
CREATE TRIGGER IF NOT EXISTS import_history_no_update
BEFORE UPDATE ON import_history
BEGIN
    SELECT RAISE(ABORT, 'import_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS import_history_no_delete
BEFORE DELETE ON import_history
BEGIN
    SELECT RAISE(ABORT, 'import_history is append-only');
END;

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id    TEXT NOT NULL DEFAULT 'global',
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (scope_id, key)
);
"#;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：foreign_keys / busy_timeout 需要"每个连接"单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 建表（幂等）并记录 schema_version
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 默认数据库路径
///
/// 优先级: 环境变量 HEALTH_IMPORT_DB_PATH > 用户数据目录 > 当前目录
pub fn get_default_db_path() -> String {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let base = dirs::data_dir()
        .map(|d| d.join("health-import"))
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = std::fs::create_dir_all(&base) {
        tracing::warn!(dir = %base.display(), error = %e, "无法创建数据目录");
    }
    base.join("health_import.db").to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), None);

        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_history_is_append_only() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO import_history (import_id, imported_at, source_file_name,
                source_file_size_bytes, source_format, per_kind_counts_json)
             VALUES ('a', '2024-01-01T00:00:00Z', 'x.csv', 1, 'tabular', '{}')",
            [],
        )
        .unwrap();

        assert!(conn.execute("DELETE FROM import_history", []).is_err());
        assert!(conn
            .execute("UPDATE import_history SET source_file_name = 'y.csv'", [])
            .is_err());
    }
}

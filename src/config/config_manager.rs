// ==========================================
// 健康数据导入引擎 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::import_config_trait::ImportConfigReader;
use crate::db::{init_schema, open_sqlite_connection};
use crate::importer::error::ImportError;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 后台解析
    pub const PROGRESS_INTERVAL: &str = "import.progress_interval";
    pub const WORKER_CHANNEL_CAPACITY: &str = "import.worker_channel_capacity";

    // 导入结果
    pub const MAX_SKIP_REASONS: &str = "import.max_skip_reasons";
}

/// 默认值
pub mod config_defaults {
    pub const PROGRESS_INTERVAL: usize = 1000;
    pub const WORKER_CHANNEL_CAPACITY: usize = 64;
    pub const MAX_SKIP_REASONS: usize = 20;
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, ImportError> {
        let conn = open_sqlite_connection(db_path).map_err(|e| ImportError::ConfigReadError {
            key: "*".to_string(),
            message: e.to_string(),
        })?;
        init_schema(&conn).map_err(|e| ImportError::ConfigReadError {
            key: "*".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager（调用方负责建表）
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    fn get_config_value(&self, key: &str) -> Result<Option<String>, ImportError> {
        let read_error = |message: String| ImportError::ConfigReadError {
            key: key.to_string(),
            message,
        };

        let conn = self
            .conn
            .lock()
            .map_err(|e| read_error(format!("锁获取失败: {}", e)))?;

        conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| read_error(e.to_string()))
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, ImportError> {
        self.get_config_value(key)
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> Result<(), ImportError> {
        let conn = self.conn.lock().map_err(|e| ImportError::ConfigReadError {
            key: key.to_string(),
            message: format!("锁获取失败: {}", e),
        })?;

        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![key, value],
        )
        .map_err(|e| ImportError::ConfigReadError {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// 获取所有 global 配置的快照
    pub fn get_config_snapshot(&self) -> Result<BTreeMap<String, String>, ImportError> {
        let snapshot_error = |e: String| ImportError::ConfigReadError {
            key: "*".to_string(),
            message: e,
        };
        let conn = self
            .conn
            .lock()
            .map_err(|e| snapshot_error(format!("锁获取失败: {}", e)))?;

        let mut stmt = conn
            .prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")
            .map_err(|e| snapshot_error(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| snapshot_error(e.to_string()))?;

        let mut config_map = BTreeMap::new();
        for row in rows {
            let (key, value) = row.map_err(|e| snapshot_error(e.to_string()))?;
            config_map.insert(key, value);
        }
        Ok(config_map)
    }

    /// 读取正整数配置，缺失或格式错误时使用默认值
    fn get_positive_or_default(&self, key: &str, default: usize) -> Result<usize, ImportError> {
        let Some(value) = self.get_config_value(key)? else {
            return Ok(default);
        };

        match value.trim().parse::<usize>() {
            Ok(v) if v > 0 => Ok(v),
            _ => {
                tracing::warn!(
                    config_key = key,
                    raw_value = %value,
                    default,
                    "配置格式错误，使用默认值"
                );
                Ok(default)
            }
        }
    }
}

// ==========================================
// ImportConfigReader Trait 实现
// ==========================================
#[async_trait]
impl ImportConfigReader for ConfigManager {
    async fn get_progress_interval(&self) -> Result<usize, ImportError> {
        self.get_positive_or_default(
            config_keys::PROGRESS_INTERVAL,
            config_defaults::PROGRESS_INTERVAL,
        )
    }

    async fn get_max_skip_reasons(&self) -> Result<usize, ImportError> {
        self.get_positive_or_default(
            config_keys::MAX_SKIP_REASONS,
            config_defaults::MAX_SKIP_REASONS,
        )
    }

    async fn get_worker_channel_capacity(&self) -> Result<usize, ImportError> {
        self.get_positive_or_default(
            config_keys::WORKER_CHANNEL_CAPACITY,
            config_defaults::WORKER_CHANNEL_CAPACITY,
        )
    }
}

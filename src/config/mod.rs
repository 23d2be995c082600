// ==========================================
// 健康数据导入引擎 - 配置层
// ==========================================
// 职责: 导入参数管理
// 存储: config_kv 表（与数据同库）
// ==========================================

pub mod config_manager;
pub mod import_config_trait;

// 重导出核心配置管理器
pub use config_manager::{config_defaults, config_keys, ConfigManager};
pub use import_config_trait::ImportConfigReader;

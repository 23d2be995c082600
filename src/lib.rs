// ==========================================
// 健康数据导入引擎 - 核心库
// ==========================================
// 技术栈: Rust + SQLite
// 定位: 多来源健康导出文件 → 规范化数据集（按种类覆写）+ 追加式导入历史
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 导入层 - 外部数据
pub mod importer;

// 导出层 - 快照导出
pub mod exporter;

// 配置层 - 导入参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{MetricKind, SourceFormat};

// 领域实体
pub use domain::health::{
    DateRange, HealthDataSet, ImportHistoryEntry, ImportResult, KindSeries, MetricSample,
    NutritionRecord, SkipReason, WorkoutRecord,
};

// 导入
pub use importer::{
    HealthImporter, HealthImporterImpl, ImportError, ImportSource, ProgressEvent,
};

// 存储
pub use repository::{HealthStore, HealthStoreImpl, StoreSnapshot};

// 配置
pub use config::{ConfigManager, ImportConfigReader};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "健康数据导入引擎";

// ==========================================
// 健康数据导入引擎 - 导入层
// ==========================================
// 职责: 外部导出文件 → 规范化健康数据集
// 支持: CSV（表格）, JSON（结构化文档）, XML（层级导出，后台解析）
// ==========================================

// 模块声明
pub mod error;
pub mod file_parser;
pub mod format_classifier;
pub mod health_importer_impl;
pub mod health_importer_trait;
pub mod hierarchical_worker;
pub mod normalizer;
pub mod schema_inference;

// 重导出核心类型
pub use error::{ImportError, ImportStage};
pub use file_parser::{CsvParser, JsonParser, RawRecord, TabularDocument, TreeDocument};
pub use format_classifier::{check_signature, classify};
pub use health_importer_impl::{HealthImporterImpl, PROGRESS_COMPLETE};
pub use hierarchical_worker::{WorkerConfig, WorkerMessage};
pub use normalizer::CanonicalNormalizer;
pub use schema_inference::SchemaInference;

// 重导出 Trait 接口
pub use health_importer_trait::{FileParser, HealthImporter, ImportSource, ProgressEvent};

// ==========================================
// 健康数据导入引擎 - 领域模型层
// ==========================================
// 职责: 定义规范实体与类型
// 红线: 不含数据访问逻辑，不含解析逻辑
// ==========================================

pub mod health;
pub mod types;

// 重导出核心类型
pub use health::{
    empty_counts, DateRange, HealthDataSet, ImportHistoryEntry, ImportResult, KindCounts,
    KindSeries, MetricSample, NutritionRecord, SkipReason, WorkoutRecord,
};
pub use types::{MetricKind, SourceFormat};

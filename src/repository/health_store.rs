// ==========================================
// 健康数据导入引擎 - 健康数据存储 Trait
// ==========================================
// 职责: 定义各种类序列 + 导入历史的数据访问接口
// 红线: 其他组件不得绕过本接口直接访问底层存储
// 红线: 历史账本仅追加，从不修改或删除
// ==========================================

use crate::domain::health::{HealthDataSet, ImportHistoryEntry, KindSeries};
use crate::domain::types::MetricKind;
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// 存储全量快照（导出 / 查看用）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub series: BTreeMap<MetricKind, KindSeries>,
    pub history: Vec<ImportHistoryEntry>, // 按导入先后排序
}

impl StoreSnapshot {
    pub fn count(&self, kind: MetricKind) -> usize {
        self.series.get(&kind).map_or(0, KindSeries::len)
    }
}

// ==========================================
// HealthStore Trait
// ==========================================
// 实现者: HealthStoreImpl（使用 rusqlite）
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// 覆写某种类的序列（仅当 series 非空）
    ///
    /// # 返回
    /// - Ok(true): 已覆写
    /// - Ok(false): series 为空，原数据保持不变
    async fn replace_kind_if_non_empty(
        &self,
        kind: MetricKind,
        series: KindSeries,
    ) -> RepositoryResult<bool>;

    /// 追加一条导入历史
    async fn append_history(&self, entry: ImportHistoryEntry) -> RepositoryResult<()>;

    /// 读取全部序列与历史
    async fn read_all(&self) -> RepositoryResult<StoreSnapshot>;

    /// 读取单个种类（不存在时返回 None）
    async fn read_kind(&self, kind: MetricKind) -> RepositoryResult<Option<KindSeries>>;

    /// 最近的导入历史（新的在前）
    async fn recent_history(&self, limit: usize) -> RepositoryResult<Vec<ImportHistoryEntry>>;

    /// 显式删除某种类的序列
    ///
    /// # 返回
    /// - Ok(true): 已删除
    /// - Ok(false): 原本就不存在
    async fn clear_kind(&self, kind: MetricKind) -> RepositoryResult<bool>;

    /// 单事务提交一次导入: 各非空种类覆写 + 历史追加
    ///
    /// # 返回
    /// - Ok(Vec<MetricKind>): 实际覆写的种类
    /// - Err: 整个事务回滚，存储保持不变
    async fn commit_import(
        &self,
        dataset: &HealthDataSet,
        entry: ImportHistoryEntry,
    ) -> RepositoryResult<Vec<MetricKind>>;
}

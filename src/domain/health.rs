// ==========================================
// 健康数据导入引擎 - 规范数据模型
// ==========================================
// 职责: 规范实体（采样/运动/饮食）、导入历史账本条目、导入结果
// 红线: 实体构造后不可变，Persistent Store 是唯一写入方
// 序列化: camelCase 字段 + RFC 3339 时间（导出器按此形态往返）
// ==========================================

use crate::domain::types::{MetricKind, SourceFormat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 每个种类的记录条数
pub type KindCounts = BTreeMap<MetricKind, usize>;

/// 七个种类全部置零的计数表
pub fn empty_counts() -> KindCounts {
    MetricKind::ALL.into_iter().map(|k| (k, 0)).collect()
}

// ==========================================
// MetricSample - 采样类指标
// ==========================================
// 适用: 心率 / 步数 / 体重 / 睡眠 / 最大摄氧量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub date: DateTime<Utc>, // 采样时间
    pub value: f64,          // 数值（有限值）
    pub unit: String,        // 单位
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>, // 分类（如睡眠阶段）
}

// ==========================================
// WorkoutRecord - 运动记录
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutRecord {
    pub date: DateTime<Utc>,
    pub activity_type: String,
    pub duration: f64, // 有限且非负
    pub duration_unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

// ==========================================
// NutritionRecord - 饮食记录
// ==========================================
// 至少一个热量/宏量字段为有效数值，缺失项按 0 计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutritionRecord {
    pub date: DateTime<Utc>,
    pub item_name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

// ==========================================
// DateRange - 观测时间范围
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn single(ts: DateTime<Utc>) -> Self {
        Self { start: ts, end: ts }
    }

    /// 扩展范围以包含 ts
    pub fn include(&mut self, ts: DateTime<Utc>) {
        if ts < self.start {
            self.start = ts;
        }
        if ts > self.end {
            self.end = ts;
        }
    }

    /// 合并两个可选范围
    pub fn merge(a: Option<DateRange>, b: Option<DateRange>) -> Option<DateRange> {
        match (a, b) {
            (Some(mut x), Some(y)) => {
                x.include(y.start);
                x.include(y.end);
                Some(x)
            }
            (x, None) => x,
            (None, y) => y,
        }
    }

    fn from_dates<I: IntoIterator<Item = DateTime<Utc>>>(dates: I) -> Option<DateRange> {
        let mut range: Option<DateRange> = None;
        for ts in dates {
            match range.as_mut() {
                Some(r) => r.include(ts),
                None => range = Some(DateRange::single(ts)),
            }
        }
        range
    }
}

// ==========================================
// KindSeries - 单个种类的完整序列
// ==========================================
// 存储槽位中保存的就是此结构的 JSON（不带标签，数组形态）
#[derive(Debug, Clone, PartialEq)]
pub enum KindSeries {
    Samples(Vec<MetricSample>),
    Workouts(Vec<WorkoutRecord>),
    Nutrition(Vec<NutritionRecord>),
}

impl KindSeries {
    /// 指定种类的空序列
    pub fn empty_for(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Workout => KindSeries::Workouts(Vec::new()),
            MetricKind::Nutrition => KindSeries::Nutrition(Vec::new()),
            _ => KindSeries::Samples(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KindSeries::Samples(v) => v.len(),
            KindSeries::Workouts(v) => v.len(),
            KindSeries::Nutrition(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn date_range(&self) -> Option<DateRange> {
        match self {
            KindSeries::Samples(v) => DateRange::from_dates(v.iter().map(|s| s.date)),
            KindSeries::Workouts(v) => DateRange::from_dates(v.iter().map(|w| w.date)),
            KindSeries::Nutrition(v) => DateRange::from_dates(v.iter().map(|n| n.date)),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            KindSeries::Samples(v) => serde_json::to_string(v),
            KindSeries::Workouts(v) => serde_json::to_string(v),
            KindSeries::Nutrition(v) => serde_json::to_string(v),
        }
    }

    /// 按种类反序列化槽位内容
    pub fn from_json(kind: MetricKind, raw: &str) -> serde_json::Result<Self> {
        Ok(match kind {
            MetricKind::Workout => KindSeries::Workouts(serde_json::from_str(raw)?),
            MetricKind::Nutrition => KindSeries::Nutrition(serde_json::from_str(raw)?),
            _ => KindSeries::Samples(serde_json::from_str(raw)?),
        })
    }

    pub fn as_samples(&self) -> Option<&[MetricSample]> {
        match self {
            KindSeries::Samples(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_workouts(&self) -> Option<&[WorkoutRecord]> {
        match self {
            KindSeries::Workouts(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_nutrition(&self) -> Option<&[NutritionRecord]> {
        match self {
            KindSeries::Nutrition(v) => Some(v),
            _ => None,
        }
    }
}

impl Serialize for KindSeries {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            KindSeries::Samples(v) => v.serialize(serializer),
            KindSeries::Workouts(v) => v.serialize(serializer),
            KindSeries::Nutrition(v) => v.serialize(serializer),
        }
    }
}

// ==========================================
// HealthDataSet - 单次导入产出的各种类序列
// ==========================================
// 生命周期: 仅在一次导入运行内，成功后整体交给 Store
#[derive(Debug, Clone, Default)]
pub struct HealthDataSet {
    series: BTreeMap<MetricKind, KindSeries>,
}

impl HealthDataSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: MetricKind) -> &mut KindSeries {
        self.series
            .entry(kind)
            .or_insert_with(|| KindSeries::empty_for(kind))
    }

    /// 追加采样（kind 必须是采样类种类，否则忽略）
    pub fn push_sample(&mut self, kind: MetricKind, sample: MetricSample) {
        if let KindSeries::Samples(v) = self.slot(kind) {
            v.push(sample);
        }
    }

    pub fn push_workout(&mut self, workout: WorkoutRecord) {
        if let KindSeries::Workouts(v) = self.slot(MetricKind::Workout) {
            v.push(workout);
        }
    }

    pub fn push_nutrition(&mut self, item: NutritionRecord) {
        if let KindSeries::Nutrition(v) = self.slot(MetricKind::Nutrition) {
            v.push(item);
        }
    }

    pub fn get(&self, kind: MetricKind) -> Option<&KindSeries> {
        self.series.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKind, &KindSeries)> {
        self.series.iter()
    }

    /// 非空种类的迭代
    pub fn non_empty(&self) -> impl Iterator<Item = (&MetricKind, &KindSeries)> {
        self.series.iter().filter(|(_, s)| !s.is_empty())
    }

    /// 七个种类的计数（缺失种类为 0）
    pub fn counts(&self) -> KindCounts {
        let mut counts = empty_counts();
        for (kind, series) in &self.series {
            counts.insert(*kind, series.len());
        }
        counts
    }

    /// 本次触达的所有种类的最小/最大时间
    pub fn date_range(&self) -> Option<DateRange> {
        self.series
            .values()
            .fold(None, |acc, s| DateRange::merge(acc, s.date_range()))
    }

    pub fn total_records(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }
}

// ==========================================
// SkipReason - 单条记录跳过原因（非致命）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipReason {
    pub location: String, // 行号 / 元素序号 / 集合名
    pub reason: String,
}

impl SkipReason {
    pub fn new(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.reason)
    }
}

// ==========================================
// ImportHistoryEntry - 导入历史账本条目
// ==========================================
// 红线: 仅追加，从不修改或删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportHistoryEntry {
    pub import_id: String,                      // 导入 ID（UUID）
    pub imported_at: DateTime<Utc>,             // 导入时间
    pub source_file_name: String,               // 源文件名
    pub source_file_size_bytes: u64,            // 源文件大小
    pub source_format: SourceFormat,            // 源格式
    pub per_kind_counts: KindCounts,            // 各种类记录数
    pub observed_date_range: Option<DateRange>, // 观测时间范围
    pub skipped_records: usize,                 // 跳过记录数
    pub elapsed_ms: u64,                        // 导入耗时（毫秒）
}

// ==========================================
// ImportResult - 导入结果
// ==========================================
// 用途: 导入接口返回值（调用方据此展示成功摘要）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub import_id: String,
    pub source_format: SourceFormat,
    pub per_kind_counts: KindCounts,
    pub observed_date_range: Option<DateRange>,
    pub skipped_records: usize,
    pub skip_reasons: Vec<SkipReason>, // 有界列表（调试用）
}

impl ImportResult {
    pub fn count(&self, kind: MetricKind) -> usize {
        self.per_kind_counts.get(&kind).copied().unwrap_or(0)
    }
}

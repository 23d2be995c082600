// ==========================================
// 健康数据导入引擎 - 领域类型定义
// ==========================================
// 职责: 指标种类 / 源文件格式 枚举
// 序列化格式: camelCase (与导出文件一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 指标种类 (Metric Kind)
// ==========================================
// 引擎可识别的全部规范类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    HeartRate, // 心率
    Steps,     // 步数
    Weight,    // 体重
    Sleep,     // 睡眠时长
    Vo2Max,    // 最大摄氧量
    Workout,   // 运动记录
    Nutrition, // 饮食记录
}

impl MetricKind {
    /// 全部种类（固定顺序）
    pub const ALL: [MetricKind; 7] = [
        MetricKind::HeartRate,
        MetricKind::Steps,
        MetricKind::Weight,
        MetricKind::Sleep,
        MetricKind::Vo2Max,
        MetricKind::Workout,
        MetricKind::Nutrition,
    ];

    /// 存储槽位键（每个种类一个独立槽位）
    pub fn slot_key(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "heart_rate",
            MetricKind::Steps => "steps",
            MetricKind::Weight => "weight",
            MetricKind::Sleep => "sleep",
            MetricKind::Vo2Max => "vo2max",
            MetricKind::Workout => "workouts",
            MetricKind::Nutrition => "nutrition",
        }
    }

    /// 由存储槽位键反解
    pub fn from_slot_key(key: &str) -> Option<Self> {
        MetricKind::ALL.into_iter().find(|k| k.slot_key() == key)
    }

    /// 导出/序列化用名称 (camelCase)
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "heartRate",
            MetricKind::Steps => "steps",
            MetricKind::Weight => "weight",
            MetricKind::Sleep => "sleep",
            MetricKind::Vo2Max => "vo2Max",
            MetricKind::Workout => "workout",
            MetricKind::Nutrition => "nutrition",
        }
    }

    /// 宽松解析: 接受 camelCase 名称或槽位键（大小写不敏感）
    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim();
        MetricKind::ALL.into_iter().find(|k| {
            k.as_str().eq_ignore_ascii_case(needle) || k.slot_key().eq_ignore_ascii_case(needle)
        })
    }

    /// 是否为 {date, value, unit} 形态的采样类指标
    pub fn is_sample_kind(&self) -> bool {
        !matches!(self, MetricKind::Workout | MetricKind::Nutrition)
    }

    /// 默认单位（仅采样类指标）
    pub fn default_unit(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "count/min",
            MetricKind::Steps => "count",
            MetricKind::Weight => "kg",
            MetricKind::Sleep => "hr",
            MetricKind::Vo2Max => "mL/min·kg",
            MetricKind::Workout => "min",
            MetricKind::Nutrition => "kcal",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 源文件格式 (Source Format)
// ==========================================
// Unsupported 只出现在分类结果中，不会写入历史账本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceFormat {
    Tabular,      // 分隔文本 (.csv)
    Tree,         // 结构化文档 (.json)
    Hierarchical, // 标记语言导出 (.xml)
    Unsupported,  // 无法识别
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Tabular => "tabular",
            SourceFormat::Tree => "tree",
            SourceFormat::Hierarchical => "hierarchical",
            SourceFormat::Unsupported => "unsupported",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "tabular" => SourceFormat::Tabular,
            "tree" => SourceFormat::Tree,
            "hierarchical" => SourceFormat::Hierarchical,
            _ => SourceFormat::Unsupported,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_key_roundtrip() {
        for kind in MetricKind::ALL {
            assert_eq!(MetricKind::from_slot_key(kind.slot_key()), Some(kind));
        }
        assert_eq!(MetricKind::from_slot_key("blood_pressure"), None);
    }

    #[test]
    fn test_metric_kind_serde_camel_case() {
        let json = serde_json::to_string(&MetricKind::Vo2Max).unwrap();
        assert_eq!(json, "\"vo2Max\"");
        let kind: MetricKind = serde_json::from_str("\"heartRate\"").unwrap();
        assert_eq!(kind, MetricKind::HeartRate);
    }

    #[test]
    fn test_metric_kind_parse_lenient() {
        assert_eq!(MetricKind::parse("HEARTRATE"), Some(MetricKind::HeartRate));
        assert_eq!(MetricKind::parse("workouts"), Some(MetricKind::Workout));
        assert_eq!(MetricKind::parse("unknown"), None);
    }
}

// ==========================================
// 健康数据导入引擎 - 规范化映射
// ==========================================
// 职责: 松散类型值 + 已确定的种类 → 规范实体
// 规则: 类型转换失败即丢弃记录（返回 SkipReason），不写入空值
// 纯函数，无 I/O
// ==========================================

use crate::domain::health::{
    HealthDataSet, MetricSample, NutritionRecord, SkipReason, WorkoutRecord,
};
use crate::domain::types::MetricKind;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

/// 带时区偏移的日期时间格式（如 "2024-01-01 08:00:00 -0500"）
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%z"];

/// 无时区的日期时间格式（按 UTC 处理）
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y%m%d%H%M%S",
];

/// 纯日期格式（按当日 00:00 UTC 处理）
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%m/%d/%Y", "%d.%m.%Y"];

/// 解析时间戳（字符串或 epoch 秒/毫秒）
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            let raw = n.as_f64()?;
            if !raw.is_finite() || raw < 0.0 {
                return None;
            }
            // 大于 1e11 视为毫秒
            let millis = if raw > 1e11 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

/// 解析时间字符串
pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // 纯数字串: 8 位按 YYYYMMDD，14 位按 YYYYMMDDHHMMSS，其余按 epoch
    if s.chars().all(|c| c.is_ascii_digit()) && s.len() != 8 && s.len() != 14 {
        return s.parse::<i64>().ok().and_then(|n| {
            parse_timestamp(&Value::Number(serde_json::Number::from(n)))
        });
    }

    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }

    None
}

/// 数值转换（仅有限值；去除千分位逗号）
pub fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// 文本转换（数字也按文本输出；空串视为缺失）
pub fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ==========================================
// 规范实体构造
// ==========================================

/// 采样类记录的输入
#[derive(Debug, Clone, Copy)]
pub struct SampleInput<'a> {
    pub date: &'a Value,
    pub value: &'a Value,
    pub unit: Option<&'a Value>,
    pub category: Option<&'a Value>,
}

/// 运动记录的输入
#[derive(Debug, Clone, Copy)]
pub struct WorkoutInput<'a> {
    pub date: &'a Value,
    pub activity_type: Option<&'a Value>,
    pub duration: &'a Value,
    pub duration_unit: Option<&'a Value>,
    pub calories: Option<&'a Value>,
    pub distance: Option<&'a Value>,
}

/// 饮食记录的输入
#[derive(Debug, Clone, Copy)]
pub struct NutritionInput<'a> {
    pub date: &'a Value,
    pub item_name: Option<&'a Value>,
    pub calories: Option<&'a Value>,
    pub protein: Option<&'a Value>,
    pub carbs: Option<&'a Value>,
    pub fat: Option<&'a Value>,
}

// ==========================================
// ExtractionBuffer - 单次运行的内存缓冲
// ==========================================
// 只有运行成功结束后才整体交给 Store
#[derive(Debug, Clone)]
pub struct ExtractionBuffer {
    pub data: HealthDataSet,
    pub skipped: usize,
    pub reasons: Vec<SkipReason>, // 最多保留 max_reasons 条
    max_reasons: usize,
}

impl ExtractionBuffer {
    pub fn new(max_reasons: usize) -> Self {
        Self {
            data: HealthDataSet::new(),
            skipped: 0,
            reasons: Vec::new(),
            max_reasons,
        }
    }

    /// 记录一次跳过（计数总是累加，明细有上限）
    pub fn skip(&mut self, reason: SkipReason) {
        debug!(location = %reason.location, reason = %reason.reason, "记录已跳过");
        self.skipped += 1;
        if self.reasons.len() < self.max_reasons {
            self.reasons.push(reason);
        }
    }

    pub fn accept_sample(&mut self, kind: MetricKind, result: Result<MetricSample, SkipReason>) {
        match result {
            Ok(sample) => self.data.push_sample(kind, sample),
            Err(reason) => self.skip(reason),
        }
    }

    pub fn accept_workout(&mut self, result: Result<WorkoutRecord, SkipReason>) {
        match result {
            Ok(workout) => self.data.push_workout(workout),
            Err(reason) => self.skip(reason),
        }
    }

    pub fn accept_nutrition(&mut self, result: Result<NutritionRecord, SkipReason>) {
        match result {
            Ok(item) => self.data.push_nutrition(item),
            Err(reason) => self.skip(reason),
        }
    }
}

pub struct CanonicalNormalizer;

impl CanonicalNormalizer {
    fn date_of(&self, raw: &Value, location: &str) -> Result<DateTime<Utc>, SkipReason> {
        parse_timestamp(raw)
            .ok_or_else(|| SkipReason::new(location, format!("无法解析日期: {}", raw)))
    }

    /// 构造采样记录
    ///
    /// # 参数
    /// - kind: 已确定的采样类种类
    /// - default_unit: 源中没有单位列时使用的单位
    pub fn to_sample(
        &self,
        kind: MetricKind,
        input: SampleInput<'_>,
        default_unit: &str,
        location: &str,
    ) -> Result<MetricSample, SkipReason> {
        if !kind.is_sample_kind() {
            return Err(SkipReason::new(location, format!("{} 不是采样类指标", kind)));
        }
        let date = self.date_of(input.date, location)?;
        let value = coerce_number(input.value).ok_or_else(|| {
            SkipReason::new(location, format!("{} 数值无效: {}", kind, input.value))
        })?;

        Ok(MetricSample {
            date,
            value,
            unit: input
                .unit
                .and_then(coerce_text)
                .unwrap_or_else(|| default_unit.to_string()),
            category: input.category.and_then(coerce_text),
        })
    }

    /// 构造运动记录（时长必须为有限非负数）
    pub fn to_workout(
        &self,
        input: WorkoutInput<'_>,
        location: &str,
    ) -> Result<WorkoutRecord, SkipReason> {
        let date = self.date_of(input.date, location)?;
        let duration = coerce_number(input.duration)
            .filter(|d| *d >= 0.0)
            .ok_or_else(|| {
                SkipReason::new(location, format!("运动时长无效: {}", input.duration))
            })?;

        Ok(WorkoutRecord {
            date,
            activity_type: input
                .activity_type
                .and_then(coerce_text)
                .unwrap_or_else(|| "Other".to_string()),
            duration,
            duration_unit: input
                .duration_unit
                .and_then(coerce_text)
                .unwrap_or_else(|| MetricKind::Workout.default_unit().to_string()),
            calories: input.calories.and_then(coerce_number),
            distance: input.distance.and_then(coerce_number),
        })
    }

    /// 构造饮食记录（热量/宏量至少一项有效，其余按 0）
    pub fn to_nutrition(
        &self,
        input: NutritionInput<'_>,
        location: &str,
    ) -> Result<NutritionRecord, SkipReason> {
        let date = self.date_of(input.date, location)?;
        let calories = input.calories.and_then(coerce_number);
        let protein = input.protein.and_then(coerce_number);
        let carbs = input.carbs.and_then(coerce_number);
        let fat = input.fat.and_then(coerce_number);

        if calories.is_none() && protein.is_none() && carbs.is_none() && fat.is_none() {
            return Err(SkipReason::new(location, "饮食记录缺少有效的热量/宏量数值"));
        }

        Ok(NutritionRecord {
            date,
            item_name: input
                .item_name
                .and_then(coerce_text)
                .unwrap_or_else(|| "Food".to_string()),
            calories: calories.unwrap_or(0.0),
            protein: protein.unwrap_or(0.0),
            carbs: carbs.unwrap_or(0.0),
            fat: fat.unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp_str("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(rfc.year(), 2024);

        let apple = parse_timestamp_str("2024-01-01 08:00:00 -0500").unwrap();
        assert_eq!(apple.hour(), 13);

        let date_only = parse_timestamp_str("2024-03-05").unwrap();
        assert_eq!((date_only.month(), date_only.day()), (3, 5));

        let compact = parse_timestamp_str("20250120").unwrap();
        assert_eq!(compact.day(), 20);

        let slash = parse_timestamp_str("2024/02/29").unwrap();
        assert_eq!(slash.month(), 2);

        assert!(parse_timestamp_str("not a date").is_none());
        assert!(parse_timestamp_str("").is_none());
    }

    #[test]
    fn test_parse_timestamp_epoch() {
        let secs = parse_timestamp(&json!(1704067200)).unwrap();
        let millis = parse_timestamp(&json!(1704067200000_i64)).unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs.year(), 2024);
        assert!(parse_timestamp(&json!(null)).is_none());
    }

    #[test]
    fn test_coerce_number() {
        assert_eq!(coerce_number(&json!("9,000")), Some(9000.0));
        assert_eq!(coerce_number(&json!(72)), Some(72.0));
        assert_eq!(coerce_number(&json!("NaN")), None);
        assert_eq!(coerce_number(&json!("abc")), None);
        assert_eq!(coerce_number(&json!(null)), None);
    }

    #[test]
    fn test_to_sample_drops_bad_date() {
        let n = CanonicalNormalizer;
        let input = SampleInput {
            date: &json!("yesterday"),
            value: &json!(72),
            unit: None,
            category: None,
        };
        assert!(n.to_sample(MetricKind::HeartRate, input, "count/min", "行 2").is_err());
    }

    #[test]
    fn test_to_sample_default_unit() {
        let n = CanonicalNormalizer;
        let input = SampleInput {
            date: &json!("2024-01-01"),
            value: &json!("70.5"),
            unit: None,
            category: None,
        };
        let s = n.to_sample(MetricKind::Weight, input, "kg", "行 2").unwrap();
        assert_eq!(s.value, 70.5);
        assert_eq!(s.unit, "kg");
    }

    #[test]
    fn test_extraction_buffer_bounds_reasons() {
        let mut buffer = ExtractionBuffer::new(2);
        for i in 0..5 {
            buffer.skip(SkipReason::new(format!("行 {}", i), "bad"));
        }
        assert_eq!(buffer.skipped, 5);
        assert_eq!(buffer.reasons.len(), 2);
    }

    #[test]
    fn test_to_workout_rejects_negative_duration() {
        let n = CanonicalNormalizer;
        let input = WorkoutInput {
            date: &json!("2024-01-01"),
            activity_type: Some(&json!("Running")),
            duration: &json!(-5),
            duration_unit: None,
            calories: None,
            distance: None,
        };
        assert!(n.to_workout(input, "行 2").is_err());
    }

    #[test]
    fn test_to_nutrition_requires_one_number() {
        let n = CanonicalNormalizer;
        let empty = NutritionInput {
            date: &json!("2024-01-01"),
            item_name: Some(&json!("Salad")),
            calories: Some(&json!("")),
            protein: None,
            carbs: None,
            fat: None,
        };
        assert!(n.to_nutrition(empty, "行 2").is_err());

        let protein_only = NutritionInput {
            protein: Some(&json!(12)),
            ..empty
        };
        let rec = n.to_nutrition(protein_only, "行 2").unwrap();
        assert_eq!(rec.protein, 12.0);
        assert_eq!(rec.calories, 0.0);
        assert_eq!(rec.item_name, "Salad");
    }
}

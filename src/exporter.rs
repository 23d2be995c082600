// ==========================================
// 健康数据导入引擎 - 导出器
// ==========================================
// 职责: 存储快照 → CSV（长表）/ JSON（按种类分集合）
// 约束: 导出结果可被导入流程原样读回（各种类条数不变）
// ==========================================

use crate::domain::health::KindSeries;
use crate::domain::types::MetricKind;
use crate::repository::StoreSnapshot;
use serde_json::{Map, Value};
use std::io::Write;
use thiserror::Error;

/// CSV 长表表头
pub const CSV_HEADERS: [&str; 14] = [
    "date",
    "type",
    "value",
    "unit",
    "category",
    "activityType",
    "duration",
    "durationUnit",
    "calories",
    "distance",
    "itemName",
    "protein",
    "carbs",
    "fat",
];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("CSV 写出失败: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON 序列化失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("写出失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("不支持的导出格式: {0}")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Result<Self, ExportError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

fn num(v: f64) -> String {
    v.to_string()
}

fn opt_num(v: Option<f64>) -> String {
    v.map(num).unwrap_or_default()
}

/// 一个种类序列展开为长表行
fn csv_rows(kind: MetricKind, series: &KindSeries) -> Vec<[String; 14]> {
    let type_name = kind.as_str().to_string();
    match series {
        KindSeries::Samples(samples) => samples
            .iter()
            .map(|s| {
                let mut row: [String; 14] = Default::default();
                row[0] = s.date.to_rfc3339();
                row[1] = type_name.clone();
                row[2] = num(s.value);
                row[3] = s.unit.clone();
                row[4] = s.category.clone().unwrap_or_default();
                row
            })
            .collect(),
        KindSeries::Workouts(workouts) => workouts
            .iter()
            .map(|w| {
                let mut row: [String; 14] = Default::default();
                row[0] = w.date.to_rfc3339();
                row[1] = type_name.clone();
                row[5] = w.activity_type.clone();
                row[6] = num(w.duration);
                row[7] = w.duration_unit.clone();
                row[8] = opt_num(w.calories);
                row[9] = opt_num(w.distance);
                row
            })
            .collect(),
        KindSeries::Nutrition(items) => items
            .iter()
            .map(|n| {
                let mut row: [String; 14] = Default::default();
                row[0] = n.date.to_rfc3339();
                row[1] = type_name.clone();
                row[8] = num(n.calories);
                row[10] = n.item_name.clone();
                row[11] = num(n.protein);
                row[12] = num(n.carbs);
                row[13] = num(n.fat);
                row
            })
            .collect(),
    }
}

/// 写出 CSV 长表
///
/// # 返回
/// - 写出的数据行数（不含表头）
pub fn write_csv<W: Write>(snapshot: &StoreSnapshot, writer: W) -> Result<usize, ExportError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(CSV_HEADERS)?;

    let mut written = 0;
    for (kind, series) in &snapshot.series {
        for row in csv_rows(*kind, series) {
            wtr.write_record(&row)?;
            written += 1;
        }
    }
    wtr.flush()?;

    tracing::debug!(rows = written, "CSV 导出完成");
    Ok(written)
}

/// JSON 集合对象: { "heartRate": [...], "workout": [...] }
pub fn to_json_value(snapshot: &StoreSnapshot) -> Result<Value, ExportError> {
    let mut root = Map::new();
    for (kind, series) in &snapshot.series {
        let items = match series {
            KindSeries::Samples(v) => serde_json::to_value(v)?,
            KindSeries::Workouts(v) => serde_json::to_value(v)?,
            KindSeries::Nutrition(v) => serde_json::to_value(v)?,
        };
        root.insert(kind.as_str().to_string(), items);
    }
    Ok(Value::Object(root))
}

/// 按格式导出为字符串
pub fn export_to_string(snapshot: &StoreSnapshot, format: ExportFormat) -> Result<String, ExportError> {
    match format {
        ExportFormat::Csv => {
            let mut buf = Vec::new();
            write_csv(snapshot, &mut buf)?;
            String::from_utf8(buf).map_err(|e| {
                ExportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })
        }
        ExportFormat::Json => Ok(serde_json::to_string_pretty(&to_json_value(snapshot)?)?),
    }
}

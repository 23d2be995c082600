// ==========================================
// 健康数据导入引擎 - 文件解析器实现
// ==========================================
// 支持: 分隔文本 (.csv) / 结构化文档 (.json)
// 产出: 松散类型记录（列名/字段名 → serde_json::Value）
// .xml 走后台解析任务，见 hierarchical_worker
// ==========================================

use crate::domain::health::SkipReason;
use crate::importer::error::ImportError;
use crate::importer::health_importer_trait::FileParser;
use csv::ReaderBuilder;
use serde_json::{Map, Number, Value};

/// 松散类型记录
pub type RawRecord = Map<String, Value>;

/// 单元格类型转换: 空 → Null，数值字符串 → Number，其余保留文本
pub fn coerce_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(i));
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(trimmed.to_string())),
        _ => Value::String(trimmed.to_string()),
    }
}

// ==========================================
// CSV Parser 实现
// ==========================================

/// 表格中的一行（line 为源文件行号，表头为第 1 行）
#[derive(Debug, Clone, PartialEq)]
pub struct TabularRow {
    pub line: usize,
    pub fields: RawRecord,
}

/// 表格解析结果
#[derive(Debug, Clone, Default)]
pub struct TabularDocument {
    pub headers: Vec<String>,
    pub rows: Vec<TabularRow>,
    pub malformed: Vec<SkipReason>, // 逐行报告的坏行
}

pub struct CsvParser;

impl FileParser for CsvParser {
    type Output = TabularDocument;

    fn parse(&self, raw: &str) -> Result<TabularDocument, ImportError> {
        let text = raw.trim_start_matches('\u{feff}');
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(false) // 行长度不一致按坏行处理
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        // 读取表头
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(ImportError::csv_structure("无法识别表头"));
        }

        let mut doc = TabularDocument {
            headers: headers.clone(),
            ..Default::default()
        };

        // 读取所有行
        for (idx, result) in reader.records().enumerate() {
            let position = match &result {
                Ok(r) => r.position(),
                Err(e) => e.position(),
            };
            let line = position.map(|p| p.line() as usize).unwrap_or(idx + 2);
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    doc.malformed
                        .push(SkipReason::new(format!("行 {}", line), e.to_string()));
                    continue;
                }
            };

            let mut row = RawRecord::new();
            for (col_idx, value) in record.iter().enumerate() {
                if let Some(header) = headers.get(col_idx) {
                    if header.is_empty() {
                        continue;
                    }
                    row.insert(header.clone(), coerce_cell(value));
                }
            }

            // 跳过完全空白的行
            if row.values().all(Value::is_null) {
                continue;
            }

            doc.rows.push(TabularRow { line, fields: row });
        }

        Ok(doc)
    }
}

// ==========================================
// JSON Parser 实现
// ==========================================

/// 结构化文档解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum TreeDocument {
    /// 顶层数组 / 单个扁平对象
    Records(Vec<RawRecord>),
    /// 顶层对象，数组字段为候选指标集合（按字段名排序）
    Collections(Vec<(String, Vec<RawRecord>)>),
}

impl TreeDocument {
    pub fn record_count(&self) -> usize {
        match self {
            TreeDocument::Records(v) => v.len(),
            TreeDocument::Collections(c) => c.iter().map(|(_, v)| v.len()).sum(),
        }
    }
}

pub struct JsonParser;

impl JsonParser {
    fn objects_of(items: Vec<Value>) -> Vec<RawRecord> {
        items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()
    }
}

impl FileParser for JsonParser {
    type Output = TreeDocument;

    fn parse(&self, raw: &str) -> Result<TreeDocument, ImportError> {
        let value: Value = serde_json::from_str(raw.trim_start_matches('\u{feff}'))?;

        match value {
            Value::Array(items) => Ok(TreeDocument::Records(Self::objects_of(items))),
            Value::Object(map) => {
                let has_collections = map.values().any(Value::is_array);
                if !has_collections {
                    return Ok(TreeDocument::Records(vec![map]));
                }
                let collections = map
                    .into_iter()
                    .filter_map(|(key, v)| match v {
                        Value::Array(items) => Some((key, Self::objects_of(items))),
                        _ => None,
                    })
                    .collect();
                Ok(TreeDocument::Collections(collections))
            }
            other => Err(ImportError::json_structure(format!(
                "顶层必须是对象或数组，实际为: {}",
                match other {
                    Value::Null => "null",
                    Value::Bool(_) => "bool",
                    Value::Number(_) => "number",
                    _ => "string",
                }
            ))),
        }
    }
}

// ==========================================
// 健康数据导入引擎 - 字段推断
// ==========================================
// 适用: 表格 / 结构化文档（不同来源列名差异大）
// 策略（固定优先级，先命中者生效）:
//   1. 类型列 + 数值列 成对出现
//   2. 按同义词命中的指标列（运动/饮食先认领列，再匹配采样类）
//   3. 都不命中 → 该行/对象静默跳过
// 日期列必需: 缺失时整个运行失败（不是逐行跳过）
// ==========================================

use crate::domain::types::MetricKind;
use crate::importer::error::ImportError;
use crate::importer::file_parser::RawRecord;
use crate::importer::normalizer::{
    parse_timestamp, CanonicalNormalizer, ExtractionBuffer, NutritionInput, SampleInput,
    WorkoutInput,
};
use serde_json::Value;

// ==========================================
// 同义词表
// ==========================================

const HEART_RATE_SYNONYMS: &[&str] = &["heart", "pulse", "hr"];
const STEPS_SYNONYMS: &[&str] = &["step", "count"];
const WEIGHT_SYNONYMS: &[&str] = &["weight", "mass", "kg", "lb"];
const SLEEP_SYNONYMS: &[&str] = &["sleep", "slept", "bedtime"];
const VO2_SYNONYMS: &[&str] = &["vo2", "oxygen", "aerobic"];
const WORKOUT_SYNONYMS: &[&str] = &["workout", "exercise", "activity"];
const FOOD_SYNONYMS: &[&str] = &["food", "meal", "item", "nutrition", "diet"];

const DURATION_SYNONYMS: &[&str] = &["duration", "minutes", "mins"];
const CALORIE_SYNONYMS: &[&str] = &["calorie", "kcal", "energy"];
const DISTANCE_SYNONYMS: &[&str] = &["distance", "km", "mile"];
const PROTEIN_SYNONYMS: &[&str] = &["protein"];
const CARB_SYNONYMS: &[&str] = &["carb"];
const FAT_SYNONYMS: &[&str] = &["fat", "lipid"];

// 以下为精确匹配（归一化后）
const TYPE_FIELDS: &[&str] = &["type", "metric", "metrictype", "measurement", "kind", "datatype"];
const VALUE_FIELDS: &[&str] = &["value", "amount", "reading", "quantity", "qty"];
const UNIT_FIELDS: &[&str] = &["unit", "units"];
const CATEGORY_FIELDS: &[&str] = &["category", "stage"];
const DATE_FIELDS: &[&str] = &[
    "date", "datetime", "timestamp", "time", "day", "startdate", "start",
];

static NULL: Value = Value::Null;

/// 采样类种类的匹配顺序
const SAMPLE_KIND_ORDER: &[(MetricKind, &[&str])] = &[
    (MetricKind::HeartRate, HEART_RATE_SYNONYMS),
    (MetricKind::Steps, STEPS_SYNONYMS),
    (MetricKind::Weight, WEIGHT_SYNONYMS),
    (MetricKind::Sleep, SLEEP_SYNONYMS),
    (MetricKind::Vo2Max, VO2_SYNONYMS),
];

/// 名称归一化: 小写 + 仅保留字母数字
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// 不超过该长度的同义词（hr / kg / lb / km）只按整词匹配
const SHORT_SYNONYM_LEN: usize = 2;

/// 名称分词: 按非字母数字与小写→大写边界切分，结果小写
///
/// `sleep_hrs` → [sleep, hrs]，`avgHR` → [avg, hr]
pub fn tokenize_name(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in name.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// 名称的两种形态: 归一化全名（子串匹配）+ 分词（短同义词整词匹配）
#[derive(Debug, Clone)]
struct NameForms {
    normalized: String,
    tokens: Vec<String>,
}

impl NameForms {
    fn new(name: &str) -> Self {
        Self {
            normalized: normalize_name(name),
            tokens: tokenize_name(name),
        }
    }

    fn matches_any(&self, synonyms: &[&str]) -> bool {
        synonyms.iter().any(|s| {
            if s.len() <= SHORT_SYNONYM_LEN {
                self.tokens.iter().any(|t| t.as_str() == *s)
            } else {
                self.normalized.contains(s)
            }
        })
    }
}

/// 由文本（类型单元格 / 集合名）推断种类
pub fn kind_from_text(text: &str) -> Option<MetricKind> {
    let name = NameForms::new(text);
    if name.normalized.is_empty() {
        return None;
    }
    SAMPLE_KIND_ORDER
        .iter()
        .find(|(_, syn)| name.matches_any(syn))
        .map(|(kind, _)| *kind)
        .or_else(|| name.matches_any(WORKOUT_SYNONYMS).then_some(MetricKind::Workout))
        .or_else(|| name.matches_any(FOOD_SYNONYMS).then_some(MetricKind::Nutrition))
}

// ==========================================
// 推断结果（标签联合）
// ==========================================

/// 运动记录相关列
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkoutColumns {
    pub activity_field: Option<String>,
    pub duration_field: Option<String>,
    pub duration_unit_field: Option<String>,
    pub calories_field: Option<String>,
    pub distance_field: Option<String>,
}

/// 饮食记录相关列
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NutritionColumns {
    pub item_field: Option<String>,
    pub calories_field: Option<String>,
    pub protein_field: Option<String>,
    pub carbs_field: Option<String>,
    pub fat_field: Option<String>,
}

impl NutritionColumns {
    fn has_any_number(&self) -> bool {
        self.calories_field.is_some()
            || self.protein_field.is_some()
            || self.carbs_field.is_some()
            || self.fat_field.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedField {
    /// 策略 1: 类型列 + 数值列
    TypeValuePair {
        type_field: String,
        value_field: String,
        unit_field: Option<String>,
        category_field: Option<String>,
        workout: WorkoutColumns,
        nutrition: NutritionColumns,
    },
    /// 策略 2: 单指标列
    Metric {
        kind: MetricKind,
        field: String,
        unit_field: Option<String>,
        category_field: Option<String>,
        default_unit: &'static str,
    },
    /// 策略 2: 运动列组
    Workout(WorkoutColumns),
    /// 策略 2: 饮食列组
    Nutrition(NutritionColumns),
}

/// 一组字段名的推断结果
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResolution {
    pub date_field: String,
    pub fields: Vec<ResolvedField>,
}

// ==========================================
// 列选择辅助
// ==========================================

/// 在候选列中按谓词选出第一个未被占用的列
struct ColumnPicker<'a> {
    columns: Vec<(&'a str, NameForms)>,
    claimed: Vec<&'a str>,
}

impl<'a> ColumnPicker<'a> {
    fn new(keys: &'a [String], date_field: &str) -> Self {
        let columns = keys
            .iter()
            .filter(|k| k.as_str() != date_field)
            .map(|k| (k.as_str(), NameForms::new(k)))
            .collect();
        Self {
            columns,
            claimed: Vec::new(),
        }
    }

    fn find<F: Fn(&NameForms) -> bool>(&self, pred: F) -> Option<&'a str> {
        self.columns
            .iter()
            .find(|(raw, n)| !self.claimed.contains(raw) && pred(n))
            .map(|(raw, _)| *raw)
    }

    fn exact(&self, names: &[&str]) -> Option<&'a str> {
        self.find(|n| names.contains(&n.normalized.as_str()))
    }

    fn containing(&self, synonyms: &[&str]) -> Option<&'a str> {
        self.find(|n| n.matches_any(synonyms))
    }

    fn claim(&mut self, col: Option<&'a str>) -> Option<String> {
        col.map(|c| {
            self.claimed.push(c);
            c.to_string()
        })
    }

    fn duration(&self) -> Option<&'a str> {
        self.find(|n| n.matches_any(DURATION_SYNONYMS) && !n.normalized.contains("unit"))
    }

    fn duration_unit(&self) -> Option<&'a str> {
        self.find(|n| n.normalized.contains("duration") && n.normalized.contains("unit"))
    }

    fn workout_columns(&mut self, require_activity: bool) -> Option<WorkoutColumns> {
        let activity = self.containing(WORKOUT_SYNONYMS);
        let duration = self.find(|n| {
            n.matches_any(DURATION_SYNONYMS)
                && !n.normalized.contains("unit")
                && activity.map_or(true, |a| normalize_name(a) != n.normalized)
        });
        if duration.is_none() || (require_activity && activity.is_none()) {
            return None;
        }
        let activity_field = self.claim(activity);
        let duration_field = self.claim(duration);
        let duration_unit_field = self.claim(self.duration_unit());
        let calories_field = self.claim(self.containing(CALORIE_SYNONYMS));
        let distance_field = self.claim(self.containing(DISTANCE_SYNONYMS));
        Some(WorkoutColumns {
            activity_field,
            duration_field,
            duration_unit_field,
            calories_field,
            distance_field,
        })
    }

    fn nutrition_columns(&mut self, require_item: bool) -> Option<NutritionColumns> {
        let item = self.containing(FOOD_SYNONYMS);
        let calories = self.containing(CALORIE_SYNONYMS);
        if require_item && (item.is_none() || calories.is_none()) {
            return None;
        }
        let cols = NutritionColumns {
            item_field: self.claim(item),
            calories_field: self.claim(calories),
            protein_field: self.claim(self.containing(PROTEIN_SYNONYMS)),
            carbs_field: self.claim(self.containing(CARB_SYNONYMS)),
            fat_field: self.claim(self.containing(FAT_SYNONYMS)),
        };
        Some(cols)
    }
}

/// 由列名推断单位提示
fn unit_hint(kind: MetricKind, normalized_column: &str) -> &'static str {
    match kind {
        MetricKind::Weight if normalized_column.contains("lb") => "lb",
        MetricKind::Sleep if normalized_column.contains("min") => "min",
        _ => kind.default_unit(),
    }
}

// ==========================================
// SchemaInference - 字段推断引擎
// ==========================================
pub struct SchemaInference;

impl SchemaInference {
    /// 查找日期列: 先精确名，再包含 date / timestamp 的列
    pub fn find_date_field(&self, keys: &[String]) -> Option<String> {
        let normalized: Vec<(String, &String)> =
            keys.iter().map(|k| (normalize_name(k), k)).collect();

        for name in DATE_FIELDS {
            if let Some((_, raw)) = normalized.iter().find(|(n, _)| n.as_str() == *name) {
                return Some((*raw).clone());
            }
        }
        normalized
            .iter()
            .find(|(n, _)| n.contains("date") || n.contains("timestamp"))
            .map(|(_, raw)| (*raw).clone())
    }

    /// 通用推断（按优先级评估全部策略）
    ///
    /// # 返回
    /// - Ok(FieldResolution): fields 可能为空（此时所有行静默跳过）
    /// - Err(MissingTemporalField): 无日期列
    pub fn resolve(&self, keys: &[String]) -> Result<FieldResolution, ImportError> {
        let date_field = self
            .find_date_field(keys)
            .ok_or_else(|| ImportError::MissingTemporalField(keys.join(",")))?;

        let mut picker = ColumnPicker::new(keys, &date_field);

        // 策略 1: 类型列 + 数值列
        if let (Some(type_col), Some(value_col)) =
            (picker.exact(TYPE_FIELDS), picker.exact(VALUE_FIELDS))
        {
            let type_field = picker.claim(Some(type_col)).unwrap_or_default();
            let value_field = picker.claim(Some(value_col)).unwrap_or_default();
            let unit_field = picker.claim(picker.exact(UNIT_FIELDS));
            let category_field = picker.claim(picker.exact(CATEGORY_FIELDS));
            let workout = picker.workout_columns(false).unwrap_or_default();
            // 伴随列允许与运动列共用热量列
            let mut companion = ColumnPicker::new(keys, &date_field);
            companion.claimed = vec![type_col, value_col];
            let nutrition = companion.nutrition_columns(false).unwrap_or_default();

            return Ok(FieldResolution {
                date_field,
                fields: vec![ResolvedField::TypeValuePair {
                    type_field,
                    value_field,
                    unit_field,
                    category_field,
                    workout,
                    nutrition,
                }],
            });
        }

        // 策略 2: 饮食 / 运动列组先认领列
        let mut fields = Vec::new();
        if let Some(cols) = picker.nutrition_columns(true) {
            fields.push(ResolvedField::Nutrition(cols));
        }
        if let Some(cols) = picker.workout_columns(true) {
            fields.push(ResolvedField::Workout(cols));
        }

        // 策略 2: 采样类指标列（每个种类取第一列）
        let unit_col = picker.claim(picker.exact(UNIT_FIELDS));
        let mut metrics = Vec::new();
        for (kind, synonyms) in SAMPLE_KIND_ORDER {
            if let Some(col) = picker.containing(synonyms) {
                let field = picker.claim(Some(col)).unwrap_or_default();
                metrics.push((*kind, field));
            }
        }
        // 单位列只属于唯一的指标列；多列时各自用列名推断的单位
        let unit_field = if metrics.len() == 1 { unit_col } else { None };
        for (kind, field) in metrics {
            fields.push(ResolvedField::Metric {
                kind,
                default_unit: unit_hint(kind, &normalize_name(&field)),
                field,
                unit_field: unit_field.clone(),
                category_field: None,
            });
        }

        Ok(FieldResolution { date_field, fields })
    }

    /// 已知种类的集合内推断（如 JSON 中 "heartRate": [...]）
    ///
    /// # 返回
    /// - Some: 可按该种类提取
    /// - None: 字段不足，调用方退回通用推断
    pub fn resolve_for_kind(&self, kind: MetricKind, keys: &[String]) -> Option<FieldResolution> {
        let date_field = self.find_date_field(keys)?;
        let mut picker = ColumnPicker::new(keys, &date_field);

        let field = match kind {
            MetricKind::Workout => {
                let activity = picker
                    .containing(WORKOUT_SYNONYMS)
                    .or_else(|| picker.exact(&["type", "name", "sport"]));
                let activity_field = picker.claim(activity);
                let duration = picker.duration().or_else(|| picker.exact(VALUE_FIELDS));
                let duration_field = Some(picker.claim(duration)?);
                ResolvedField::Workout(WorkoutColumns {
                    activity_field,
                    duration_field,
                    duration_unit_field: picker.claim(picker.duration_unit()),
                    calories_field: picker.claim(picker.containing(CALORIE_SYNONYMS)),
                    distance_field: picker.claim(picker.containing(DISTANCE_SYNONYMS)),
                })
            }
            MetricKind::Nutrition => {
                let item = picker
                    .containing(FOOD_SYNONYMS)
                    .or_else(|| picker.exact(&["name"]));
                let item_field = picker.claim(item);
                let mut cols = picker.nutrition_columns(false)?;
                cols.item_field = item_field;
                if !cols.has_any_number() {
                    return None;
                }
                ResolvedField::Nutrition(cols)
            }
            _ => {
                let synonyms = SAMPLE_KIND_ORDER
                    .iter()
                    .find(|(k, _)| *k == kind)
                    .map(|(_, s)| *s)
                    .unwrap_or(&[]);
                let value = picker
                    .exact(VALUE_FIELDS)
                    .or_else(|| picker.containing(synonyms))?;
                let field = picker.claim(Some(value)).unwrap_or_default();
                ResolvedField::Metric {
                    kind,
                    default_unit: unit_hint(kind, &normalize_name(&field)),
                    field,
                    unit_field: picker.claim(picker.exact(UNIT_FIELDS)),
                    category_field: picker.claim(picker.exact(CATEGORY_FIELDS)),
                }
            }
        };

        Some(FieldResolution {
            date_field,
            fields: vec![field],
        })
    }
}

// ==========================================
// 按推断结果提取单条记录
// ==========================================

fn cell<'r>(record: &'r RawRecord, field: &Option<String>) -> Option<&'r Value> {
    field
        .as_deref()
        .and_then(|f| record.get(f))
        .filter(|v| !v.is_null())
}

fn present<'r>(record: &'r RawRecord, field: &str) -> Option<&'r Value> {
    record.get(field).filter(|v| !v.is_null())
}

impl FieldResolution {
    /// 该行是否含有任何可提取的数据
    fn has_payload(&self, record: &RawRecord) -> bool {
        self.fields.iter().any(|f| match f {
            ResolvedField::TypeValuePair { type_field, .. } => present(record, type_field)
                .and_then(|v| v.as_str())
                .and_then(kind_from_text)
                .is_some(),
            ResolvedField::Metric { field, .. } => present(record, field).is_some(),
            ResolvedField::Workout(c) => {
                cell(record, &c.activity_field).is_some() || cell(record, &c.duration_field).is_some()
            }
            ResolvedField::Nutrition(c) => {
                cell(record, &c.item_field).is_some()
                    || cell(record, &c.calories_field).is_some()
                    || cell(record, &c.protein_field).is_some()
                    || cell(record, &c.carbs_field).is_some()
                    || cell(record, &c.fat_field).is_some()
            }
        })
    }

    /// 提取一行/一个对象
    ///
    /// 日期无效时整行计一次跳过；无可识别数据的行静默忽略
    pub fn extract(
        &self,
        record: &RawRecord,
        location: &str,
        normalizer: &CanonicalNormalizer,
        out: &mut ExtractionBuffer,
    ) {
        if !self.has_payload(record) {
            return;
        }

        let date = record.get(&self.date_field).unwrap_or(&NULL);
        if parse_timestamp(date).is_none() {
            out.skip(crate::domain::health::SkipReason::new(
                location,
                format!("日期无效或缺失: {}", date),
            ));
            return;
        }

        for field in &self.fields {
            match field {
                ResolvedField::TypeValuePair {
                    type_field,
                    value_field,
                    unit_field,
                    category_field,
                    workout,
                    nutrition,
                } => {
                    let Some(kind) = present(record, type_field)
                        .and_then(|v| v.as_str())
                        .and_then(kind_from_text)
                    else {
                        continue;
                    };
                    let value = present(record, value_field);
                    match kind {
                        MetricKind::Workout => {
                            let duration = cell(record, &workout.duration_field)
                                .or(value)
                                .unwrap_or(&NULL);
                            out.accept_workout(normalizer.to_workout(
                                WorkoutInput {
                                    date,
                                    activity_type: cell(record, &workout.activity_field),
                                    duration,
                                    duration_unit: cell(record, &workout.duration_unit_field)
                                        .or_else(|| cell(record, unit_field)),
                                    calories: cell(record, &workout.calories_field),
                                    distance: cell(record, &workout.distance_field),
                                },
                                location,
                            ));
                        }
                        MetricKind::Nutrition => {
                            out.accept_nutrition(normalizer.to_nutrition(
                                NutritionInput {
                                    date,
                                    item_name: cell(record, &nutrition.item_field),
                                    calories: cell(record, &nutrition.calories_field).or(value),
                                    protein: cell(record, &nutrition.protein_field),
                                    carbs: cell(record, &nutrition.carbs_field),
                                    fat: cell(record, &nutrition.fat_field),
                                },
                                location,
                            ));
                        }
                        _ => {
                            out.accept_sample(
                                kind,
                                normalizer.to_sample(
                                    kind,
                                    SampleInput {
                                        date,
                                        value: value.unwrap_or(&NULL),
                                        unit: cell(record, unit_field),
                                        category: cell(record, category_field),
                                    },
                                    kind.default_unit(),
                                    location,
                                ),
                            );
                        }
                    }
                }
                ResolvedField::Metric {
                    kind,
                    field,
                    unit_field,
                    category_field,
                    default_unit,
                } => {
                    let Some(value) = present(record, field) else {
                        continue;
                    };
                    out.accept_sample(
                        *kind,
                        normalizer.to_sample(
                            *kind,
                            SampleInput {
                                date,
                                value,
                                unit: cell(record, unit_field),
                                category: cell(record, category_field),
                            },
                            default_unit,
                            location,
                        ),
                    );
                }
                ResolvedField::Workout(cols) => {
                    if cell(record, &cols.activity_field).is_none()
                        && cell(record, &cols.duration_field).is_none()
                    {
                        continue;
                    }
                    out.accept_workout(normalizer.to_workout(
                        WorkoutInput {
                            date,
                            activity_type: cell(record, &cols.activity_field),
                            duration: cell(record, &cols.duration_field).unwrap_or(&NULL),
                            duration_unit: cell(record, &cols.duration_unit_field),
                            calories: cell(record, &cols.calories_field),
                            distance: cell(record, &cols.distance_field),
                        },
                        location,
                    ));
                }
                ResolvedField::Nutrition(cols) => {
                    if cell(record, &cols.item_field).is_none()
                        && cell(record, &cols.calories_field).is_none()
                        && cell(record, &cols.protein_field).is_none()
                        && cell(record, &cols.carbs_field).is_none()
                        && cell(record, &cols.fat_field).is_none()
                    {
                        continue;
                    }
                    out.accept_nutrition(normalizer.to_nutrition(
                        NutritionInput {
                            date,
                            item_name: cell(record, &cols.item_field),
                            calories: cell(record, &cols.calories_field),
                            protein: cell(record, &cols.protein_field),
                            carbs: cell(record, &cols.carbs_field),
                            fat: cell(record, &cols.fat_field),
                        },
                        location,
                    ));
                }
            }
        }
    }
}

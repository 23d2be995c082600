// ==========================================
// 健康数据导入引擎 - 层级文档后台解析
// ==========================================
// 适用: .xml 健康导出（通常数万个元素以上）
// 执行: tokio 阻塞线程池，与调用方仅通过有界通道通信
// 消息: Status / Total / Progress / Error / Complete
// 顺序保证: Progress 单调不减；Complete 或 Error 必为最后一条
// 三遍提取:
//   (a) Record 元素（type 子串匹配种类）
//   (b) Workout 元素
//   (c) 饮食条目（Food 类 Correlation / Food / FoodItem）
// ==========================================

use crate::domain::health::{HealthDataSet, MetricSample, SkipReason};
use crate::domain::types::MetricKind;
use crate::importer::error::ImportError;
use crate::importer::normalizer::{
    coerce_number, parse_timestamp_str, CanonicalNormalizer, ExtractionBuffer, NutritionInput,
    SampleInput, WorkoutInput,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const WORKOUT_TYPE_PREFIX: &str = "HKWorkoutActivityType";
const FOOD_TYPE_METADATA_KEY: &str = "HKFoodType";

// 解析阶段每处理这么多事件检查一次取消
const PARSE_CANCEL_CHECK_EVENTS: usize = 4096;

// ==========================================
// 消息与配置
// ==========================================

/// 后台任务的失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    #[error("XML 结构无效: {0}")]
    Malformed(String),

    #[error("解析任务已取消")]
    Cancelled,
}

impl From<WorkerFailure> for ImportError {
    fn from(failure: WorkerFailure) -> Self {
        match failure {
            WorkerFailure::Malformed(message) => ImportError::xml_structure(message),
            WorkerFailure::Cancelled => ImportError::Cancelled,
        }
    }
}

/// 成功完成时的提取结果
#[derive(Debug, Clone, Default)]
pub struct HierarchicalPayload {
    pub data: HealthDataSet,
    pub processed: usize,
    pub skipped: usize,
    pub skip_reasons: Vec<SkipReason>,
}

#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Status(String),
    Total(usize),
    Progress(u8),
    Error(WorkerFailure),
    Complete(HierarchicalPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub progress_interval: usize,
    pub channel_capacity: usize,
    pub max_skip_reasons: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            progress_interval: 1000,
            channel_capacity: 64,
            max_skip_reasons: 20,
        }
    }
}

/// 已启动的后台任务
pub struct WorkerHandle {
    pub receiver: mpsc::Receiver<WorkerMessage>,
    pub join: JoinHandle<()>,
}

/// 启动后台解析任务（文件内容移交给任务）
///
/// 必须在 tokio 运行时内调用
pub fn spawn(content: Vec<u8>, config: WorkerConfig, cancel: CancellationToken) -> WorkerHandle {
    let (tx, receiver) = mpsc::channel(config.channel_capacity.max(1));

    let join = tokio::task::spawn_blocking(move || {
        let result = HierarchicalExtractor::new(config).run(&content, &cancel, &mut |msg| {
            tx.blocking_send(msg).is_ok()
        });

        let last = match result {
            Ok(payload) => WorkerMessage::Complete(payload),
            Err(failure) => WorkerMessage::Error(failure),
        };
        // 接收端已关闭时无需再投递
        let _ = tx.blocking_send(last);
    });

    WorkerHandle { receiver, join }
}

// ==========================================
// 轻量元素树
// ==========================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn from_start(e: &BytesStart<'_>) -> Result<Self, WorkerFailure> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attrs = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|err| WorkerFailure::Malformed(format!("{}: {}", name, err)))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| WorkerFailure::Malformed(format!("{}@{}: {}", name, key, err)))?
                .into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name,
            attrs,
            children: Vec::new(),
        })
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    /// 按文档顺序收集满足条件的后代（含自身），命中节点不再向下展开
    fn collect<'a, F: Fn(&XmlNode) -> bool>(&'a self, pred: F) -> Vec<&'a XmlNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if pred(node) {
                out.push(node);
                continue;
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

/// 解析整个文档为元素树
///
/// 未闭合元素、多根、空文档均为结构错误
pub fn parse_document(raw: &[u8], cancel: &CancellationToken) -> Result<XmlNode, WorkerFailure> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| WorkerFailure::Malformed(format!("非 UTF-8 内容: {}", e)))?
        .trim_start_matches('\u{feff}');

    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    let mut events = 0usize;

    loop {
        events += 1;
        if events % PARSE_CANCEL_CHECK_EVENTS == 0 && cancel.is_cancelled() {
            return Err(WorkerFailure::Cancelled);
        }

        let node = match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(XmlNode::from_start(&e)?);
                continue;
            }
            Ok(Event::Empty(e)) => XmlNode::from_start(&e)?,
            Ok(Event::End(_)) => stack
                .pop()
                .ok_or_else(|| WorkerFailure::Malformed("多余的结束标签".to_string()))?,
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(e) => {
                return Err(WorkerFailure::Malformed(format!(
                    "位置 {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        };

        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None if root.is_none() => root = Some(node),
            None => return Err(WorkerFailure::Malformed("文档存在多个根元素".to_string())),
        }
    }

    if let Some(open) = stack.last() {
        return Err(WorkerFailure::Malformed(format!("元素未闭合: <{}>", open.name)));
    }
    root.ok_or_else(|| WorkerFailure::Malformed("文档中没有任何元素".to_string()))
}

// ==========================================
// 匹配规则
// ==========================================

/// Record 的 type 标识 → 种类（子串匹配）
pub fn record_kind(type_id: &str) -> Option<MetricKind> {
    if type_id.contains("HeartRate") {
        Some(MetricKind::HeartRate)
    } else if type_id.contains("StepCount") {
        Some(MetricKind::Steps)
    } else if type_id.contains("BodyMass") && !type_id.contains("BodyMassIndex") {
        Some(MetricKind::Weight)
    } else if type_id.contains("SleepAnalysis") {
        Some(MetricKind::Sleep)
    } else if type_id.contains("VO2Max") {
        Some(MetricKind::Vo2Max)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Macro {
    Protein,
    Fat,
    Carbs,
    Energy,
}

/// 营养素名称 → 宏量类别（饱和/不饱和脂肪是总脂肪的子项，不重复计入）
fn macro_of(name: &str) -> Option<Macro> {
    let n = name.to_lowercase();
    if n.contains("protein") {
        Some(Macro::Protein)
    } else if n.contains("saturated") {
        None
    } else if n.contains("fat") || n.contains("lipid") {
        Some(Macro::Fat)
    } else if n.contains("carb") {
        Some(Macro::Carbs)
    } else if n.contains("energy") || n.contains("calorie") || n.contains("kcal") {
        Some(Macro::Energy)
    } else {
        None
    }
}

fn is_food_node(node: &XmlNode) -> bool {
    match node.name.as_str() {
        "Food" | "FoodItem" => true,
        "Correlation" => node.attr("type").map_or(false, |t| t.contains("Food")),
        _ => false,
    }
}

fn text_value(raw: Option<&str>) -> Value {
    raw.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null)
}

/// 起止时间差（分钟）；结束早于开始视为无效
fn span_minutes(node: &XmlNode) -> Option<f64> {
    let start = parse_timestamp_str(node.attr("startDate")?)?;
    let end = parse_timestamp_str(node.attr("endDate")?)?;
    let secs = (end - start).num_seconds();
    (secs >= 0).then(|| secs as f64 / 60.0)
}

// ==========================================
// HierarchicalExtractor - 提取逻辑（同步，可单测）
// ==========================================
pub struct HierarchicalExtractor {
    config: WorkerConfig,
    normalizer: CanonicalNormalizer,
}

struct ProgressTracker<'e> {
    total: usize,
    processed: usize,
    interval: usize,
    last_percent: u8,
    emit: &'e mut dyn FnMut(WorkerMessage) -> bool,
}

impl ProgressTracker<'_> {
    fn send(&mut self, msg: WorkerMessage) -> Result<(), WorkerFailure> {
        if (self.emit)(msg) {
            Ok(())
        } else {
            // 接收端已关闭，调用方放弃了本次导入
            Err(WorkerFailure::Cancelled)
        }
    }

    /// 记一条已处理；到达间隔时上报（完成前最高 99）
    fn tick(&mut self, cancel: &CancellationToken) -> Result<(), WorkerFailure> {
        if cancel.is_cancelled() {
            return Err(WorkerFailure::Cancelled);
        }
        self.processed += 1;
        if self.processed % self.interval == 0 && self.total > 0 {
            let percent = ((self.processed * 100) / self.total).min(99) as u8;
            let percent = percent.max(self.last_percent);
            self.last_percent = percent;
            self.send(WorkerMessage::Progress(percent))?;
        }
        Ok(())
    }
}

impl HierarchicalExtractor {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            normalizer: CanonicalNormalizer,
        }
    }

    /// 执行完整提取（不发送最终的 Complete/Error）
    ///
    /// # 参数
    /// - emit: 投递消息，返回 false 表示接收端已关闭
    pub fn run(
        &self,
        content: &[u8],
        cancel: &CancellationToken,
        emit: &mut dyn FnMut(WorkerMessage) -> bool,
    ) -> Result<HierarchicalPayload, WorkerFailure> {
        let mut tracker = ProgressTracker {
            total: 0,
            processed: 0,
            interval: self.config.progress_interval.max(1),
            last_percent: 0,
            emit,
        };

        tracker.send(WorkerMessage::Status("正在解析文档".to_string()))?;
        let root = parse_document(content, cancel)?;

        let records = root.collect(|n| n.name == "Record");
        let workouts = root.collect(|n| n.name == "Workout");
        let foods = root.collect(is_food_node);
        tracker.total = records.len() + workouts.len() + foods.len();

        info!(
            records = records.len(),
            workouts = workouts.len(),
            foods = foods.len(),
            "层级文档解析完成"
        );
        tracker.send(WorkerMessage::Total(tracker.total))?;

        let mut out = ExtractionBuffer::new(self.config.max_skip_reasons);

        // 第一遍: Record
        tracker.send(WorkerMessage::Status("正在提取测量记录".to_string()))?;
        for (idx, node) in records.iter().enumerate() {
            self.extract_record(node, &format!("Record #{}", idx + 1), &mut out);
            tracker.tick(cancel)?;
        }

        // 第二遍: Workout
        tracker.send(WorkerMessage::Status("正在提取运动记录".to_string()))?;
        for (idx, node) in workouts.iter().enumerate() {
            self.extract_workout(node, &format!("Workout #{}", idx + 1), &mut out);
            tracker.tick(cancel)?;
        }

        // 第三遍: 饮食条目
        tracker.send(WorkerMessage::Status("正在提取饮食记录".to_string()))?;
        for (idx, node) in foods.iter().enumerate() {
            self.extract_food(node, &format!("{} #{}", node.name, idx + 1), &mut out);
            tracker.tick(cancel)?;
        }

        tracker.send(WorkerMessage::Progress(100))?;
        debug!(
            processed = tracker.processed,
            skipped = out.skipped,
            "层级文档提取完成"
        );

        Ok(HierarchicalPayload {
            data: out.data,
            processed: tracker.processed,
            skipped: out.skipped,
            skip_reasons: out.reasons,
        })
    }

    fn extract_record(&self, node: &XmlNode, location: &str, out: &mut ExtractionBuffer) {
        let Some(kind) = node.attr("type").and_then(record_kind) else {
            return;
        };

        if kind == MetricKind::Sleep {
            out.accept_sample(kind, self.sleep_sample(node, location));
            return;
        }

        // 起止时间矛盾的记录整体丢弃
        if let (Some(start), Some(end)) = (
            node.attr("startDate").and_then(parse_timestamp_str),
            node.attr("endDate").and_then(parse_timestamp_str),
        ) {
            if end < start {
                out.skip(SkipReason::new(location, "结束时间早于开始时间"));
                return;
            }
        }

        let date = text_value(node.attr("startDate").or_else(|| node.attr("creationDate")));
        let value = text_value(node.attr("value"));
        let unit = node.attr("unit").map(|u| Value::String(u.to_string()));

        out.accept_sample(
            kind,
            self.normalizer.to_sample(
                kind,
                SampleInput {
                    date: &date,
                    value: &value,
                    unit: unit.as_ref(),
                    category: None,
                },
                kind.default_unit(),
                location,
            ),
        );
    }

    /// 睡眠: 数值为起止时间差（小时），必须严格为正
    fn sleep_sample(&self, node: &XmlNode, location: &str) -> Result<MetricSample, SkipReason> {
        let start = node
            .attr("startDate")
            .and_then(parse_timestamp_str)
            .ok_or_else(|| SkipReason::new(location, "睡眠记录缺少有效的开始时间"))?;
        let end = node
            .attr("endDate")
            .and_then(parse_timestamp_str)
            .ok_or_else(|| SkipReason::new(location, "睡眠记录缺少有效的结束时间"))?;

        let hours = (end - start).num_seconds() as f64 / 3600.0;
        if hours <= 0.0 {
            return Err(SkipReason::new(
                location,
                format!("睡眠时长必须为正: {:.3} 小时", hours),
            ));
        }

        Ok(MetricSample {
            date: start,
            value: hours,
            unit: MetricKind::Sleep.default_unit().to_string(),
            category: node.attr("value").map(str::to_string),
        })
    }

    fn extract_workout(&self, node: &XmlNode, location: &str, out: &mut ExtractionBuffer) {
        let activity = node
            .attr("workoutActivityType")
            .map(|a| a.strip_prefix(WORKOUT_TYPE_PREFIX).unwrap_or(a))
            .filter(|a| !a.is_empty())
            .map(|a| Value::String(a.to_string()));

        // 时长: 属性优先，否则由起止时间计算（分钟）
        let (duration, duration_unit) = match node.attr("duration").and_then(|d| {
            coerce_number(&Value::String(d.to_string()))
        }) {
            Some(d) => (Value::from(d), node.attr("durationUnit").map(str::to_string)),
            None => match span_minutes(node) {
                Some(m) => (Value::from(m), Some("min".to_string())),
                None => (Value::Null, None),
            },
        };
        let duration_unit = duration_unit.map(Value::String);

        let statistic = |needle: &str| -> Option<Value> {
            node.children
                .iter()
                .filter(|c| c.name == "WorkoutStatistics")
                .find(|c| c.attr("type").map_or(false, |t| t.contains(needle)))
                .and_then(|c| c.attr("sum"))
                .map(|s| Value::String(s.to_string()))
        };
        let calories = node
            .attr("totalEnergyBurned")
            .map(|s| Value::String(s.to_string()))
            .or_else(|| statistic("EnergyBurned"));
        let distance = node
            .attr("totalDistance")
            .map(|s| Value::String(s.to_string()))
            .or_else(|| statistic("Distance"));

        let date = text_value(node.attr("startDate"));
        out.accept_workout(self.normalizer.to_workout(
            WorkoutInput {
                date: &date,
                activity_type: activity.as_ref(),
                duration: &duration,
                duration_unit: duration_unit.as_ref(),
                calories: calories.as_ref(),
                distance: distance.as_ref(),
            },
            location,
        ));
    }

    fn extract_food(&self, node: &XmlNode, location: &str, out: &mut ExtractionBuffer) {
        let mut totals: [Option<f64>; 4] = [None; 4];
        let mut add = |m: Macro, v: f64| {
            let slot = &mut totals[m as usize];
            *slot = Some(slot.unwrap_or(0.0) + v);
        };

        // 条目自身的属性（如 <Food calories="..." protein="..."/>）
        for (key, raw) in &node.attrs {
            if let (Some(m), Some(v)) = (macro_of(key), coerce_number(&Value::String(raw.clone()))) {
                add(m, v);
            }
        }

        // 子元素按 type / name 匹配
        for child in &node.children {
            let Some(label) = child.attr("type").or_else(|| child.attr("name")) else {
                continue;
            };
            let Some(m) = macro_of(label) else {
                continue;
            };
            if let Some(v) = child
                .attr("value")
                .and_then(|v| coerce_number(&Value::String(v.to_string())))
            {
                add(m, v);
            }
        }

        let item_name = node
            .children
            .iter()
            .find(|c| c.name == "MetadataEntry" && c.attr("key") == Some(FOOD_TYPE_METADATA_KEY))
            .and_then(|c| c.attr("value"))
            .or_else(|| node.attr("name"))
            .map(|s| Value::String(s.to_string()));

        let [protein, fat, carbs, calories] = totals.map(|t| t.map(Value::from));
        let date = text_value(node.attr("startDate").or_else(|| node.attr("date")));

        out.accept_nutrition(self.normalizer.to_nutrition(
            NutritionInput {
                date: &date,
                item_name: item_name.as_ref(),
                calories: calories.as_ref(),
                protein: protein.as_ref(),
                carbs: carbs.as_ref(),
                fat: fat.as_ref(),
            },
            location,
        ));
    }
}

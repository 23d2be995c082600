// ==========================================
// 健康数据导入引擎 - 导入编排实现
// ==========================================
// 职责: 整合导入流程，从文件到存储
// 流程: 闸门 → 格式识别 → 解析 → 字段推断 → 规范化 → 单事务落库
// 红线: 任一致命错误不落库；取消等同于失败
// 红线: 同一时刻仅允许一个导入
// ==========================================

use crate::config::ImportConfigReader;
use crate::domain::health::{HealthDataSet, ImportHistoryEntry, ImportResult, SkipReason};
use crate::domain::types::SourceFormat;
use crate::importer::error::ImportError;
use crate::importer::file_parser::{CsvParser, JsonParser, RawRecord, TabularDocument, TreeDocument};
use crate::importer::format_classifier::{check_signature, classify};
use crate::importer::health_importer_trait::{FileParser, HealthImporter, ImportSource, ProgressEvent};
use crate::importer::hierarchical_worker::{self, WorkerConfig, WorkerHandle, WorkerMessage};
use crate::importer::normalizer::{CanonicalNormalizer, ExtractionBuffer};
use crate::importer::schema_inference::{kind_from_text, SchemaInference};
use crate::repository::HealthStore;
use chrono::Utc;
use std::path::Path;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 进度流的最后一条状态
pub const PROGRESS_COMPLETE: &str = "complete";

// 内容校验读取的字节数
const SIGNATURE_BYTES: usize = 64;

/// 一次提取的产出（尚未落库）
struct Extracted {
    data: HealthDataSet,
    skipped: usize,
    skip_reasons: Vec<SkipReason>,
}

impl From<ExtractionBuffer> for Extracted {
    fn from(buffer: ExtractionBuffer) -> Self {
        Self {
            data: buffer.data,
            skipped: buffer.skipped,
            skip_reasons: buffer.reasons,
        }
    }
}

/// 按首次出现顺序合并字段名
fn union_keys<'a, I: IntoIterator<Item = &'a RawRecord>>(records: I) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !keys.iter().any(|k| k == key) {
                keys.push(key.clone());
            }
        }
    }
    keys
}

fn decode_text(content: &[u8], format: SourceFormat) -> Result<&str, ImportError> {
    std::str::from_utf8(content).map_err(|e| {
        let message = format!("非 UTF-8 内容: {}", e);
        match format {
            SourceFormat::Tree => ImportError::json_structure(message),
            _ => ImportError::csv_structure(message),
        }
    })
}

// ==========================================
// HealthImporterImpl - 导入编排器
// ==========================================
pub struct HealthImporterImpl<S, C>
where
    S: HealthStore,
    C: ImportConfigReader,
{
    // 数据访问层
    store: S,

    // 配置读取器
    config: C,

    // 导入组件
    csv_parser: Box<dyn FileParser<Output = TabularDocument>>,
    json_parser: Box<dyn FileParser<Output = TreeDocument>>,
    inference: SchemaInference,
    normalizer: CanonicalNormalizer,

    // 单写入者闸门
    gate: Mutex<()>,
}

impl<S, C> HealthImporterImpl<S, C>
where
    S: HealthStore,
    C: ImportConfigReader,
{
    /// 使用默认解析器创建
    pub fn new(store: S, config: C) -> Self {
        Self::with_parsers(store, config, Box::new(CsvParser), Box::new(JsonParser))
    }

    /// 指定解析器创建
    pub fn with_parsers(
        store: S,
        config: C,
        csv_parser: Box<dyn FileParser<Output = TabularDocument>>,
        json_parser: Box<dyn FileParser<Output = TreeDocument>>,
    ) -> Self {
        Self {
            store,
            config,
            csv_parser,
            json_parser,
            inference: SchemaInference,
            normalizer: CanonicalNormalizer,
            gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // ===== 表格路径 =====

    fn extract_tabular(&self, content: &[u8], max_reasons: usize) -> Result<Extracted, ImportError> {
        let doc = self.csv_parser.parse(decode_text(content, SourceFormat::Tabular)?)?;
        info!(
            headers = doc.headers.len(),
            rows = doc.rows.len(),
            malformed = doc.malformed.len(),
            "表格解析完成"
        );

        // 日期列按表头判断（零数据行时同样要求）
        let resolution = self.inference.resolve(&doc.headers)?;
        debug!(date_field = %resolution.date_field, fields = resolution.fields.len(), "字段推断完成");

        let mut out = ExtractionBuffer::new(max_reasons);
        for reason in doc.malformed {
            out.skip(reason);
        }
        for row in &doc.rows {
            resolution.extract(
                &row.fields,
                &format!("行 {}", row.line),
                &self.normalizer,
                &mut out,
            );
        }
        Ok(out.into())
    }

    // ===== 结构化文档路径 =====

    fn extract_tree(&self, content: &[u8], max_reasons: usize) -> Result<Extracted, ImportError> {
        let doc = self.json_parser.parse(decode_text(content, SourceFormat::Tree)?)?;
        info!(records = doc.record_count(), "结构化文档解析完成");

        let mut out = ExtractionBuffer::new(max_reasons);
        match doc {
            TreeDocument::Records(records) => {
                if records.is_empty() {
                    return Ok(out.into());
                }
                let keys = union_keys(&records);
                let resolution = self.inference.resolve(&keys)?;
                for (idx, record) in records.iter().enumerate() {
                    resolution.extract(
                        record,
                        &format!("对象 #{}", idx + 1),
                        &self.normalizer,
                        &mut out,
                    );
                }
            }
            TreeDocument::Collections(collections) => {
                // 全部集合的字段并集中必须存在日期字段
                let all_keys = union_keys(collections.iter().flat_map(|(_, v)| v.iter()));
                if !all_keys.is_empty() && self.inference.find_date_field(&all_keys).is_none() {
                    return Err(ImportError::MissingTemporalField(all_keys.join(",")));
                }

                for (name, records) in &collections {
                    if records.is_empty() {
                        continue;
                    }
                    let keys = union_keys(records);
                    let resolution = kind_from_text(name)
                        .and_then(|kind| self.inference.resolve_for_kind(kind, &keys))
                        .map(Ok)
                        .unwrap_or_else(|| self.inference.resolve(&keys));

                    let resolution = match resolution {
                        Ok(r) => r,
                        Err(ImportError::MissingTemporalField(_)) => {
                            warn!(collection = %name, "集合缺少日期字段，整体跳过");
                            for idx in 0..records.len() {
                                out.skip(SkipReason::new(
                                    format!("{}[{}]", name, idx),
                                    "集合缺少日期字段",
                                ));
                            }
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    debug!(collection = %name, fields = resolution.fields.len(), "集合字段推断完成");
                    for (idx, record) in records.iter().enumerate() {
                        resolution.extract(
                            record,
                            &format!("{}[{}]", name, idx),
                            &self.normalizer,
                            &mut out,
                        );
                    }
                }
            }
        }
        Ok(out.into())
    }

    // ===== 层级文档路径（后台任务）=====

    async fn extract_hierarchical(
        &self,
        content: Vec<u8>,
        worker_config: WorkerConfig,
        progress: Option<&UnboundedSender<ProgressEvent>>,
        cancel: &CancellationToken,
    ) -> Result<Extracted, ImportError> {
        let notify = |event: ProgressEvent| {
            if let Some(tx) = progress {
                // 调用方不再接收时忽略
                let _ = tx.send(event);
            }
        };

        let worker_cancel = cancel.child_token();
        let WorkerHandle { mut receiver, join } =
            hierarchical_worker::spawn(content, worker_config, worker_cancel.clone());

        let mut last_percent = 0u8;
        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    worker_cancel.cancel();
                    break Err(ImportError::Cancelled);
                }
                message = receiver.recv() => match message {
                    Some(WorkerMessage::Status(status)) => notify(ProgressEvent::Status(status)),
                    Some(WorkerMessage::Total(total)) => {
                        debug!(total, "后台任务上报总记录数");
                    }
                    Some(WorkerMessage::Progress(percent)) => {
                        last_percent = last_percent.max(percent);
                        notify(ProgressEvent::Percent(last_percent));
                    }
                    Some(WorkerMessage::Error(failure)) => break Err(ImportError::from(failure)),
                    Some(WorkerMessage::Complete(payload)) => {
                        notify(ProgressEvent::Status(PROGRESS_COMPLETE.to_string()));
                        break Ok(payload);
                    }
                    None => break Err(ImportError::WorkerFault("后台解析任务意外退出".to_string())),
                },
            }
        };

        // 丢弃缓冲消息，等待任务退出
        drop(receiver);
        if let Err(e) = join.await {
            error!(error = %e, "后台解析任务异常退出");
            return Err(ImportError::WorkerFault(e.to_string()));
        }

        let payload = outcome?;
        info!(
            processed = payload.processed,
            skipped = payload.skipped,
            "层级文档提取完成"
        );
        Ok(Extracted {
            data: payload.data,
            skipped: payload.skipped,
            skip_reasons: payload.skip_reasons,
        })
    }
}

#[async_trait::async_trait]
impl<S, C> HealthImporter for HealthImporterImpl<S, C>
where
    S: HealthStore + Send + Sync,
    C: ImportConfigReader + Send + Sync,
{
    #[instrument(skip(self, source, progress, cancel), fields(file = %source.file_name, import_id))]
    async fn import(
        &self,
        source: ImportSource,
        progress: Option<UnboundedSender<ProgressEvent>>,
        cancel: CancellationToken,
    ) -> Result<ImportResult, ImportError> {
        // === 步骤 0: 获取导入闸门 ===
        let _gate = self.gate.try_lock().map_err(|_| {
            warn!("已有导入任务在执行中，拒绝本次导入");
            ImportError::ImportInProgress
        })?;

        let start_time = Instant::now();
        let import_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("import_id", import_id.as_str());

        let file_name = source.file_name.clone();
        let file_size = source.size_bytes();
        info!(import_id = %import_id, file = %file_name, size = file_size, "开始导入健康数据");

        // === 步骤 1: 格式识别 ===
        let format = classify(&file_name);
        if format == SourceFormat::Unsupported {
            warn!(file = %file_name, "文件格式不支持");
            return Err(ImportError::UnsupportedFormat(file_name));
        }
        info!(format = %format, "格式识别完成");

        let head = &source.content[..source.content.len().min(SIGNATURE_BYTES)];
        check_signature(format, head).map_err(|e| {
            error!(stage = %e.stage(), error = %e, "内容与扩展名不符");
            e
        })?;

        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        // === 步骤 2: 读取配置 ===
        let worker_config = self.config.worker_config().await?;

        // === 步骤 3: 解析 + 推断 + 规范化 ===
        let extracted = match format {
            SourceFormat::Tabular => {
                self.extract_tabular(&source.content, worker_config.max_skip_reasons)
            }
            SourceFormat::Tree => self.extract_tree(&source.content, worker_config.max_skip_reasons),
            SourceFormat::Hierarchical => {
                self.extract_hierarchical(source.content, worker_config, progress.as_ref(), &cancel)
                    .await
            }
            SourceFormat::Unsupported => Err(ImportError::UnsupportedFormat(file_name.clone())),
        }
        .map_err(|e| {
            error!(stage = %e.stage(), error = %e, "导入失败");
            e
        })?;

        let per_kind_counts = extracted.data.counts();
        let observed_date_range = extracted.data.date_range();
        info!(
            total = extracted.data.total_records(),
            skipped = extracted.skipped,
            "数据提取完成"
        );

        // 取消发生在提取之后也不落库
        if cancel.is_cancelled() {
            warn!("导入已取消，丢弃提取结果");
            return Err(ImportError::Cancelled);
        }

        // === 步骤 4: 单事务落库 ===
        let entry = ImportHistoryEntry {
            import_id: import_id.clone(),
            imported_at: Utc::now(),
            source_file_name: file_name.clone(),
            source_file_size_bytes: file_size,
            source_format: format,
            per_kind_counts: per_kind_counts.clone(),
            observed_date_range,
            skipped_records: extracted.skipped,
            elapsed_ms: start_time.elapsed().as_millis() as u64,
        };
        let replaced = self
            .store
            .commit_import(&extracted.data, entry)
            .await
            .map_err(|e| {
                error!(error = %e, "落库失败");
                ImportError::from(e)
            })?;

        info!(
            import_id = %import_id,
            replaced = ?replaced,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "导入完成"
        );

        Ok(ImportResult {
            import_id,
            source_format: format,
            per_kind_counts,
            observed_date_range,
            skipped_records: extracted.skipped,
            skip_reasons: extracted.skip_reasons,
        })
    }

    async fn import_file<P: AsRef<Path> + Send>(
        &self,
        file_path: P,
    ) -> Result<ImportResult, ImportError> {
        let path = file_path.as_ref();

        // 不支持的扩展名不读取文件内容
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if classify(&file_name) == SourceFormat::Unsupported {
            return Err(ImportError::UnsupportedFormat(path.display().to_string()));
        }

        let source = ImportSource::from_path(path).await?;
        self.import(source, None, CancellationToken::new()).await
    }

    async fn batch_import<P: AsRef<Path> + Send + Sync>(
        &self,
        file_paths: Vec<P>,
    ) -> Vec<Result<ImportResult, ImportError>> {
        use futures::stream::{self, StreamExt};

        info!(count = file_paths.len(), "开始批量导入文件");

        let results: Vec<Result<ImportResult, ImportError>> = stream::iter(file_paths)
            .then(|path| self.import_file(path))
            .collect()
            .await;

        let success = results.iter().filter(|r| r.is_ok()).count();
        info!(
            total = results.len(),
            success,
            failed = results.len() - success,
            "批量导入完成"
        );
        results
    }
}

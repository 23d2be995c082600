// ==========================================
// 健康数据导入引擎 - 导入 Trait
// ==========================================
// 职责: 定义导入接口（不包含实现）
// ==========================================

use crate::domain::health::ImportResult;
use crate::importer::error::ImportError;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

// ==========================================
// ImportSource - 待导入文件
// ==========================================
// 文件内容整体移交给导入流程（后台解析任务拿走所有权）
#[derive(Debug, Clone)]
pub struct ImportSource {
    pub file_name: String,
    pub content: Vec<u8>,
}

impl ImportSource {
    pub fn new(file_name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content,
        }
    }

    /// 从磁盘读取
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| ImportError::FileReadError(format!("{}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { file_name, content })
    }

    pub fn size_bytes(&self) -> u64 {
        self.content.len() as u64
    }
}

/// 转发给调用方的进度事件（仅 .xml 路径产生）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Status(String),
    Percent(u8),
}

// ==========================================
// HealthImporter Trait
// ==========================================
// 用途: 导入主接口
// 实现者: HealthImporterImpl
#[async_trait]
pub trait HealthImporter: Send + Sync {
    /// 导入一个文件
    ///
    /// # 参数
    /// - source: 文件名 + 内容
    /// - progress: 进度通道（可选）
    /// - cancel: 取消令牌，完成前任意时刻可取消
    ///
    /// # 返回
    /// - Ok(ImportResult): 各种类计数 + 日期范围
    /// - Err(ImportError): 任一致命错误，存储保持不变
    ///
    /// # 导入流程
    /// 1. 获取导入闸门（同一时刻仅一个导入）
    /// 2. 格式识别
    /// 3. 解析 + 字段推断 + 规范化
    /// 4. 单事务落库（数据 + 历史记录）
    async fn import(
        &self,
        source: ImportSource,
        progress: Option<UnboundedSender<ProgressEvent>>,
        cancel: CancellationToken,
    ) -> Result<ImportResult, ImportError>;

    /// 从磁盘路径导入（无进度、不可取消）
    async fn import_file<P: AsRef<Path> + Send>(
        &self,
        file_path: P,
    ) -> Result<ImportResult, ImportError>;

    /// 批量导入多个文件
    ///
    /// # 说明
    /// - 逐个执行（单写入者），每个文件结果互不影响
    /// - 某个文件失败不影响其他文件
    async fn batch_import<P: AsRef<Path> + Send + Sync>(
        &self,
        file_paths: Vec<P>,
    ) -> Vec<Result<ImportResult, ImportError>>;
}

// ==========================================
// FileParser Trait
// ==========================================
// 用途: 文本解析接口
// 实现者: CsvParser, JsonParser
pub trait FileParser: Send + Sync {
    type Output;

    /// 解析整段文本，结构不可解析时整体失败
    fn parse(&self, raw: &str) -> Result<Self::Output, ImportError>;
}

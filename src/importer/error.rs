// ==========================================
// 健康数据导入引擎 - 导入模块错误类型
// ==========================================
// 工具: thiserror 派生宏
// 策略: 致命错误终止本次导入且不落库；单条记录问题走 SkipReason，不在此处
// ==========================================

use crate::repository::error::RepositoryError;
use std::fmt;
use thiserror::Error;

/// 出错阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Classify,  // 格式识别
    Read,      // 文件读取
    Parse,     // 结构解析
    Inference, // 字段推断
    Worker,    // 后台解析
    Persist,   // 落库
    Config,    // 配置读取
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportStage::Classify => "classify",
            ImportStage::Read => "read",
            ImportStage::Parse => "parse",
            ImportStage::Inference => "inference",
            ImportStage::Worker => "worker",
            ImportStage::Persist => "persist",
            ImportStage::Config => "config",
        };
        write!(f, "{}", s)
    }
}

/// 导入模块错误类型
#[derive(Error, Debug)]
pub enum ImportError {
    // ===== 文件相关错误 =====
    #[error("文件格式不支持: {0}（仅支持 .csv/.json/.xml）")]
    UnsupportedFormat(String),

    #[error("文件读取失败: {0}")]
    FileReadError(String),

    #[error("文件结构解析失败 ({format}): {message}")]
    StructuralParseError { format: String, message: String },

    // ===== 字段推断错误 =====
    #[error("未找到日期字段: {0}")]
    MissingTemporalField(String),

    // ===== 后台解析错误 =====
    #[error("后台解析任务异常: {0}")]
    WorkerFault(String),

    #[error("导入已取消")]
    Cancelled,

    #[error("已有导入任务在执行中")]
    ImportInProgress,

    // ===== 数据库错误 =====
    #[error("数据落库失败: {0}")]
    StorageError(#[from] RepositoryError),

    // ===== 配置错误 =====
    #[error("配置读取失败 (key: {key}): {message}")]
    ConfigReadError { key: String, message: String },

    // ===== 通用错误 =====
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    pub fn csv_structure(message: impl Into<String>) -> Self {
        ImportError::StructuralParseError {
            format: "csv".to_string(),
            message: message.into(),
        }
    }

    pub fn json_structure(message: impl Into<String>) -> Self {
        ImportError::StructuralParseError {
            format: "json".to_string(),
            message: message.into(),
        }
    }

    pub fn xml_structure(message: impl Into<String>) -> Self {
        ImportError::StructuralParseError {
            format: "xml".to_string(),
            message: message.into(),
        }
    }

    /// 错误所属阶段（调用方展示 {stage, message}）
    pub fn stage(&self) -> ImportStage {
        match self {
            ImportError::UnsupportedFormat(_) => ImportStage::Classify,
            ImportError::FileReadError(_) => ImportStage::Read,
            ImportError::StructuralParseError { .. } => ImportStage::Parse,
            ImportError::MissingTemporalField(_) => ImportStage::Inference,
            ImportError::WorkerFault(_) | ImportError::Cancelled => ImportStage::Worker,
            ImportError::ImportInProgress => ImportStage::Classify,
            ImportError::StorageError(_) => ImportStage::Persist,
            ImportError::ConfigReadError { .. } => ImportStage::Config,
            ImportError::Other(_) => ImportStage::Persist,
        }
    }
}

// 实现 From<std::io::Error>
impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::FileReadError(err.to_string())
    }
}

// 实现 From<csv::Error>
impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::csv_structure(err.to_string())
    }
}

// 实现 From<serde_json::Error>
impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::json_structure(err.to_string())
    }
}

// 实现 From<quick_xml::Error>
impl From<quick_xml::Error> for ImportError {
    fn from(err: quick_xml::Error) -> Self {
        ImportError::xml_structure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mapping() {
        assert_eq!(
            ImportError::UnsupportedFormat("pdf".to_string()).stage(),
            ImportStage::Classify
        );
        assert_eq!(
            ImportError::MissingTemporalField("a,b".to_string()).stage(),
            ImportStage::Inference
        );
        assert_eq!(ImportError::Cancelled.stage(), ImportStage::Worker);
        assert_eq!(
            ImportError::json_structure("eof").stage(),
            ImportStage::Parse
        );
    }

    #[test]
    fn test_unsupported_message() {
        let err = ImportError::UnsupportedFormat("pdf".to_string());
        assert!(err.to_string().contains("pdf"));
    }
}

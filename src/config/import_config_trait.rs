// ==========================================
// 健康数据导入引擎 - 导入配置读取 Trait
// ==========================================
// 职责: 定义导入流程所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::importer::error::ImportError;
use crate::importer::hierarchical_worker::WorkerConfig;
use async_trait::async_trait;

// ==========================================
// ImportConfigReader Trait
// ==========================================
// 用途: 导入流程所需的配置读取接口
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait ImportConfigReader: Send + Sync {
    /// 后台解析的进度上报间隔（记录数）
    ///
    /// # 默认值
    /// - 1000
    async fn get_progress_interval(&self) -> Result<usize, ImportError>;

    /// ImportResult 中保留的跳过原因条数上限
    ///
    /// # 默认值
    /// - 20
    async fn get_max_skip_reasons(&self) -> Result<usize, ImportError>;

    /// 后台解析消息通道容量
    ///
    /// # 默认值
    /// - 64
    async fn get_worker_channel_capacity(&self) -> Result<usize, ImportError>;

    /// 汇总为后台解析配置
    async fn worker_config(&self) -> Result<WorkerConfig, ImportError> {
        Ok(WorkerConfig {
            progress_interval: self.get_progress_interval().await?,
            channel_capacity: self.get_worker_channel_capacity().await?,
            max_skip_reasons: self.get_max_skip_reasons().await?,
        })
    }
}

// ==========================================
// 健康数据导入引擎 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 职责: 提供数据访问接口，屏蔽数据库细节
// 约束: 所有查询使用参数化
// ==========================================

pub mod error;
pub mod health_store;
pub mod health_store_impl;

pub use error::{RepositoryError, RepositoryResult};
pub use health_store::{HealthStore, StoreSnapshot};
pub use health_store_impl::HealthStoreImpl;

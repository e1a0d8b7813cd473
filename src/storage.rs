//! 存储接口
//!
//! 配置分发只依赖这里定义的 trait：
//! - Project / Application / Deployment / Runner 的读取与幂等 upsert
//! - 每个实体的变更计数（快照版本号）
//! - 变更通知钩子
//!
//! 内置实现见 [`crate::db::SqliteStore`]。

use std::sync::Arc;

use crate::error::Result;
use crate::types::{
    Application, ConfigScope, ConfigVar, Deployment, DeploymentAssignment, EntityRef, Project,
    Runner, RunnerAssignment, Versioned,
};

/// 变更监听器
///
/// 在写入线程上同步调用，实现方只应做非阻塞的转发（例如投递到 channel）。
pub type ChangeListener = Arc<dyn Fn(&EntityRef) + Send + Sync>;

/// 存储接口
pub trait Storage: Send + Sync {
    /// 幂等创建 Project；已存在时不做任何修改
    fn upsert_project(&self, name: &str) -> Result<Project>;

    fn get_project(&self, name: &str) -> Result<Option<Project>>;

    /// 幂等创建 Application（按 (project, name)）；project 不存在时一并创建
    fn upsert_application(&self, project: &str, name: &str) -> Result<Application>;

    fn get_application(&self, project: &str, name: &str) -> Result<Option<Application>>;

    /// 按 id 整体替换 Deployment，`id` 为空时生成
    ///
    /// 内容未变化时不递增版本、不触发通知。
    fn upsert_deployment(&self, deployment: Deployment) -> Result<Deployment>;

    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>>;

    /// Deployment 及其应用作用域配置变量，附带一致的版本号
    fn get_deployment_assignment(&self, id: &str)
        -> Result<Option<Versioned<DeploymentAssignment>>>;

    /// upsert Runner，`id` 为空时生成
    fn upsert_runner(&self, runner: Runner) -> Result<Runner>;

    fn get_runner(&self, id: &str) -> Result<Option<Runner>>;

    /// Runner 及其 runner 作用域配置变量，附带一致的版本号
    fn get_runner_assignment(&self, id: &str) -> Result<Option<Versioned<RunnerAssignment>>>;

    /// 设置配置变量，返回是否发生了变化
    fn set_config_var(&self, var: ConfigVar) -> Result<bool>;

    /// 删除配置变量，返回是否存在
    fn delete_config_var(&self, scope: &ConfigScope, name: &str) -> Result<bool>;

    /// 实体当前版本，实体不存在时返回 None
    fn entity_version(&self, entity: &EntityRef) -> Result<Option<u64>>;

    /// 注册变更监听器
    fn on_change(&self, listener: ChangeListener);
}

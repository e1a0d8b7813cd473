//! 数据类型定义

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Agent 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// 执行部署任务的 runner
    Runner,
    /// 运行在部署实例内的 entrypoint
    Entrypoint,
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "runner" => Ok(AgentKind::Runner),
            "entrypoint" => Ok(AgentKind::Entrypoint),
            _ => Err(format!("Invalid agent kind: {}", s)),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Runner => write!(f, "runner"),
            AgentKind::Entrypoint => write!(f, "entrypoint"),
        }
    }
}

/// 配置分发的实体引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    /// Deployment（entrypoint 订阅）
    Deployment(String),
    /// Runner assignment（runner 订阅）
    Runner(String),
}

impl EntityRef {
    /// 实体 ID
    pub fn id(&self) -> &str {
        match self {
            EntityRef::Deployment(id) | EntityRef::Runner(id) => id,
        }
    }

    /// 存储中使用的类型名
    pub fn kind_str(&self) -> &'static str {
        match self {
            EntityRef::Deployment(_) => "deployment",
            EntityRef::Runner(_) => "runner",
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind_str(), self.id())
    }
}

/// 组件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Builder,
    Registry,
    Platform,
    ReleaseManager,
}

impl FromStr for ComponentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "builder" => Ok(ComponentType::Builder),
            "registry" => Ok(ComponentType::Registry),
            "platform" => Ok(ComponentType::Platform),
            "release_manager" => Ok(ComponentType::ReleaseManager),
            _ => Err(format!("Invalid component type: {}", s)),
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentType::Builder => write!(f, "builder"),
            ComponentType::Registry => write!(f, "registry"),
            ComponentType::Platform => write!(f, "platform"),
            ComponentType::ReleaseManager => write!(f, "release_manager"),
        }
    }
}

/// 组件描述（产出 deployment 的插件）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub name: String,
}

/// 项目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub created_at: i64,
}

/// 应用引用 (project, application)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub project: String,
    pub application: String,
}

impl ApplicationRef {
    pub fn new(project: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            application: application.into(),
        }
    }
}

impl fmt::Display for ApplicationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.application)
    }
}

/// 应用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub project: String,
    pub name: String,
    pub created_at: i64,
}

/// 部署
///
/// upsert 语义为按 id 整体替换；`id` 为空时由存储生成。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub id: String,
    pub application: ApplicationRef,
    pub workspace: String,
    pub component: Component,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Runner
///
/// 注册时与调用方模板合并：模板中已设置的字段优先，生成的 id 只填补空缺。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Runner {
    /// 用 `defaults` 填补未设置的字段，已有字段不被覆盖
    pub fn merge_defaults(mut self, defaults: Runner) -> Runner {
        if self.id.is_empty() {
            self.id = defaults.id;
        }
        for (key, value) in defaults.labels {
            self.labels.entry(key).or_insert(value);
        }
        if self.description.is_none() {
            self.description = defaults.description;
        }
        self
    }
}

/// 配置变量作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ConfigScope {
    /// 下发给该应用所有 deployment 的 entrypoint
    Application(ApplicationRef),
    /// 下发给指定 runner；`id` 为 None 时下发给全部 runner
    Runner {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

/// 配置变量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVar {
    #[serde(flatten)]
    pub scope: ConfigScope,
    pub name: String,
    pub value: String,
}

/// 带版本号的存储读取结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// entrypoint 视角的 deployment 状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentAssignment {
    pub deployment: Deployment,
    pub config_vars: Vec<ConfigVar>,
}

/// runner 视角的 assignment 状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerAssignment {
    pub runner: Runner,
    pub config_vars: Vec<ConfigVar>,
}

/// entrypoint 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrypointConfig {
    pub deployment_id: String,
    pub project: String,
    pub application: String,
    pub workspace: String,
    pub component: Component,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// 环境变量（应用作用域的配置变量）
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// runner 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub runner_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub config_vars: BTreeMap<String, String>,
}

/// 快照载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "for", rename_all = "lowercase")]
pub enum ConfigPayload {
    Entrypoint(EntrypointConfig),
    Runner(RunnerConfig),
}

/// 下发给 agent 的配置快照
///
/// 同一实体的快照按 `version` 全序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub entity: EntityRef,
    pub version: u64,
    pub payload: ConfigPayload,
}

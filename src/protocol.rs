//! 注册协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//!
//! 时序：
//! 1. agent 发送 `Open`
//! 2. 服务端回 `Config`（初始快照）或唯一一条 `Error` 后断开
//! 3. 之后每次实体变化推送一条 `Config`，版本递增
//! 4. 服务端主动关闭时先发 `Closed`

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::hub::CloseReason;
use crate::types::{AgentKind, ConfigSnapshot, Runner};

/// 注册请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Open {
    pub kind: AgentKind,
    /// 实例标识，为空时由服务端生成
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// entrypoint 所属 deployment（entrypoint 必填）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    /// runner 模板（仅 runner）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<Runner>,
}

impl Open {
    pub fn entrypoint(deployment_id: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::Entrypoint,
            identity: None,
            deployment_id: Some(deployment_id.into()),
            runner: None,
        }
    }

    pub fn runner() -> Self {
        Self {
            kind: AgentKind::Runner,
            identity: None,
            deployment_id: None,
            runner: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_runner(mut self, template: Runner) -> Self {
        self.runner = Some(template);
        self
    }
}

/// 请求类型（Agent → Server）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 注册并开始接收配置
    Open(Open),

    /// 心跳（保持连接）
    Heartbeat,

    /// 查询
    Query {
        /// 查询类型
        query_type: QueryType,
    },
}

/// 响应类型（Server → Agent）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 配置快照（初始或变更推送）
    Config { snapshot: ConfigSnapshot },

    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 服务端关闭了会话
    Closed { reason: CloseReason },

    /// 查询结果
    QueryResult { data: serde_json::Value },
}

impl Response {
    /// 序列化为一行 JSONL
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// 查询类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// 服务状态
    Status,
    /// 活跃会话数
    SessionCount,
}

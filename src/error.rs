//! 错误类型定义

use std::time::Duration;

use thiserror::Error;

use crate::types::{AgentKind, EntityRef};

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 标识非法（格式错误，或调用方要求必填但为空）
    #[error("标识非法: {0}")]
    InvalidIdentity(String),

    /// 引用的实体不存在
    #[error("实体不存在: {0}")]
    NotFound(EntityRef),

    /// 同一身份已有活跃会话（仅 Reject 策略下返回）
    #[error("{kind} `{identity}` 已有活跃会话")]
    AlreadyActive { kind: AgentKind, identity: String },

    /// 注册超时
    #[error("注册超时 ({0:?})")]
    Timeout(Duration),

    /// 对端关闭连接（正常终止路径）
    #[error("连接已关闭")]
    TransportClosed,

    /// 输入校验失败
    #[error("校验失败: {0}")]
    Validation(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 协议错误码（写入 `Response::Error`）
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidIdentity(_) | Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Timeout(_) => 408,
            Error::AlreadyActive { .. } => 409,
            Error::TransportClosed => 499,
            _ => 500,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;

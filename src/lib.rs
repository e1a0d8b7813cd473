//! agent-config-hub - runner / entrypoint 配置分发
//!
//! 部署系统的控制面：runner 与 entrypoint 通过长连接注册，
//! 服务端下发初始配置快照，之后在配置变化时推送新版本。
//!
//! # 核心功能
//!
//! - **身份**: 解析或生成 agent 标识，runner 模板合并
//! - **快照**: 按实体（deployment / runner）构建带版本号的配置
//! - **会话**: `Opening → Streaming → Closed` 状态机，最新值槽合并推送
//! - **注册表**: (kind, identity) 唯一活跃会话，重复身份按策略处理
//! - **存储**: SQLite 实现的 [`Storage`]，写入后触发变更通知
//!
//! # Feature Flags
//!
//! - `server`: Unix Socket 服务端 + `config-hub` 守护进程
//! - `client`: Agent Client（runner / entrypoint 使用）

pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod identity;
pub mod migrations;
pub mod protocol;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod types;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use config::{ConnectionMode, DuplicatePolicy, HubConfig, StoreConfig};
pub use db::SqliteStore;
pub use error::{Error, Result};
pub use hub::{
    ChangeNotifier, CloseReason, Handler, Session, SessionRegistry, SessionState, SnapshotStream,
};
pub use identity::{IdentityManager, Requirement};
pub use protocol::{Open, QueryType, Request, Response};
pub use snapshot::SnapshotBuilder;
pub use storage::{ChangeListener, Storage};
pub use types::*;

#[cfg(feature = "server")]
pub use hub::{cleanup_stale_server, is_server_running, ConfigServer, ServerConfig};

#[cfg(feature = "client")]
pub use client::{AgentClient, ClientConfig};

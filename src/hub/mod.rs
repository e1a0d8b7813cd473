//! 配置分发核心
//!
//! - 会话状态机与快照交付流（`session`）
//! - 会话注册表（`registry`）
//! - 存储变更 → 快照推送（`notifier`）
//! - 注册流程与查询（`handler`）
//! - Unix Socket 服务端（`server`，需要 `server` feature）

mod handler;
mod notifier;
mod registry;
mod session;

#[cfg(feature = "server")]
mod server;

pub use handler::{Handler, HUB_VERSION};
pub use notifier::ChangeNotifier;
pub use registry::SessionRegistry;
pub use session::{CloseReason, Session, SessionId, SessionKey, SessionState, SnapshotStream};

#[cfg(feature = "server")]
pub use server::{cleanup_stale_server, is_server_running, ConfigServer, ServerConfig};

//! Agent Client 模块
//!
//! runner / entrypoint 连接 config-hub 的客户端

mod connect;

pub use connect::{AgentClient, ClientConfig};

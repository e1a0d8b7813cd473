//! config-hub - runner / entrypoint 配置分发服务
//!
//! 负责：
//! - agent 注册（身份解析、初始快照）
//! - 配置变化推送
//! - 重复身份处理

use std::sync::Arc;

use agent_config_hub::hub::{cleanup_stale_server, is_server_running, ConfigServer, ServerConfig};
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("agent_config_hub=debug".parse()?))
        .init();

    tracing::info!("🚀 config-hub v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env()?;
    tracing::debug!(
        "data_dir={:?}, registration_timeout={:?}, duplicate_policy={:?}",
        config.data_dir,
        config.hub.registration_timeout,
        config.hub.duplicate_policy
    );

    if is_server_running(&config) {
        tracing::error!("❌ config-hub is already running, exiting");
        std::process::exit(1);
    }

    if let Err(e) = cleanup_stale_server(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    let server = Arc::new(ConfigServer::new(config)?);
    server.run().await?;

    tracing::info!("👋 config-hub exiting");
    Ok(())
}

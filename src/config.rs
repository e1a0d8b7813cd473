//! 配置
//!
//! - [`StoreConfig`]: 存储连接配置
//! - [`HubConfig`]: 注册 / 会话策略

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// 默认注册超时
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// 存储连接配置
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// 连接 URL
    /// - 本地: 文件路径
    /// - 内存: ":memory:"
    pub url: String,

    /// 连接模式
    pub mode: ConnectionMode,
}

/// 连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 本地 SQLite 文件
    Local,
    /// 进程内内存库（测试 / 临时实例）
    InMemory,
}

impl StoreConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            mode: ConnectionMode::Local,
        }
    }

    /// 创建内存库配置
    pub fn in_memory() -> Self {
        Self {
            url: ":memory:".to_string(),
            mode: ConnectionMode::InMemory,
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(url) = std::env::var("CONFIG_HUB_DB_URL") {
            if url == ":memory:" {
                return Self::in_memory();
            }
            return Self::local(url);
        }

        // 默认路径: ~/.config-hub/db/config-hub.db
        let default_path = dirs::home_dir()
            .map(|h| h.join(".config-hub").join("db").join("config-hub.db"))
            .unwrap_or_else(|| PathBuf::from("config-hub.db"));

        Self::local(default_path)
    }

    /// 获取数据库文件路径 (仅本地模式)
    pub fn path(&self) -> Option<PathBuf> {
        match self.mode {
            ConnectionMode::Local => Some(PathBuf::from(&self.url)),
            ConnectionMode::InMemory => None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// 同一 (kind, identity) 重复注册时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// 关闭旧会话，接纳新会话
    #[default]
    Supersede,
    /// 拒绝新会话（`Error::AlreadyActive`）
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "supersede" => Ok(DuplicatePolicy::Supersede),
            "reject" => Ok(DuplicatePolicy::Reject),
            _ => Err(Error::Config(format!("未知的重复注册策略: {}", s))),
        }
    }
}

/// 注册 / 会话配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Opening 阶段的最长耗时
    pub registration_timeout: Duration,
    /// 重复身份策略
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl HubConfig {
    /// 从环境变量读取，未设置的项使用默认值
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("CONFIG_HUB_REGISTRATION_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("CONFIG_HUB_REGISTRATION_TIMEOUT_MS 非法: {}", ms)))?;
            config.registration_timeout = Duration::from_millis(ms);
        }

        if let Ok(policy) = std::env::var("CONFIG_HUB_DUPLICATE_POLICY") {
            config.duplicate_policy = policy.parse()?;
        }

        Ok(config)
    }
}

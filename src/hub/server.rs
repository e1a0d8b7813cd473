//! 配置分发服务器
//!
//! Unix Socket 服务，每个连接承载一个 agent 会话

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handler::Handler;
use super::notifier::ChangeNotifier;
use super::registry::SessionRegistry;
use super::session::{CloseReason, Session, SnapshotStream};
use crate::config::{HubConfig, StoreConfig};
use crate::db::SqliteStore;
use crate::protocol::{Request, Response};
use crate::snapshot::SnapshotBuilder;

/// 服务器配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 数据目录（默认 ~/.config-hub）
    pub data_dir: PathBuf,
    /// 注册 / 会话策略
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config-hub");

        Self {
            data_dir,
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// 使用指定数据目录
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// 从环境变量读取（`CONFIG_HUB_DATA_DIR` 及 [`HubConfig::from_env`] 的变量）
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self {
            hub: HubConfig::from_env()?,
            ..Default::default()
        };
        if let Ok(dir) = std::env::var("CONFIG_HUB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("config-hub.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("config-hub.pid")
    }

    /// 数据库路径
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("config-hub.db")
    }
}

/// 配置分发服务
pub struct ConfigServer {
    config: ServerConfig,
    store: Arc<SqliteStore>,
    registry: Arc<SessionRegistry>,
    notifier: Arc<ChangeNotifier>,
    handler: Arc<Handler>,
    shutdown: CancellationToken,
}

impl ConfigServer {
    /// 创建服务（数据库位于 `data_dir/db`）
    pub fn new(config: ServerConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;
        fs::create_dir_all(config.data_dir.join("db")).context("创建数据库目录失败")?;

        let store = SqliteStore::open(StoreConfig::local(config.db_path()))
            .context("打开数据库失败")?;

        Self::with_store(config, Arc::new(store))
    }

    /// 使用已打开的存储创建服务
    pub fn with_store(config: ServerConfig, store: Arc<SqliteStore>) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        let builder = SnapshotBuilder::new(store.clone());
        let registry = SessionRegistry::new(config.hub.duplicate_policy);
        let notifier = ChangeNotifier::new(registry.clone(), builder.clone());
        let handler = Arc::new(Handler::new(
            store.clone(),
            builder,
            registry.clone(),
            config.hub.clone(),
        ));

        Ok(Self {
            config,
            store,
            registry,
            notifier,
            handler,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// 底层存储（管理端写入配置用）
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 请求停止服务
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 运行服务直到收到中断信号或 [`ConfigServer::shutdown`]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.write_pid_file()?;

        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        let fan_out = self.notifier.clone().start(self.store.as_ref());

        tracing::info!("🚀 Config hub listening: {:?}", socket_path);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    self.shutdown.cancel();
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("收到停止请求，准备退出...");
                    break;
                }
            }
        }

        // 此时 shutdown 已取消，之后才注册成功的会话由连接自行关闭
        let closed = self.registry.close_all(CloseReason::Shutdown);
        if closed > 0 {
            tracing::info!("🔒 Closed {} sessions on shutdown", closed);
        }
        fan_out.abort();

        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let (tx, mut rx) = mpsc::channel::<String>(100);

        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut session: Option<Arc<Session>> = None;
        let mut pump = None;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = session_closed(session.as_deref()) => break,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("读取失败: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let request: Request = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("解析请求失败: {}", e);
                    let response = Response::Error {
                        code: 400,
                        message: format!("Invalid JSON: {}", e),
                    };
                    if tx.send(response.to_line()?).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let response = match request {
                Request::Open(open) => {
                    if session.is_some() {
                        Response::Error {
                            code: 400,
                            message: "会话已注册".to_string(),
                        }
                    } else if self.shutdown.is_cancelled() {
                        let response = Response::Error {
                            code: 503,
                            message: "服务正在关闭".to_string(),
                        };
                        let _ = tx.send(response.to_line()?).await;
                        break;
                    } else {
                        match self.handler.open(open).await {
                            Ok(stream) => {
                                // 注册与 close_all 交错时补关
                                if self.shutdown.is_cancelled() {
                                    self.handler.close(stream.session(), CloseReason::Shutdown);
                                }
                                session = Some(stream.session().clone());
                                pump = Some(tokio::spawn(pump_snapshots(stream, tx.clone())));
                                continue;
                            }
                            Err(e) => {
                                // 注册失败只回一条错误，随后断开
                                let _ = tx.send(Response::from(&e).to_line()?).await;
                                break;
                            }
                        }
                    }
                }
                Request::Heartbeat => Response::Ok,
                Request::Query { query_type } => self.handler.query(query_type),
            };

            if tx.send(response.to_line()?).await.is_err() {
                break;
            }
        }

        if let Some(session) = &session {
            self.handler.close(session, CloseReason::AgentDisconnected);
        }
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        // 等待剩余消息写出
        drop(tx);
        let _ = write_handle.await;

        if let Some(session) = session {
            tracing::debug!(
                "📤 连接关闭: session={}, reason={:?}",
                session.id(),
                session.close_reason()
            );
        }
        Ok(())
    }

    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    fn cleanup(&self) {
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Config hub 清理完成");
    }
}

async fn session_closed(session: Option<&Session>) {
    match session {
        Some(session) => session.closed().await,
        None => std::future::pending().await,
    }
}

/// 把快照流写到连接；服务端主动关闭时补发 `Closed`
async fn pump_snapshots(mut stream: SnapshotStream, tx: mpsc::Sender<String>) {
    while let Some(snapshot) = stream.next().await {
        let line = match (Response::Config { snapshot }).to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("序列化快照失败: {}", e);
                continue;
            }
        };
        if tx.send(line).await.is_err() {
            return;
        }
    }

    match stream.session().close_reason() {
        Some(CloseReason::AgentDisconnected) | None => {}
        Some(reason) => {
            if let Ok(line) = (Response::Closed { reason }).to_line() {
                let _ = tx.send(line).await;
            }
        }
    }
}

/// 检查服务是否正在运行
pub fn is_server_running(config: &ServerConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 socket / PID 文件
pub fn cleanup_stale_server(config: &ServerConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}

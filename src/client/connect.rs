//! Agent 端连接逻辑
//!
//! 连接 config-hub、注册并持续接收配置快照

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::DEFAULT_REGISTRATION_TIMEOUT;
use crate::error::Error;
use crate::hub::CloseReason;
use crate::protocol::{Open, QueryType, Request, Response};
use crate::types::ConfigSnapshot;

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 服务端 socket 路径（默认 ~/.config-hub/config-hub.sock）
    pub socket_path: PathBuf,
    /// 等待初始快照的最长时间
    pub registration_timeout: Duration,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let socket_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config-hub")
            .join("config-hub.sock");

        Self {
            socket_path,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            connect_retries: 3,
            retry_interval_ms: 500,
        }
    }
}

impl ClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }
}

/// Agent Client
///
/// 一个连接对应一个会话：先 [`open`](AgentClient::open)，
/// 再循环 [`next_snapshot`](AgentClient::next_snapshot)。
pub struct AgentClient {
    config: ClientConfig,
    /// 写入端
    writer: OwnedWriteHalf,
    /// 服务端消息（每行一条）
    incoming: mpsc::Receiver<String>,
    /// 等待其他响应时收到的快照
    pending: VecDeque<ConfigSnapshot>,
    /// 服务端给出的关闭原因
    close_reason: Option<CloseReason>,
}

impl AgentClient {
    /// 连接服务端（按配置重试）
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let retries = config.connect_retries.max(1);

        for attempt in 1..=retries {
            match UnixStream::connect(&config.socket_path).await {
                Ok(stream) => {
                    tracing::debug!("连接 config-hub 成功 (attempt={})", attempt);
                    return Ok(Self::from_stream(config, stream));
                }
                Err(e) => {
                    tracing::debug!("连接 config-hub 失败 (attempt={}): {}", attempt, e);
                    if attempt < retries {
                        sleep(Duration::from_millis(config.retry_interval_ms)).await;
                    }
                }
            }
        }

        bail!("无法连接 config-hub: {:?}", config.socket_path)
    }

    fn from_stream(config: ClientConfig, stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let (incoming_tx, incoming) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if incoming_tx.send(line.trim().to_string()).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            config,
            writer,
            incoming,
            pending: VecDeque::new(),
            close_reason: None,
        }
    }

    /// 注册并返回初始快照
    pub async fn open(&mut self, open: Open) -> Result<ConfigSnapshot> {
        self.send(&Request::Open(open)).await?;

        let timeout = self.config.registration_timeout;
        let response = tokio::time::timeout(timeout, self.recv())
            .await
            .with_context(|| format!("等待初始快照超时 ({:?})", timeout))??;

        match response {
            Some(Response::Config { snapshot }) => {
                tracing::info!("✅ 注册成功: {} v{}", snapshot.entity, snapshot.version);
                Ok(snapshot)
            }
            Some(Response::Error { code, message }) => {
                bail!("注册失败: {} (code={})", message, code)
            }
            Some(Response::Closed { reason }) => {
                self.close_reason = Some(reason);
                bail!("注册期间会话被关闭: {:?}", reason)
            }
            Some(_) => bail!("注册响应异常"),
            None => Err(Error::TransportClosed.into()),
        }
    }

    /// 等待下一份快照；会话结束时返回 `None`
    pub async fn next_snapshot(&mut self) -> Result<Option<ConfigSnapshot>> {
        if let Some(snapshot) = self.pending.pop_front() {
            return Ok(Some(snapshot));
        }

        loop {
            match self.recv().await? {
                Some(Response::Config { snapshot }) => return Ok(Some(snapshot)),
                Some(Response::Closed { reason }) => {
                    tracing::info!("🔒 会话被服务端关闭: {:?}", reason);
                    self.close_reason = Some(reason);
                    return Ok(None);
                }
                Some(Response::Error { code, message }) => {
                    bail!("服务端错误: {} (code={})", message, code)
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// 发送心跳
    pub async fn heartbeat(&mut self) -> Result<()> {
        self.send(&Request::Heartbeat).await?;
        match self.recv_reply().await? {
            Response::Ok => Ok(()),
            _ => bail!("心跳响应异常"),
        }
    }

    /// 查询服务状态
    pub async fn query(&mut self, query_type: QueryType) -> Result<serde_json::Value> {
        self.send(&Request::Query { query_type }).await?;
        match self.recv_reply().await? {
            Response::QueryResult { data } => Ok(data),
            _ => bail!("查询响应异常"),
        }
    }

    /// 服务端给出的关闭原因（若有）
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// 关闭发送端，结束会话
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Response>> {
        match self.incoming.recv().await {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// 读取一条非快照响应，途中的快照暂存；连接中断时返回 [`Error::TransportClosed`]
    async fn recv_reply(&mut self) -> Result<Response> {
        loop {
            match self.recv().await? {
                Some(Response::Config { snapshot }) => self.pending.push_back(snapshot),
                Some(Response::Closed { reason }) => {
                    self.close_reason = Some(reason);
                    bail!("会话已被关闭: {:?}", reason)
                }
                Some(Response::Error { code, message }) => {
                    bail!("服务端错误: {} (code={})", message, code)
                }
                Some(response) => return Ok(response),
                None => return Err(Error::TransportClosed.into()),
            }
        }
    }
}

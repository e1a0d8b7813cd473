//! 会话状态机
//!
//! `Opening → Streaming → Closed`，`Closed` 为终态。
//!
//! 推送使用 `watch` 通道作为单值槽：投递前较新的快照覆盖较旧的，
//! 不会积压无界队列；[`SnapshotStream`] 只交付比上一次更新的版本。

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::types::{AgentKind, ConfigSnapshot, EntityRef};

/// 会话 ID（进程内唯一）
pub type SessionId = u64;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Streaming,
    Closed,
}

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// agent 断开或关闭发送端
    AgentDisconnected,
    /// 同一身份的新会话取代了本会话
    Superseded,
    /// 变更后重建快照失败
    StorageError,
    /// 注册未完成（超时或出错）
    RegistrationFailed,
    /// 服务关闭
    Shutdown,
}

/// 注册表中的会话键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub kind: AgentKind,
    pub identity: String,
}

impl SessionKey {
    pub fn new(kind: AgentKind, identity: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
        }
    }
}

struct Lifecycle {
    state: SessionState,
    close_reason: Option<CloseReason>,
}

/// 服务端会话
pub struct Session {
    id: SessionId,
    key: SessionKey,
    entity: EntityRef,
    lifecycle: Mutex<Lifecycle>,
    latest: watch::Sender<Option<ConfigSnapshot>>,
    updates: Mutex<Option<watch::Receiver<Option<ConfigSnapshot>>>>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: SessionId, key: SessionKey, entity: EntityRef) -> Arc<Self> {
        let (latest, updates) = watch::channel(None);
        Arc::new(Self {
            id,
            key,
            entity,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Opening,
                close_reason: None,
            }),
            latest,
            updates: Mutex::new(Some(updates)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn kind(&self) -> AgentKind {
        self.key.kind
    }

    pub fn identity(&self) -> &str {
        &self.key.identity
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.lock().close_reason
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 等待会话关闭
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// 投递新快照，返回是否被接受
    ///
    /// 已关闭、实体不匹配、或版本不比槽内更新时丢弃。
    pub fn push(&self, snapshot: ConfigSnapshot) -> bool {
        if self.is_closed() || snapshot.entity != self.entity {
            return false;
        }

        self.latest.send_if_modified(|slot| match slot {
            Some(current) if current.version >= snapshot.version => false,
            _ => {
                *slot = Some(snapshot);
                true
            }
        })
    }

    /// 关闭会话；首次关闭返回 true，重复调用无副作用
    ///
    /// 只能经由 `SessionRegistry` 调用，保证映射同步移除。
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Closed {
            return false;
        }
        lifecycle.state = SessionState::Closed;
        lifecycle.close_reason = Some(reason);
        drop(lifecycle);

        self.cancel.cancel();
        tracing::debug!(
            "🔒 Session closed: id={}, {} {}, reason={:?}",
            self.id,
            self.key.kind,
            self.key.identity,
            reason
        );
        true
    }

    fn begin_streaming(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SessionState::Opening => {
                lifecycle.state = SessionState::Streaming;
                true
            }
            SessionState::Streaming => true,
            SessionState::Closed => false,
        }
    }

    /// 取出快照流，首项为 `initial`；每个会话只能取一次
    pub(crate) fn stream(self: &Arc<Self>, initial: ConfigSnapshot) -> Option<SnapshotStream> {
        let updates = self.updates.lock().take()?;
        Some(SnapshotStream {
            session: self.clone(),
            initial: Some(initial),
            updates,
            last_version: 0,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("entity", &self.entity)
            .field("state", &self.state())
            .finish()
    }
}

/// 会话的快照交付流
///
/// 第一项总是初始快照；之后按版本递增交付，中间版本可能被合并。
/// 会话关闭后返回 `None`。
pub struct SnapshotStream {
    session: Arc<Session>,
    initial: Option<ConfigSnapshot>,
    updates: watch::Receiver<Option<ConfigSnapshot>>,
    last_version: u64,
}

impl std::fmt::Debug for SnapshotStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStream")
            .field("session", &self.session)
            .field("pending_initial", &self.initial.as_ref().map(|s| s.version))
            .field("last_version", &self.last_version)
            .finish()
    }
}

impl SnapshotStream {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// 最近一次交付的版本
    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    pub async fn next(&mut self) -> Option<ConfigSnapshot> {
        if let Some(initial) = self.initial.take() {
            // 初始快照交给传输层即进入 Streaming
            if !self.session.begin_streaming() {
                return None;
            }
            self.last_version = initial.version;
            return Some(initial);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.session.cancel.cancelled() => return None,
                changed = self.updates.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    let latest = self.updates.borrow_and_update().clone();
                    if let Some(snapshot) = latest {
                        if snapshot.version > self.last_version {
                            self.last_version = snapshot.version;
                            return Some(snapshot);
                        }
                    }
                }
            }
        }
    }
}

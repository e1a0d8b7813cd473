//! 会话注册表
//!
//! 维护两张映射：
//! - (kind, identity) → 唯一活跃会话
//! - EntityRef → 订阅该实体的会话集合
//!
//! 所有修改都在同一把锁内完成；推送不持锁。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::session::{CloseReason, Session, SessionId, SessionKey};
use crate::config::DuplicatePolicy;
use crate::error::{Error, Result};
use crate::types::{AgentKind, EntityRef};

#[derive(Default)]
struct Maps {
    /// (kind, identity) → 会话
    by_identity: HashMap<SessionKey, Arc<Session>>,
    /// 实体 → 会话集合
    by_entity: HashMap<EntityRef, HashMap<SessionId, Arc<Session>>>,
}

impl Maps {
    /// 移除会话的映射（仅当映射仍指向该会话）
    fn remove(&mut self, session: &Session) -> bool {
        let mut removed = false;

        if self
            .by_identity
            .get(session.key())
            .is_some_and(|active| active.id() == session.id())
        {
            self.by_identity.remove(session.key());
            removed = true;
        }

        if let Some(set) = self.by_entity.get_mut(session.entity()) {
            removed |= set.remove(&session.id()).is_some();
            if set.is_empty() {
                self.by_entity.remove(session.entity());
            }
        }

        removed
    }
}

/// 会话注册表
pub struct SessionRegistry {
    maps: Mutex<Maps>,
    next_session_id: AtomicU64,
    policy: DuplicatePolicy,
}

impl SessionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Arc<Self> {
        Arc::new(Self {
            maps: Mutex::new(Maps::default()),
            next_session_id: AtomicU64::new(1),
            policy,
        })
    }

    /// 创建处于 Opening 状态的会话（尚未注册）
    pub fn create_session(&self, key: SessionKey, entity: EntityRef) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Session::new(id, key, entity)
    }

    /// 注册会话
    ///
    /// 同一身份已有活跃会话时按策略处理：Supersede 关闭旧会话并返回它，
    /// Reject 返回 `AlreadyActive`。
    pub fn register(&self, session: &Arc<Session>) -> Result<Option<Arc<Session>>> {
        let mut maps = self.maps.lock();

        if session.is_closed() {
            return Err(Error::Validation(format!("会话 {} 已关闭，不能注册", session.id())));
        }

        let mut superseded = None;
        if let Some(prior) = maps.by_identity.get(session.key()).cloned() {
            if prior.id() == session.id() {
                return Ok(None);
            }
            match self.policy {
                DuplicatePolicy::Reject => {
                    return Err(Error::AlreadyActive {
                        kind: session.kind(),
                        identity: session.identity().to_string(),
                    });
                }
                DuplicatePolicy::Supersede => {
                    prior.close(CloseReason::Superseded);
                    maps.remove(&prior);
                    superseded = Some(prior);
                }
            }
        }

        maps.by_identity.insert(session.key().clone(), session.clone());
        maps.by_entity
            .entry(session.entity().clone())
            .or_default()
            .insert(session.id(), session.clone());

        tracing::debug!(
            "📡 Session registered: id={}, {} {}, entity={}",
            session.id(),
            session.kind(),
            session.identity(),
            session.entity()
        );
        Ok(superseded)
    }

    /// 关闭并注销会话（幂等），返回本次调用是否执行了关闭
    pub fn close(&self, session: &Session, reason: CloseReason) -> bool {
        let closed = session.close(reason);
        self.deregister(session);
        closed
    }

    /// 移除会话映射（幂等）；已被新会话取代的身份槽不受影响
    pub fn deregister(&self, session: &Session) -> bool {
        let removed = self.maps.lock().remove(session);
        if removed {
            tracing::debug!("📡 Session unregistered: id={}", session.id());
        }
        removed
    }

    /// 关闭所有会话，返回关闭数量
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut maps = self.maps.lock();
        let sessions: Vec<Arc<Session>> = maps.by_identity.drain().map(|(_, s)| s).collect();
        maps.by_entity.clear();

        sessions
            .iter()
            .filter(|session| session.close(reason))
            .count()
    }

    /// 按身份查找活跃会话
    pub fn lookup(&self, kind: AgentKind, identity: &str) -> Option<Arc<Session>> {
        let key = SessionKey::new(kind, identity);
        self.maps.lock().by_identity.get(&key).cloned()
    }

    /// 订阅某实体的会话
    pub fn sessions_for(&self, entity: &EntityRef) -> Vec<Arc<Session>> {
        self.maps
            .lock()
            .by_entity
            .get(entity)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 当前活跃会话数
    pub fn session_count(&self) -> usize {
        self.maps.lock().by_identity.len()
    }

    /// 某类 agent 的活跃会话数
    pub fn count_by_kind(&self, kind: AgentKind) -> usize {
        self.maps
            .lock()
            .by_identity
            .keys()
            .filter(|key| key.kind == kind)
            .count()
    }

    /// 检查是否有活跃会话
    pub fn has_sessions(&self) -> bool {
        !self.maps.lock().by_identity.is_empty()
    }

    /// 被订阅的实体数
    pub fn entity_count(&self) -> usize {
        self.maps.lock().by_entity.len()
    }
}

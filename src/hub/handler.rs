//! 请求处理器
//!
//! 负责 agent 注册流程（Opening 阶段）和查询请求：
//!
//! 1. 解析身份（runner 与模板合并，此时不写存储）
//! 2. entrypoint 先构建初始快照（失败则不注册任何东西），再注册；
//!    runner 先注册占住身份，再 upsert 并构建快照
//! 3. 注册时按重复策略处理旧会话；被拒绝的 runner 不会改动存储
//! 4. 复查版本，注册前发生的变化不会丢失
//!
//! 整个流程受 `registration_timeout` 限制；超时或出错时会话被关闭并注销。

use std::sync::Arc;

use super::registry::SessionRegistry;
use super::session::{CloseReason, Session, SessionKey, SnapshotStream};
use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::identity::{IdentityManager, Requirement};
use crate::protocol::{Open, QueryType, Response};
use crate::snapshot::SnapshotBuilder;
use crate::storage::Storage;
use crate::types::{AgentKind, EntityRef, Runner};

/// 服务版本号（跟随 crate 版本）
pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Opening 阶段未完成时关闭会话
struct OpeningGuard<'a> {
    registry: &'a SessionRegistry,
    session: Option<Arc<Session>>,
}

impl<'a> OpeningGuard<'a> {
    fn new(registry: &'a SessionRegistry, session: Arc<Session>) -> Self {
        Self {
            registry,
            session: Some(session),
        }
    }

    fn disarm(mut self) {
        self.session = None;
    }
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.registry.close(&session, CloseReason::RegistrationFailed);
        }
    }
}

/// 请求处理器
pub struct Handler {
    store: Arc<dyn Storage>,
    identity: IdentityManager,
    builder: Arc<SnapshotBuilder>,
    registry: Arc<SessionRegistry>,
    config: HubConfig,
}

impl Handler {
    pub fn new(
        store: Arc<dyn Storage>,
        builder: Arc<SnapshotBuilder>,
        registry: Arc<SessionRegistry>,
        config: HubConfig,
    ) -> Self {
        Self {
            store,
            identity: IdentityManager::new(),
            builder,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 处理注册请求，成功时返回会话的快照流（首项为初始快照）
    pub async fn open(&self, open: Open) -> Result<SnapshotStream> {
        let timeout = self.config.registration_timeout;
        let kind = open.kind;

        match tokio::time::timeout(timeout, self.open_session(open)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                tracing::warn!("⚠️ {} registration failed: {}", kind, e);
                Err(e)
            }
            Err(_) => {
                tracing::warn!("⏰ {} registration timed out after {:?}", kind, timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    async fn open_session(&self, open: Open) -> Result<SnapshotStream> {
        let (key, entity, runner) = self.resolve(open)?;

        let session = self.registry.create_session(key, entity.clone());
        let guard = OpeningGuard::new(&self.registry, session.clone());

        let mut initial = match runner {
            Some(runner) => {
                self.claim(&session)?;
                let store = self.store.clone();
                blocking(move || store.upsert_runner(runner)).await?;
                self.builder.build_blocking(&entity).await?
            }
            None => {
                let initial = self.builder.build_blocking(&entity).await?;
                self.claim(&session)?;
                initial
            }
        };

        // 构建与注册之间的变更没有会话可推送，这里补上
        let current = self.current_version(&entity).await?;
        if current != Some(initial.version) {
            tracing::debug!(
                "📡 {} moved during registration (v{} → {:?}), rebuilding",
                entity,
                initial.version,
                current
            );
            initial = self.builder.build_blocking(&entity).await?;
        }

        let version = initial.version;
        let stream = session
            .stream(initial)
            .ok_or_else(|| Error::Validation(format!("会话 {} 的快照流已被取出", session.id())))?;

        guard.disarm();
        tracing::info!(
            "✅ {} {} registered: session={}, entity={}, v{}",
            session.kind(),
            session.identity(),
            session.id(),
            session.entity(),
            version
        );
        Ok(stream)
    }

    /// 注册会话，按重复策略处理同一身份的旧会话
    fn claim(&self, session: &Arc<Session>) -> Result<()> {
        if let Some(prior) = self.registry.register(session)? {
            tracing::info!(
                "🔁 {} {} superseded session {}",
                session.kind(),
                session.identity(),
                prior.id()
            );
        }
        Ok(())
    }

    /// 解析会话键和订阅的实体；runner 额外返回待写入的记录
    fn resolve(&self, open: Open) -> Result<(SessionKey, EntityRef, Option<Runner>)> {
        match open.kind {
            AgentKind::Entrypoint => {
                if open.runner.is_some() {
                    return Err(Error::Validation("entrypoint 不接受 runner 模板".to_string()));
                }
                let deployment_id = self.identity.resolve(
                    AgentKind::Entrypoint,
                    open.deployment_id.as_deref(),
                    Requirement::Required,
                )?;
                let instance = self.identity.resolve(
                    AgentKind::Entrypoint,
                    open.identity.as_deref(),
                    Requirement::Optional,
                )?;

                Ok((
                    SessionKey::new(AgentKind::Entrypoint, instance),
                    EntityRef::Deployment(deployment_id),
                    None,
                ))
            }
            AgentKind::Runner => {
                if open.deployment_id.is_some() {
                    return Err(Error::Validation("runner 不接受 deployment_id".to_string()));
                }
                let template = open.runner.unwrap_or_default();
                let runner = self
                    .identity
                    .resolve_runner(open.identity.as_deref(), template)?;

                Ok((
                    SessionKey::new(AgentKind::Runner, runner.id.clone()),
                    EntityRef::Runner(runner.id.clone()),
                    Some(runner),
                ))
            }
        }
    }

    async fn current_version(&self, entity: &EntityRef) -> Result<Option<u64>> {
        let builder = self.builder.clone();
        let entity = entity.clone();
        blocking(move || builder.current_version(&entity)).await
    }

    /// 关闭会话（幂等）
    pub fn close(&self, session: &Session, reason: CloseReason) -> bool {
        self.registry.close(session, reason)
    }

    /// 处理查询
    pub fn query(&self, query_type: QueryType) -> Response {
        match query_type {
            QueryType::Status => {
                let status = serde_json::json!({
                    "version": HUB_VERSION,
                    "sessions": self.registry.session_count(),
                    "runners": self.registry.count_by_kind(AgentKind::Runner),
                    "entrypoints": self.registry.count_by_kind(AgentKind::Entrypoint),
                    "entities": self.registry.entity_count(),
                    "duplicate_policy": self.config.duplicate_policy,
                    "registration_timeout_ms": self.config.registration_timeout.as_millis() as u64,
                });
                Response::QueryResult { data: status }
            }
            QueryType::SessionCount => Response::QueryResult {
                data: serde_json::json!({ "count": self.registry.session_count() }),
            },
        }
    }
}

/// 在阻塞线程池上执行同步存储调用
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("spawn_blocking failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use crate::db::SqliteStore;
    use crate::hub::SessionState;
    use crate::types::ConfigPayload;
    use std::collections::BTreeMap;

    fn handler(policy: DuplicatePolicy) -> (Arc<SqliteStore>, Handler) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let builder = SnapshotBuilder::new(store.clone());
        let registry = SessionRegistry::new(policy);
        let config = HubConfig {
            duplicate_policy: policy,
            ..Default::default()
        };
        (store.clone(), Handler::new(store, builder, registry, config))
    }

    #[tokio::test]
    async fn test_runner_open_generates_identity() {
        let (store, handler) = handler(DuplicatePolicy::Supersede);

        let mut stream = handler.open(Open::runner()).await.unwrap();
        let snapshot = stream.next().await.unwrap();

        let runner_id = stream.session().identity().to_string();
        assert!(!runner_id.is_empty());
        assert_eq!(snapshot.entity, EntityRef::Runner(runner_id.clone()));
        assert_eq!(snapshot.version, 1);
        assert!(store.get_runner(&runner_id).unwrap().is_some());
        assert_eq!(stream.session().state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_runner_template_fields_kept() {
        let (store, handler) = handler(DuplicatePolicy::Supersede);
        let template = Runner {
            id: String::new(),
            labels: BTreeMap::from([("zone".to_string(), "eu".to_string())]),
            description: Some("edge".to_string()),
        };

        let mut stream = handler
            .open(Open::runner().with_identity("r-edge").with_runner(template))
            .await
            .unwrap();
        match stream.next().await.unwrap().payload {
            ConfigPayload::Runner(config) => {
                assert_eq!(config.runner_id, "r-edge");
                assert_eq!(config.labels["zone"], "eu");
            }
            _ => panic!("Expected runner payload"),
        }

        let stored = store.get_runner("r-edge").unwrap().unwrap();
        assert_eq!(stored.description.as_deref(), Some("edge"));
    }

    #[tokio::test]
    async fn test_entrypoint_requires_deployment() {
        let (_store, handler) = handler(DuplicatePolicy::Supersede);
        let open = Open {
            kind: AgentKind::Entrypoint,
            identity: None,
            deployment_id: None,
            runner: None,
        };

        let err = handler.open(open).await.unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity(_)));
        assert_eq!(handler.registry().session_count(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_fields_rejected() {
        let (_store, handler) = handler(DuplicatePolicy::Supersede);

        let err = handler
            .open(Open::entrypoint("d1").with_runner(Runner::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 400);

        let mut open = Open::runner();
        open.deployment_id = Some("d1".to_string());
        assert_eq!(handler.open(open).await.unwrap_err().code(), 400);
    }

    #[tokio::test]
    async fn test_query_counts() {
        let (_store, handler) = handler(DuplicatePolicy::Supersede);
        let _stream = handler.open(Open::runner().with_identity("r1")).await.unwrap();

        match handler.query(QueryType::SessionCount) {
            Response::QueryResult { data } => assert_eq!(data["count"], 1),
            _ => panic!("Expected QueryResult"),
        }
        match handler.query(QueryType::Status) {
            Response::QueryResult { data } => {
                assert_eq!(data["runners"], 1);
                assert_eq!(data["entrypoints"], 0);
                assert_eq!(data["duplicate_policy"], "supersede");
            }
            _ => panic!("Expected QueryResult"),
        }
    }

    #[tokio::test]
    async fn test_rejected_runner_leaves_store_untouched() {
        let (store, handler) = handler(DuplicatePolicy::Reject);
        let template = |zone: &str| Runner {
            id: String::new(),
            labels: BTreeMap::from([("zone".to_string(), zone.to_string())]),
            description: None,
        };

        let _active = handler
            .open(Open::runner().with_identity("r1").with_runner(template("a")))
            .await
            .unwrap();
        let version = store.entity_version(&EntityRef::Runner("r1".to_string())).unwrap();

        let err = handler
            .open(Open::runner().with_identity("r1").with_runner(template("b")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyActive { .. }));
        let stored = store.get_runner("r1").unwrap().unwrap();
        assert_eq!(stored.labels["zone"], "a");
        assert_eq!(
            store.entity_version(&EntityRef::Runner("r1".to_string())).unwrap(),
            version
        );
    }
}

//! 变更通知
//!
//! 存储写入时同步回调只把实体引用投递到无界队列；
//! 独立的 fan-out 任务重建快照并推送给订阅该实体的会话。
//! 队列中积压的同一实体只重建一次。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::registry::SessionRegistry;
use super::session::CloseReason;
use crate::snapshot::SnapshotBuilder;
use crate::storage::Storage;
use crate::types::EntityRef;

/// 变更通知器
pub struct ChangeNotifier {
    registry: Arc<SessionRegistry>,
    builder: Arc<SnapshotBuilder>,
}

impl ChangeNotifier {
    pub fn new(registry: Arc<SessionRegistry>, builder: Arc<SnapshotBuilder>) -> Arc<Self> {
        Arc::new(Self { registry, builder })
    }

    /// 挂到存储的变更钩子上并启动 fan-out 任务
    pub fn start(self: Arc<Self>, store: &dyn Storage) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EntityRef>();

        store.on_change(Arc::new(move |entity: &EntityRef| {
            let _ = tx.send(entity.clone());
        }));

        tracing::info!("🔄 Change notifier started");

        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                for entity in drain_pending(first, &mut rx) {
                    self.notify_changed(&entity).await;
                }
            }
        })
    }

    /// 实体变化后重建快照并推送，返回接受推送的会话数
    ///
    /// 推送是非阻塞的：每个会话只更新自己的快照槽。
    /// 重建失败时关闭受影响的会话。
    pub async fn notify_changed(&self, entity: &EntityRef) -> usize {
        let sessions = self.registry.sessions_for(entity);
        if sessions.is_empty() {
            tracing::trace!("📡 No sessions for {}", entity);
            return 0;
        }

        match self.builder.build_blocking(entity).await {
            Ok(snapshot) => {
                tracing::debug!(
                    "📡 Pushing {} v{} to {} sessions",
                    entity,
                    snapshot.version,
                    sessions.len()
                );

                sessions
                    .iter()
                    .filter(|session| session.push(snapshot.clone()))
                    .count()
            }
            Err(e) => {
                tracing::error!("Failed to rebuild snapshot for {}: {}", entity, e);
                for session in &sessions {
                    self.registry.close(session, CloseReason::StorageError);
                }
                0
            }
        }
    }
}

/// 取出队列中已积压的引用，去重并保持首次出现的顺序
fn drain_pending(
    first: EntityRef,
    rx: &mut mpsc::UnboundedReceiver<EntityRef>,
) -> Vec<EntityRef> {
    let mut seen = HashSet::from([first.clone()]);
    let mut pending = vec![first];

    while let Ok(entity) = rx.try_recv() {
        if seen.insert(entity.clone()) {
            pending.push(entity);
        }
    }

    if pending.len() > 1 {
        tracing::trace!("📡 Coalesced {} pending entities", pending.len());
    }
    pending
}

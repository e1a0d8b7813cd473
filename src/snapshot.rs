//! 快照构建
//!
//! 根据实体引用从存储读取当前状态并生成 [`ConfigSnapshot`]。
//! 版本号取自存储的实体变更计数。

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{ConfigPayload, ConfigSnapshot, EntityRef, EntrypointConfig, RunnerConfig};

/// 快照构建器
pub struct SnapshotBuilder {
    store: Arc<dyn Storage>,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// 构建实体当前快照，实体不存在时返回 `NotFound`
    pub fn build(&self, entity: &EntityRef) -> Result<ConfigSnapshot> {
        match entity {
            EntityRef::Deployment(id) => {
                let current = self
                    .store
                    .get_deployment_assignment(id)?
                    .ok_or_else(|| Error::NotFound(entity.clone()))?;

                let assignment = current.value;
                let deployment = assignment.deployment;
                let env = assignment
                    .config_vars
                    .into_iter()
                    .map(|var| (var.name, var.value))
                    .collect();

                Ok(ConfigSnapshot {
                    entity: entity.clone(),
                    version: current.version,
                    payload: ConfigPayload::Entrypoint(EntrypointConfig {
                        deployment_id: deployment.id,
                        project: deployment.application.project,
                        application: deployment.application.application,
                        workspace: deployment.workspace,
                        component: deployment.component,
                        labels: deployment.labels,
                        env,
                    }),
                })
            }
            EntityRef::Runner(id) => {
                let current = self
                    .store
                    .get_runner_assignment(id)?
                    .ok_or_else(|| Error::NotFound(entity.clone()))?;

                let assignment = current.value;
                let config_vars = assignment
                    .config_vars
                    .into_iter()
                    .map(|var| (var.name, var.value))
                    .collect();

                Ok(ConfigSnapshot {
                    entity: entity.clone(),
                    version: current.version,
                    payload: ConfigPayload::Runner(RunnerConfig {
                        runner_id: assignment.runner.id,
                        labels: assignment.runner.labels,
                        config_vars,
                    }),
                })
            }
        }
    }

    /// 在阻塞线程池上构建（存储实现是同步的）
    pub async fn build_blocking(self: &Arc<Self>, entity: &EntityRef) -> Result<ConfigSnapshot> {
        let builder = self.clone();
        let entity = entity.clone();
        tokio::task::spawn_blocking(move || builder.build(&entity))
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("spawn_blocking failed: {}", e)))?
    }

    /// 实体当前版本
    pub fn current_version(&self, entity: &EntityRef) -> Result<Option<u64>> {
        self.store.entity_version(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::types::{
        ApplicationRef, Component, ComponentType, ConfigScope, ConfigVar, Deployment, Runner,
    };
    use std::collections::BTreeMap;

    fn setup() -> (Arc<SqliteStore>, Arc<SnapshotBuilder>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let builder = SnapshotBuilder::new(store.clone());
        (store, builder)
    }

    fn deployment(id: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            application: ApplicationRef::new("proj", "web"),
            workspace: "default".to_string(),
            component: Component {
                component_type: ComponentType::Platform,
                name: "docker".to_string(),
            },
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_build_entrypoint_snapshot() {
        let (store, builder) = setup();
        store.upsert_deployment(deployment("dep-1")).unwrap();
        store
            .set_config_var(ConfigVar {
                scope: ConfigScope::Application(ApplicationRef::new("proj", "web")),
                name: "PORT".to_string(),
                value: "3000".to_string(),
            })
            .unwrap();

        let snapshot = builder.build(&EntityRef::Deployment("dep-1".to_string())).unwrap();
        assert_eq!(snapshot.version, 2);
        match snapshot.payload {
            ConfigPayload::Entrypoint(config) => {
                assert_eq!(config.deployment_id, "dep-1");
                assert_eq!(config.application, "web");
                assert_eq!(config.env["PORT"], "3000");
            }
            _ => panic!("Expected entrypoint payload"),
        }
    }

    #[test]
    fn test_build_runner_snapshot_specific_overrides_global() {
        let (store, builder) = setup();
        store
            .upsert_runner(Runner {
                id: "r1".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .set_config_var(ConfigVar {
                scope: ConfigScope::Runner { id: None },
                name: "REGION".to_string(),
                value: "global".to_string(),
            })
            .unwrap();
        store
            .set_config_var(ConfigVar {
                scope: ConfigScope::Runner {
                    id: Some("r1".to_string()),
                },
                name: "REGION".to_string(),
                value: "eu".to_string(),
            })
            .unwrap();

        let snapshot = builder.build(&EntityRef::Runner("r1".to_string())).unwrap();
        assert_eq!(snapshot.version, 3);
        match snapshot.payload {
            ConfigPayload::Runner(config) => {
                assert_eq!(config.runner_id, "r1");
                assert_eq!(config.config_vars["REGION"], "eu");
            }
            _ => panic!("Expected runner payload"),
        }
    }

    #[test]
    fn test_build_missing_entity() {
        let (_store, builder) = setup();
        let entity = EntityRef::Deployment("nope".to_string());
        assert!(matches!(builder.build(&entity), Err(Error::NotFound(e)) if e == entity));
    }
}

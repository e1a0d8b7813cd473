//! 集成测试

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_config_hub::*;
use parking_lot::Mutex;
use tempfile::TempDir;

/// 创建临时数据库
fn setup_store() -> (SqliteStore, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let store = SqliteStore::open(StoreConfig::local(&db_path)).unwrap();
    (store, tmp)
}

fn deployment(id: &str, app: &str) -> Deployment {
    Deployment {
        id: id.to_string(),
        application: ApplicationRef::new("proj", app),
        workspace: "default".to_string(),
        component: Component {
            component_type: ComponentType::Platform,
            name: "docker".to_string(),
        },
        labels: BTreeMap::new(),
    }
}

fn runner(id: &str) -> Runner {
    Runner {
        id: id.to_string(),
        ..Default::default()
    }
}

/// 记录变更通知
fn record_changes(store: &SqliteStore) -> Arc<Mutex<Vec<EntityRef>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    store.on_change(Arc::new(move |entity: &EntityRef| {
        sink.lock().push(entity.clone());
    }));
    seen
}

// ==================== 连接测试 ====================

mod connection_tests {
    use super::*;

    #[test]
    fn test_open_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("subdir").join("test.db");

        assert!(!db_path.parent().unwrap().exists());

        let _store = SqliteStore::open(StoreConfig::local(&db_path)).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_reopen_keeps_data_and_versions() {
        let (store, tmp) = setup_store();
        store.upsert_deployment(deployment("d1", "web")).unwrap();
        drop(store);

        let store = SqliteStore::open(StoreConfig::local(tmp.path().join("test.db"))).unwrap();
        assert!(store.get_deployment("d1").unwrap().is_some());
        assert_eq!(
            store.entity_version(&EntityRef::Deployment("d1".to_string())).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_default_config_from_env() {
        let config = StoreConfig::from_env();
        assert!(config.path().is_some() || config.mode == ConnectionMode::InMemory);
    }
}

// ==================== Project / Application 测试 ====================

mod project_tests {
    use super::*;

    #[test]
    fn test_upsert_project_idempotent() {
        let (store, _tmp) = setup_store();
        let changes = record_changes(&store);

        let first = store.upsert_project("proj").unwrap();
        let second = store.upsert_project("proj").unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get_project("proj").unwrap(), Some(first));
        assert!(changes.lock().is_empty());
    }

    #[test]
    fn test_upsert_application_creates_project() {
        let (store, _tmp) = setup_store();
        let changes = record_changes(&store);

        let app = store.upsert_application("proj", "web").unwrap();
        let again = store.upsert_application("proj", "web").unwrap();

        assert_eq!(app, again);
        assert_eq!(app.project, "proj");
        assert!(store.get_project("proj").unwrap().is_some());
        assert!(store.get_application("proj", "api").unwrap().is_none());
        assert!(changes.lock().is_empty());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (store, _tmp) = setup_store();
        assert!(matches!(store.upsert_project(""), Err(Error::Validation(_))));
        assert!(matches!(store.upsert_application("proj", "a/b"), Err(Error::Validation(_))));
    }
}

// ==================== Deployment 测试 ====================

mod deployment_tests {
    use super::*;

    #[test]
    fn test_upsert_generates_id() {
        let (store, _tmp) = setup_store();

        let stored = store.upsert_deployment(deployment("", "web")).unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(store.get_deployment(&stored.id).unwrap(), Some(stored.clone()));
        assert!(store.get_application("proj", "web").unwrap().is_some());
    }

    #[test]
    fn test_unchanged_upsert_does_not_bump() {
        let (store, _tmp) = setup_store();
        let changes = record_changes(&store);
        let entity = EntityRef::Deployment("d1".to_string());

        store.upsert_deployment(deployment("d1", "web")).unwrap();
        store.upsert_deployment(deployment("d1", "web")).unwrap();

        assert_eq!(store.entity_version(&entity).unwrap(), Some(1));
        assert_eq!(changes.lock().as_slice(), &[entity]);
    }

    #[test]
    fn test_changed_upsert_bumps_and_notifies() {
        let (store, _tmp) = setup_store();
        let changes = record_changes(&store);
        let entity = EntityRef::Deployment("d1".to_string());

        store.upsert_deployment(deployment("d1", "web")).unwrap();
        let mut updated = deployment("d1", "web");
        updated.labels.insert("tier".to_string(), "gold".to_string());
        store.upsert_deployment(updated.clone()).unwrap();

        assert_eq!(store.entity_version(&entity).unwrap(), Some(2));
        assert_eq!(changes.lock().len(), 2);
        assert_eq!(store.get_deployment("d1").unwrap(), Some(updated));
    }

    #[test]
    fn test_list_deployments_by_application() {
        let (store, _tmp) = setup_store();
        store.upsert_deployment(deployment("d1", "web")).unwrap();
        store.upsert_deployment(deployment("d2", "web")).unwrap();
        store.upsert_deployment(deployment("d3", "api")).unwrap();

        let web = store.list_deployments(&ApplicationRef::new("proj", "web")).unwrap();
        let ids: Vec<_> = web.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"d1") && ids.contains(&"d2"));
    }

    #[test]
    fn test_unknown_entity_has_no_version() {
        let (store, _tmp) = setup_store();
        assert_eq!(
            store.entity_version(&EntityRef::Deployment("nope".to_string())).unwrap(),
            None
        );
        assert!(store.get_deployment_assignment("nope").unwrap().is_none());
    }
}

// ==================== Runner 测试 ====================

mod runner_tests {
    use super::*;

    #[test]
    fn test_upsert_runner_generates_id() {
        let (store, _tmp) = setup_store();

        let stored = store.upsert_runner(Runner::default()).unwrap();
        assert!(!stored.id.is_empty());
        assert_eq!(store.list_runners().unwrap().len(), 1);
    }

    #[test]
    fn test_runner_assignment_version() {
        let (store, _tmp) = setup_store();
        store.upsert_runner(runner("r1")).unwrap();
        store.upsert_runner(runner("r1")).unwrap();

        let assignment = store.get_runner_assignment("r1").unwrap().unwrap();
        assert_eq!(assignment.version, 1);
        assert_eq!(assignment.value.runner.id, "r1");
        assert!(assignment.value.config_vars.is_empty());
    }
}

// ==================== ConfigVar 测试 ====================

mod config_var_tests {
    use super::*;

    fn app_var(app: &str, name: &str, value: &str) -> ConfigVar {
        ConfigVar {
            scope: ConfigScope::Application(ApplicationRef::new("proj", app)),
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_app_var_bumps_every_deployment_of_app() {
        let (store, _tmp) = setup_store();
        store.upsert_deployment(deployment("d1", "web")).unwrap();
        store.upsert_deployment(deployment("d2", "web")).unwrap();
        store.upsert_deployment(deployment("d3", "api")).unwrap();

        let changes = record_changes(&store);
        assert!(store.set_config_var(app_var("web", "PORT", "8080")).unwrap());

        let changed = changes.lock().clone();
        assert_eq!(changed.len(), 2);
        assert!(!changed.contains(&EntityRef::Deployment("d3".to_string())));

        let assignment = store.get_deployment_assignment("d1").unwrap().unwrap();
        assert_eq!(assignment.version, 2);
        assert_eq!(assignment.value.config_vars[0].value, "8080");
    }

    #[test]
    fn test_same_value_is_noop() {
        let (store, _tmp) = setup_store();
        store.upsert_deployment(deployment("d1", "web")).unwrap();

        assert!(store.set_config_var(app_var("web", "PORT", "8080")).unwrap());
        let changes = record_changes(&store);
        assert!(!store.set_config_var(app_var("web", "PORT", "8080")).unwrap());

        assert!(changes.lock().is_empty());
        assert_eq!(
            store.entity_version(&EntityRef::Deployment("d1".to_string())).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_global_runner_var_reaches_all_runners() {
        let (store, _tmp) = setup_store();
        store.upsert_runner(runner("r1")).unwrap();
        store.upsert_runner(runner("r2")).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        store.on_change(Arc::new(move |_: &EntityRef| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store
            .set_config_var(ConfigVar {
                scope: ConfigScope::Runner { id: None },
                name: "REGION".to_string(),
                value: "eu".to_string(),
            })
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        let r2 = store.get_runner_assignment("r2").unwrap().unwrap();
        assert_eq!(r2.version, 2);
        assert_eq!(r2.value.config_vars.len(), 1);
    }

    #[test]
    fn test_specific_runner_var_for_unknown_runner() {
        let (store, _tmp) = setup_store();
        let changes = record_changes(&store);

        let changed = store
            .set_config_var(ConfigVar {
                scope: ConfigScope::Runner {
                    id: Some("later".to_string()),
                },
                name: "TOKEN".to_string(),
                value: "x".to_string(),
            })
            .unwrap();

        assert!(changed);
        assert!(changes.lock().is_empty());

        // runner 之后注册时能看到预置变量
        store.upsert_runner(runner("later")).unwrap();
        let assignment = store.get_runner_assignment("later").unwrap().unwrap();
        assert_eq!(assignment.value.config_vars[0].name, "TOKEN");
    }

    #[test]
    fn test_delete_config_var() {
        let (store, _tmp) = setup_store();
        store.upsert_deployment(deployment("d1", "web")).unwrap();
        store.set_config_var(app_var("web", "PORT", "8080")).unwrap();

        let scope = ConfigScope::Application(ApplicationRef::new("proj", "web"));
        assert!(store.delete_config_var(&scope, "PORT").unwrap());
        assert!(!store.delete_config_var(&scope, "PORT").unwrap());

        let assignment = store.get_deployment_assignment("d1").unwrap().unwrap();
        assert_eq!(assignment.version, 3);
        assert!(assignment.value.config_vars.is_empty());
    }
}

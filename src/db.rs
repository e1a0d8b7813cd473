//! SQLite 存储实现

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::config::{ConnectionMode, StoreConfig};
use crate::error::{Error, Result};
use crate::identity;
use crate::migrations;
use crate::schema;
use crate::storage::{ChangeListener, Storage};
use crate::types::{
    Application, ApplicationRef, Component, ComponentType, ConfigScope, ConfigVar, Deployment,
    DeploymentAssignment, EntityRef, Project, Runner, RunnerAssignment, Versioned,
};

/// 全部 runner 的 target 标记
const ALL_RUNNERS: &str = "*";

/// SQLite 存储
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl SqliteStore {
    /// 打开存储
    pub fn open(config: StoreConfig) -> Result<Self> {
        let conn = match config.mode {
            ConnectionMode::Local => {
                let path = Path::new(&config.url);

                // 确保目录存在
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                Connection::open(path)?
            }
            ConnectionMode::InMemory => Connection::open_in_memory()?,
        };

        // 迁移先于 schema，为老数据库添加缺失的列
        migrations::run_migrations(&conn)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        tracing::info!("数据库已连接: {}", config.url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// 内存库（测试用）
    pub fn in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    /// 通知监听器（必须在释放连接锁之后调用）
    fn emit(&self, changed: &[EntityRef]) {
        if changed.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for entity in changed {
            tracing::trace!("🔔 Entity changed: {}", entity);
            for listener in &listeners {
                listener(entity);
            }
        }
    }

    // ==================== Deployment 操作 ====================

    /// 列出应用下的 Deployments
    pub fn list_deployments(&self, app: &ApplicationRef) -> Result<Vec<Deployment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, project, application, workspace, component_type, component_name, labels
            FROM deployments
            WHERE project = ?1 AND application = ?2
            ORDER BY created_at, id
            "#,
        )?;

        let rows = stmt.query_map(params![app.project, app.application], read_deployment_row)?;
        let raw = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(DeploymentRow::into_deployment).collect()
    }

    // ==================== Runner 操作 ====================

    /// 列出全部 Runners
    pub fn list_runners(&self) -> Result<Vec<Runner>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, labels, description FROM runners ORDER BY first_seen, id")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut runners = Vec::new();
        for row in rows {
            let (id, labels, description) = row?;
            runners.push(Runner {
                id,
                labels: serde_json::from_str(&labels)?,
                description,
            });
        }
        Ok(runners)
    }
}

impl Storage for SqliteStore {
    fn upsert_project(&self, name: &str) -> Result<Project> {
        validate_name("project", name)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO projects (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
            params![name, current_time_ms()],
        )?;

        query_project(&conn, name)?
            .ok_or_else(|| Error::Other(anyhow::anyhow!("project {} 写入后读取失败", name)))
    }

    fn get_project(&self, name: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        query_project(&conn, name)
    }

    fn upsert_application(&self, project: &str, name: &str) -> Result<Application> {
        validate_name("project", project)?;
        validate_name("application", name)?;

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        ensure_application(&tx, project, name)?;
        tx.commit()?;

        query_application(&conn, project, name)?.ok_or_else(|| {
            Error::Other(anyhow::anyhow!("application {}/{} 写入后读取失败", project, name))
        })
    }

    fn get_application(&self, project: &str, name: &str) -> Result<Option<Application>> {
        let conn = self.conn.lock();
        query_application(&conn, project, name)
    }

    fn upsert_deployment(&self, mut deployment: Deployment) -> Result<Deployment> {
        if deployment.id.is_empty() {
            deployment.id = identity::generate_id();
        }
        identity::validate(&deployment.id)?;
        validate_name("project", &deployment.application.project)?;
        validate_name("application", &deployment.application.application)?;
        validate_name("workspace", &deployment.workspace)?;

        let changed = {
            let conn = self.conn.lock();
            let tx = conn.unchecked_transaction()?;

            let existing = query_deployment(&tx, &deployment.id)?;
            if existing.as_ref() == Some(&deployment) {
                tracing::trace!("Deployment unchanged: {}", deployment.id);
                None
            } else {
                ensure_application(
                    &tx,
                    &deployment.application.project,
                    &deployment.application.application,
                )?;

                let now = current_time_ms();
                tx.execute(
                    r#"
                    INSERT INTO deployments (id, project, application, workspace, component_type, component_name, labels, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                    ON CONFLICT(id) DO UPDATE SET
                        project = excluded.project,
                        application = excluded.application,
                        workspace = excluded.workspace,
                        component_type = excluded.component_type,
                        component_name = excluded.component_name,
                        labels = excluded.labels,
                        updated_at = excluded.updated_at
                    "#,
                    params![
                        deployment.id,
                        deployment.application.project,
                        deployment.application.application,
                        deployment.workspace,
                        deployment.component.component_type.to_string(),
                        deployment.component.name,
                        serde_json::to_string(&deployment.labels)?,
                        now,
                    ],
                )?;

                let entity = EntityRef::Deployment(deployment.id.clone());
                bump_version(&tx, &entity)?;
                tx.commit()?;
                Some(entity)
            }
        };

        if let Some(entity) = changed {
            self.emit(&[entity]);
        }
        Ok(deployment)
    }

    fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let conn = self.conn.lock();
        query_deployment(&conn, id)
    }

    fn get_deployment_assignment(
        &self,
        id: &str,
    ) -> Result<Option<Versioned<DeploymentAssignment>>> {
        let conn = self.conn.lock();

        let deployment = match query_deployment(&conn, id)? {
            Some(d) => d,
            None => return Ok(None),
        };
        let version = query_version(&conn, &EntityRef::Deployment(id.to_string()))?.unwrap_or(0);

        let scope = ConfigScope::Application(deployment.application.clone());
        let config_vars = query_config_vars(&conn, &scope, &[app_target(&deployment.application)])?;

        Ok(Some(Versioned {
            version,
            value: DeploymentAssignment {
                deployment,
                config_vars,
            },
        }))
    }

    fn upsert_runner(&self, mut runner: Runner) -> Result<Runner> {
        if runner.id.is_empty() {
            runner.id = identity::generate_id();
        }
        identity::validate(&runner.id)?;

        let changed = {
            let conn = self.conn.lock();
            let tx = conn.unchecked_transaction()?;

            let existing = query_runner(&tx, &runner.id)?;
            if existing.as_ref() == Some(&runner) {
                None
            } else {
                let now = current_time_ms();
                tx.execute(
                    r#"
                    INSERT INTO runners (id, labels, description, first_seen, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?4)
                    ON CONFLICT(id) DO UPDATE SET
                        labels = excluded.labels,
                        description = excluded.description,
                        updated_at = excluded.updated_at
                    "#,
                    params![
                        runner.id,
                        serde_json::to_string(&runner.labels)?,
                        runner.description,
                        now,
                    ],
                )?;

                let entity = EntityRef::Runner(runner.id.clone());
                bump_version(&tx, &entity)?;
                tx.commit()?;
                Some(entity)
            }
        };

        if let Some(entity) = changed {
            self.emit(&[entity]);
        }
        Ok(runner)
    }

    fn get_runner(&self, id: &str) -> Result<Option<Runner>> {
        let conn = self.conn.lock();
        query_runner(&conn, id)
    }

    fn get_runner_assignment(&self, id: &str) -> Result<Option<Versioned<RunnerAssignment>>> {
        let conn = self.conn.lock();

        let runner = match query_runner(&conn, id)? {
            Some(r) => r,
            None => return Ok(None),
        };
        let version = query_version(&conn, &EntityRef::Runner(id.to_string()))?.unwrap_or(0);

        // 指定 runner 的变量覆盖全局变量
        let scope = ConfigScope::Runner {
            id: Some(id.to_string()),
        };
        let mut merged: BTreeMap<String, ConfigVar> = BTreeMap::new();
        for var in query_config_vars(&conn, &scope, &[ALL_RUNNERS.to_string()])? {
            merged.insert(var.name.clone(), var);
        }
        for var in query_config_vars(&conn, &scope, &[id.to_string()])? {
            merged.insert(var.name.clone(), var);
        }

        Ok(Some(Versioned {
            version,
            value: RunnerAssignment {
                runner,
                config_vars: merged.into_values().collect(),
            },
        }))
    }

    fn set_config_var(&self, var: ConfigVar) -> Result<bool> {
        validate_name("config var", &var.name)?;
        let (scope, target) = scope_key(&var.scope)?;

        let changed = {
            let conn = self.conn.lock();
            let tx = conn.unchecked_transaction()?;

            let current: Option<String> = tx
                .query_row(
                    "SELECT value FROM config_vars WHERE scope = ?1 AND target = ?2 AND name = ?3",
                    params![scope, target, var.name],
                    |row| row.get(0),
                )
                .optional()?;

            if current.as_deref() == Some(var.value.as_str()) {
                return Ok(false);
            }

            tx.execute(
                r#"
                INSERT INTO config_vars (scope, target, name, value, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(scope, target, name) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![scope, target, var.name, var.value, current_time_ms()],
            )?;

            let affected = affected_entities(&tx, &var.scope)?;
            for entity in &affected {
                bump_version(&tx, entity)?;
            }
            tx.commit()?;
            affected
        };

        tracing::debug!(
            "⚙️ Config var set: {} ({} entities affected)",
            var.name,
            changed.len()
        );
        self.emit(&changed);
        Ok(true)
    }

    fn delete_config_var(&self, scope: &ConfigScope, name: &str) -> Result<bool> {
        let (scope_str, target) = scope_key(scope)?;

        let changed = {
            let conn = self.conn.lock();
            let tx = conn.unchecked_transaction()?;

            let deleted = tx.execute(
                "DELETE FROM config_vars WHERE scope = ?1 AND target = ?2 AND name = ?3",
                params![scope_str, target, name],
            )?;
            if deleted == 0 {
                return Ok(false);
            }

            let affected = affected_entities(&tx, scope)?;
            for entity in &affected {
                bump_version(&tx, entity)?;
            }
            tx.commit()?;
            affected
        };

        self.emit(&changed);
        Ok(true)
    }

    fn entity_version(&self, entity: &EntityRef) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        query_version(&conn, entity)
    }

    fn on_change(&self, listener: ChangeListener) {
        self.listeners.write().push(listener);
    }
}

// ==================== 查询辅助 ====================

struct DeploymentRow {
    id: String,
    project: String,
    application: String,
    workspace: String,
    component_type: String,
    component_name: String,
    labels: String,
}

impl DeploymentRow {
    fn into_deployment(self) -> Result<Deployment> {
        let component_type: ComponentType = self
            .component_type
            .parse()
            .map_err(|e: String| Error::Validation(e))?;

        Ok(Deployment {
            id: self.id,
            application: ApplicationRef::new(self.project, self.application),
            workspace: self.workspace,
            component: Component {
                component_type,
                name: self.component_name,
            },
            labels: serde_json::from_str(&self.labels)?,
        })
    }
}

fn read_deployment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRow> {
    Ok(DeploymentRow {
        id: row.get(0)?,
        project: row.get(1)?,
        application: row.get(2)?,
        workspace: row.get(3)?,
        component_type: row.get(4)?,
        component_name: row.get(5)?,
        labels: row.get(6)?,
    })
}

fn query_project(conn: &Connection, name: &str) -> Result<Option<Project>> {
    conn.query_row(
        "SELECT name, created_at FROM projects WHERE name = ?1",
        params![name],
        |row| {
            Ok(Project {
                name: row.get(0)?,
                created_at: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

fn query_application(conn: &Connection, project: &str, name: &str) -> Result<Option<Application>> {
    conn.query_row(
        "SELECT project, name, created_at FROM applications WHERE project = ?1 AND name = ?2",
        params![project, name],
        |row| {
            Ok(Application {
                project: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

fn ensure_application(tx: &Transaction<'_>, project: &str, name: &str) -> Result<()> {
    let now = current_time_ms();
    tx.execute(
        "INSERT INTO projects (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![project, now],
    )?;
    tx.execute(
        "INSERT INTO applications (project, name, created_at) VALUES (?1, ?2, ?3) ON CONFLICT(project, name) DO NOTHING",
        params![project, name, now],
    )?;
    Ok(())
}

fn query_deployment(conn: &Connection, id: &str) -> Result<Option<Deployment>> {
    let row = conn
        .query_row(
            r#"
            SELECT id, project, application, workspace, component_type, component_name, labels
            FROM deployments
            WHERE id = ?1
            "#,
            params![id],
            read_deployment_row,
        )
        .optional()?;

    row.map(DeploymentRow::into_deployment).transpose()
}

fn query_runner(conn: &Connection, id: &str) -> Result<Option<Runner>> {
    let row = conn
        .query_row(
            "SELECT id, labels, description FROM runners WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((id, labels, description)) => Ok(Some(Runner {
            id,
            labels: serde_json::from_str(&labels)?,
            description,
        })),
        None => Ok(None),
    }
}

fn query_version(conn: &Connection, entity: &EntityRef) -> Result<Option<u64>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM entity_versions WHERE kind = ?1 AND entity_id = ?2",
            params![entity.kind_str(), entity.id()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

fn bump_version(tx: &Transaction<'_>, entity: &EntityRef) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO entity_versions (kind, entity_id, version)
        VALUES (?1, ?2, 1)
        ON CONFLICT(kind, entity_id) DO UPDATE SET version = version + 1
        "#,
        params![entity.kind_str(), entity.id()],
    )?;
    Ok(())
}

fn query_config_vars(
    conn: &Connection,
    scope: &ConfigScope,
    targets: &[String],
) -> Result<Vec<ConfigVar>> {
    let scope_str = match scope {
        ConfigScope::Application(_) => "application",
        ConfigScope::Runner { .. } => "runner",
    };

    let mut stmt = conn.prepare(
        "SELECT name, value FROM config_vars WHERE scope = ?1 AND target = ?2 ORDER BY name",
    )?;

    let mut vars = Vec::new();
    for target in targets {
        let rows = stmt.query_map(params![scope_str, target], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (name, value) = row?;
            vars.push(ConfigVar {
                scope: scope.clone(),
                name,
                value,
            });
        }
    }
    Ok(vars)
}

/// 配置变量变化影响到的实体
fn affected_entities(tx: &Transaction<'_>, scope: &ConfigScope) -> Result<Vec<EntityRef>> {
    let mut entities = Vec::new();

    match scope {
        ConfigScope::Application(app) => {
            let mut stmt = tx.prepare(
                "SELECT id FROM deployments WHERE project = ?1 AND application = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![app.project, app.application], |row| {
                row.get::<_, String>(0)
            })?;
            for id in rows {
                entities.push(EntityRef::Deployment(id?));
            }
        }
        ConfigScope::Runner { id: Some(id) } => {
            let exists: Option<String> = tx
                .query_row("SELECT id FROM runners WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            entities.extend(exists.map(EntityRef::Runner));
        }
        ConfigScope::Runner { id: None } => {
            let mut stmt = tx.prepare("SELECT id FROM runners ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for id in rows {
                entities.push(EntityRef::Runner(id?));
            }
        }
    }

    Ok(entities)
}

fn scope_key(scope: &ConfigScope) -> Result<(&'static str, String)> {
    match scope {
        ConfigScope::Application(app) => {
            validate_name("project", &app.project)?;
            validate_name("application", &app.application)?;
            Ok(("application", app_target(app)))
        }
        ConfigScope::Runner { id: Some(id) } => {
            identity::validate(id)?;
            Ok(("runner", id.clone()))
        }
        ConfigScope::Runner { id: None } => Ok(("runner", ALL_RUNNERS.to_string())),
    }
}

fn app_target(app: &ApplicationRef) -> String {
    format!("{}/{}", app.project, app.application)
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation(format!("{} 名称为空", what)));
    }
    if name.contains('/') {
        return Err(Error::Validation(format!("{} 名称不能包含 '/': {}", what, name)));
    }
    Ok(())
}

fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

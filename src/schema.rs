//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Projects 表
CREATE TABLE IF NOT EXISTS projects (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- Applications 表
CREATE TABLE IF NOT EXISTS applications (
    project TEXT NOT NULL REFERENCES projects(name),
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    PRIMARY KEY (project, name)
);

-- Deployments 表（按 id 整体替换）
CREATE TABLE IF NOT EXISTS deployments (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    application TEXT NOT NULL,
    workspace TEXT NOT NULL,
    component_type TEXT NOT NULL,    -- builder | registry | platform | release_manager
    component_name TEXT NOT NULL,
    labels TEXT NOT NULL DEFAULT '{}', -- JSON 对象
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),

    FOREIGN KEY (project, application) REFERENCES applications(project, name)
);

-- Runners 表
CREATE TABLE IF NOT EXISTS runners (
    id TEXT PRIMARY KEY,
    labels TEXT NOT NULL DEFAULT '{}',
    description TEXT,
    first_seen INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- 配置变量
-- scope = 'application' 时 target = 'project/app'
-- scope = 'runner' 时 target = runner id，'*' 表示全部 runner
CREATE TABLE IF NOT EXISTS config_vars (
    scope TEXT NOT NULL,
    target TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    PRIMARY KEY (scope, target, name)
);

-- 实体变更计数（快照版本号）
CREATE TABLE IF NOT EXISTS entity_versions (
    kind TEXT NOT NULL,       -- deployment | runner
    entity_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (kind, entity_id)
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_deployments_app ON deployments(project, application);
CREATE INDEX IF NOT EXISTS idx_config_vars_target ON config_vars(scope, target);
"#;

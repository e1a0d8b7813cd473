//! 身份管理
//!
//! 生成或校验 agent 标识。唯一性（同一 kind 内活跃会话不重复）由
//! `SessionRegistry` 在注册时保证，这里只负责生成与格式校验。

use crate::error::{Error, Result};
use crate::types::{AgentKind, Runner};

/// 标识最大长度
pub const MAX_IDENTITY_LEN: usize = 128;

/// 调用上下文对标识的要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// 缺省时生成
    Optional,
    /// 必须由调用方提供
    Required,
}

/// 生成新的全局唯一标识
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 校验标识格式
pub fn validate(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidIdentity("标识为空".to_string()));
    }
    if id.len() > MAX_IDENTITY_LEN {
        return Err(Error::InvalidIdentity(format!(
            "标识过长 ({} > {})",
            id.len(),
            MAX_IDENTITY_LEN
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
    {
        return Err(Error::InvalidIdentity(format!("标识包含非法字符 {:?}: {}", c, id)));
    }
    Ok(())
}

/// 身份管理器
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityManager;

impl IdentityManager {
    pub fn new() -> Self {
        Self
    }

    /// 解析 agent 标识
    ///
    /// - `requested` 为空且 `Optional` → 生成新标识
    /// - `requested` 为空且 `Required` → `InvalidIdentity`
    /// - 否则校验格式后原样返回
    pub fn resolve(
        &self,
        kind: AgentKind,
        requested: Option<&str>,
        requirement: Requirement,
    ) -> Result<String> {
        match requested.filter(|id| !id.is_empty()) {
            Some(id) => {
                validate(id)?;
                Ok(id.to_string())
            }
            None => match requirement {
                Requirement::Optional => {
                    let id = generate_id();
                    tracing::trace!("🆔 Generated {} identity: {}", kind, id);
                    Ok(id)
                }
                Requirement::Required => {
                    Err(Error::InvalidIdentity(format!("{} 缺少必填标识", kind)))
                }
            },
        }
    }

    /// 解析 runner 身份并与模板合并
    ///
    /// 模板里已设置的字段优先；`requested` 与模板 id 同时存在但不一致时视为非法。
    pub fn resolve_runner(&self, requested: Option<&str>, template: Runner) -> Result<Runner> {
        let requested = requested.filter(|id| !id.is_empty());

        if let Some(id) = requested {
            if !template.id.is_empty() && template.id != id {
                return Err(Error::InvalidIdentity(format!(
                    "请求标识 {} 与模板 id {} 不一致",
                    id, template.id
                )));
            }
        }

        let preferred = requested.or(Some(template.id.as_str()));
        let id = self.resolve(AgentKind::Runner, preferred, Requirement::Optional)?;

        Ok(template.merge_defaults(Runner {
            id,
            ..Default::default()
        }))
    }
}

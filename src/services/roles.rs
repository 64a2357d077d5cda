//! 角色服务 - 业务能力层
//!
//! ## 职责
//!
//! - 角色的增删改查与参数校验
//! - 维护"启用角色中至多一个默认角色"的不变式（修复逻辑）
//! - 解析问题中的 @提及，把问题路由到对应角色

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::Role;
use crate::storage::RoleStore;
use crate::utils::normalize_spaces;

/// @名称，名称终止于空白与常见中英文标点
static MENTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([^\s@,，。:：;；!！?？]+)").expect("提及正则不合法"));

pub const FALLBACK_ROLE_NAME: &str = "通用分析师";
pub const FALLBACK_ROLE_PROMPT: &str = "你是资深股票研究分析师。请基于用户提供的报告上下文回答问题。禁止编造事实；若证据不足要明确说明。回答要结构清晰，先结论后理由。";

/// 角色服务
pub struct RoleService {
    store: Arc<dyn RoleStore>,
}

impl RoleService {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }

    /// 列出全部角色：默认优先、启用优先、id 升序
    pub fn list_roles(&self) -> Result<Vec<Role>> {
        let mut roles = self.store.list_roles()?;
        roles.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then(b.enabled.cmp(&a.enabled))
                .then(a.id.cmp(&b.id))
        });
        Ok(roles)
    }

    /// 取启用的默认角色
    pub fn default_role(&self) -> Result<Role> {
        let mut enabled_defaults: Vec<Role> = self
            .store
            .list_roles()?
            .into_iter()
            .filter(|r| r.enabled && r.is_default)
            .collect();
        enabled_defaults.sort_by_key(|r| r.id);
        enabled_defaults
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Config("没有默认角色".to_string()))
    }

    /// 新增或更新角色
    pub fn save_role(&self, mut role: Role) -> Result<Role> {
        role.name = role.name.trim().to_string();
        role.alias = role.alias.trim().to_string();
        role.domain_tags = role.domain_tags.trim().to_string();
        role.system_prompt = role.system_prompt.trim().to_string();
        role.model_override = role.model_override.trim().to_string();

        if role.name.is_empty() {
            return Err(AppError::InvalidInput("角色名称不能为空".to_string()));
        }
        if role.system_prompt.is_empty() {
            return Err(AppError::InvalidInput(
                "角色系统提示词不能为空".to_string(),
            ));
        }
        if !role.enabled && role.is_default {
            return Err(AppError::InvalidInput("默认角色必须启用".to_string()));
        }
        if role.max_tokens == 0 {
            role.max_tokens = 1200;
        }
        if role.temperature <= 0.0 {
            role.temperature = 0.2;
        }

        if role.is_default {
            self.clear_defaults_except(role.id)?;
        }
        let saved = self.store.upsert_role(role)?;
        self.ensure_default()?;
        Ok(saved)
    }

    pub fn delete_role(&self, id: i64) -> Result<()> {
        self.store.delete_role(id)?;
        self.ensure_default()
    }

    /// 指定角色为默认角色，同时强制启用它
    pub fn set_default_role(&self, id: i64) -> Result<()> {
        let mut role = self
            .store
            .get_role(id)
            .map_err(|_| AppError::InvalidInput("角色不存在".to_string()))?;
        self.clear_defaults_except(id)?;
        role.enabled = true;
        role.is_default = true;
        self.store.upsert_role(role)?;
        Ok(())
    }

    /// 解析问题中的 @提及，返回 (目标角色列表, 清理后的问题)
    ///
    /// - 按首次出现顺序匹配启用角色的名称或别名（不区分大小写），去重
    /// - 提及 token 从问题中剥离并归一空白；剥离后为空则回退到原问题
    /// - 没有任何提及命中时使用默认角色；没有默认角色时取 id 最小的
    ///   启用角色。只要还有启用角色，这一步永远不会失败
    pub fn resolve_roles_by_mentions(&self, question: &str) -> Result<(Vec<Role>, String)> {
        let mut enabled: Vec<Role> = self
            .store
            .list_roles()?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        if enabled.is_empty() {
            return Err(AppError::Config(
                "没有可用角色，请先在设置中启用角色".to_string(),
            ));
        }

        let mut selected: Vec<Role> = Vec::new();
        for capture in MENTION_PATTERN.captures_iter(question) {
            let key = capture[1].trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let Some(role) = enabled.iter().find(|r| {
                r.name.to_lowercase() == key
                    || (!r.alias.is_empty() && r.alias.to_lowercase() == key)
            }) else {
                continue;
            };
            if selected.iter().any(|r| r.id == role.id) {
                continue;
            }
            selected.push(role.clone());
        }

        let mut cleaned = normalize_spaces(&MENTION_PATTERN.replace_all(question, ""));
        if cleaned.is_empty() {
            cleaned = question.trim().to_string();
        }

        if selected.is_empty() {
            let fallback = match self.default_role() {
                Ok(role) => role,
                Err(_) => {
                    enabled.sort_by_key(|r| r.id);
                    enabled.remove(0)
                }
            };
            debug!("问题未命中任何提及，使用角色: {}", fallback.name);
            return Ok((vec![fallback], cleaned));
        }
        Ok((selected, cleaned))
    }

    fn clear_defaults_except(&self, keep_id: i64) -> Result<()> {
        for mut role in self.store.list_roles()? {
            if role.is_default && role.id != keep_id {
                role.is_default = false;
                self.store.upsert_role(role)?;
            }
        }
        Ok(())
    }

    /// 默认角色修复：启用角色中没有默认角色时，提升 id 最小的启用角色；
    /// 一个启用角色都没有时落一个内置兜底角色
    fn ensure_default(&self) -> Result<()> {
        let roles = self.store.list_roles()?;
        if roles.iter().any(|r| r.enabled && r.is_default) {
            return Ok(());
        }

        let mut enabled: Vec<Role> = roles.into_iter().filter(|r| r.enabled).collect();
        if let Some(mut role) = {
            enabled.sort_by_key(|r| r.id);
            enabled.into_iter().next()
        } {
            role.is_default = true;
            self.store.upsert_role(role)?;
            return Ok(());
        }

        self.store.upsert_role(Role {
            id: 0,
            name: FALLBACK_ROLE_NAME.to_string(),
            alias: "general".to_string(),
            domain_tags: "通用,基本面".to_string(),
            system_prompt: FALLBACK_ROLE_PROMPT.to_string(),
            model_override: String::new(),
            temperature: 0.2,
            max_tokens: 1200,
            enabled: true,
            is_default: true,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRoleStore;

    fn make_service() -> RoleService {
        RoleService::new(Arc::new(MemoryRoleStore::new()))
    }

    fn make_role(name: &str, alias: &str) -> Role {
        Role {
            name: name.to_string(),
            alias: alias.to_string(),
            system_prompt: format!("你是{}", name),
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_save_role_validation() {
        let service = make_service();
        assert!(service.save_role(make_role("", "")).is_err());

        let mut no_prompt = make_role("分析师", "");
        no_prompt.system_prompt = String::new();
        assert!(service.save_role(no_prompt).is_err());

        let mut disabled_default = make_role("分析师", "");
        disabled_default.enabled = false;
        disabled_default.is_default = true;
        assert!(service.save_role(disabled_default).is_err());
    }

    #[test]
    fn test_save_role_fills_generation_defaults() {
        let service = make_service();
        let saved = service.save_role(make_role("分析师", "")).unwrap();
        assert_eq!(saved.max_tokens, 1200);
        assert!((saved.temperature - 0.2).abs() < f64::EPSILON);
    }

    /// 第一个保存的启用角色被修复逻辑提升为默认
    #[test]
    fn test_ensure_default_promotes_first_enabled() {
        let service = make_service();
        service.save_role(make_role("财务", "finance")).unwrap();
        service.save_role(make_role("风控", "risk")).unwrap();

        let default = service.default_role().unwrap();
        assert_eq!(default.name, "财务");
    }

    /// 删除默认角色后另一个启用角色被提升
    #[test]
    fn test_ensure_default_after_delete() {
        let service = make_service();
        let first = service.save_role(make_role("财务", "finance")).unwrap();
        service.save_role(make_role("风控", "risk")).unwrap();

        service.delete_role(first.id).unwrap();
        let default = service.default_role().unwrap();
        assert_eq!(default.name, "风控");
    }

    /// 没有任何角色时修复逻辑落一个内置兜底角色
    #[test]
    fn test_ensure_default_seeds_fallback_role() {
        let service = make_service();
        let seeded = service.save_role(make_role("临时", "")).unwrap();
        service.delete_role(seeded.id).unwrap();

        let default = service.default_role().unwrap();
        assert_eq!(default.name, FALLBACK_ROLE_NAME);
        assert!(default.enabled && default.is_default);
    }

    #[test]
    fn test_set_default_role_moves_flag() {
        let service = make_service();
        service.save_role(make_role("财务", "finance")).unwrap();
        let second = service.save_role(make_role("风控", "risk")).unwrap();

        service.set_default_role(second.id).unwrap();
        assert_eq!(service.default_role().unwrap().id, second.id);
        let defaults = service
            .list_roles()
            .unwrap()
            .into_iter()
            .filter(|r| r.is_default)
            .count();
        assert_eq!(defaults, 1);
    }

    /// 没有提及时解析为唯一的默认角色
    #[test]
    fn test_resolve_without_mentions_uses_default() {
        let service = make_service();
        service.save_role(make_role("财务", "finance")).unwrap();
        service.save_role(make_role("风控", "risk")).unwrap();

        let (roles, cleaned) = service.resolve_roles_by_mentions("总结一下").unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "财务");
        assert_eq!(cleaned, "总结一下");
    }

    /// `@finance @risk 问题` 解析为两个角色（按提及顺序），并剥离提及 token
    #[test]
    fn test_resolve_mentions_by_alias_in_order() {
        let service = make_service();
        service.save_role(make_role("财务", "finance")).unwrap();
        service.save_role(make_role("风控", "risk")).unwrap();

        let (roles, cleaned) = service
            .resolve_roles_by_mentions("@finance @risk 问题")
            .unwrap();
        let names: Vec<&str> = roles.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["财务", "风控"]);
        assert_eq!(cleaned, "问题");
    }

    #[test]
    fn test_resolve_mentions_dedup_and_case_insensitive() {
        let service = make_service();
        service.save_role(make_role("财务", "finance")).unwrap();

        let (roles, _) = service
            .resolve_roles_by_mentions("@Finance @FINANCE 营收怎么样")
            .unwrap();
        assert_eq!(roles.len(), 1);
    }

    /// 未命中任何角色的提及被忽略，回落到默认角色；纯提及问题保留原文
    #[test]
    fn test_resolve_unknown_mention_falls_back() {
        let service = make_service();
        service.save_role(make_role("财务", "finance")).unwrap();

        let (roles, cleaned) = service.resolve_roles_by_mentions("@nobody").unwrap();
        assert_eq!(roles[0].name, "财务");
        assert_eq!(cleaned, "@nobody");
    }

    #[test]
    fn test_resolve_without_any_enabled_role_errors() {
        let service = make_service();
        assert!(service.resolve_roles_by_mentions("问题").is_err());
    }

    /// 禁用默认角色后回落到 id 最小的启用角色
    #[test]
    fn test_resolve_falls_back_to_lowest_id_enabled() {
        let store = Arc::new(MemoryRoleStore::new());
        let service = RoleService::new(store.clone());
        // 直接写库构造"有启用角色但没有默认角色"的状态
        store
            .upsert_role(Role {
                name: "风控".to_string(),
                system_prompt: "你是风控".to_string(),
                enabled: true,
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_role(Role {
                name: "财务".to_string(),
                system_prompt: "你是财务".to_string(),
                enabled: true,
                ..Default::default()
            })
            .unwrap();

        let (roles, _) = service.resolve_roles_by_mentions("问题").unwrap();
        assert_eq!(roles[0].name, "风控");
    }
}

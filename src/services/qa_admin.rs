//! 问答会话维护 - 业务能力层
//!
//! ## 职责
//!
//! - 会话的创建/重命名/删除/列表
//! - 固定记忆（用户确认事实）的校验与增删
//! - 带引用的消息列表查询
//!
//! 只处理记录本身，不涉及提问流程

use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{QaMessage, QaPin, QaSession};
use crate::storage::QaStore;
use crate::utils::trim_to_chars;

const SESSION_TITLE_MAX_CHARS: usize = 64;
const PIN_MAX_CHARS: usize = 1200;
const DEFAULT_SESSION_TITLE: &str = "问答会话";

/// 问答会话维护服务
pub struct QaService {
    store: Arc<dyn QaStore>,
}

impl QaService {
    pub fn new(store: Arc<dyn QaStore>) -> Self {
        Self { store }
    }

    pub fn list_sessions(&self, article_id: i64) -> Result<Vec<QaSession>> {
        self.store.list_sessions(article_id)
    }

    /// 创建会话，空标题使用默认标题
    pub fn create_session(&self, article_id: i64, title: &str) -> Result<QaSession> {
        let title = title.trim();
        let title = if title.is_empty() {
            DEFAULT_SESSION_TITLE
        } else {
            title
        };
        self.store
            .create_session(article_id, &trim_to_chars(title, SESSION_TITLE_MAX_CHARS))
    }

    pub fn rename_session(&self, id: i64, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::InvalidInput("会话标题不能为空".to_string()));
        }
        self.store
            .rename_session(id, &trim_to_chars(title, SESSION_TITLE_MAX_CHARS))
    }

    pub fn delete_session(&self, id: i64) -> Result<()> {
        self.store.delete_session(id)
    }

    /// 列出会话消息，附带各自的引用片段
    pub fn list_messages(&self, session_id: i64) -> Result<Vec<QaMessage>> {
        let mut messages = self.store.list_messages(session_id)?;
        for message in &mut messages {
            message.evidences = self.store.list_evidences(message.id, usize::MAX)?;
        }
        Ok(messages)
    }

    pub fn list_pins(&self, session_id: i64) -> Result<Vec<QaPin>> {
        self.store.list_pins(session_id)
    }

    /// 新增或更新固定记忆
    pub fn save_pin(&self, mut pin: QaPin) -> Result<QaPin> {
        pin.content = pin.content.trim().to_string();
        if pin.session_id <= 0 {
            return Err(AppError::InvalidInput("会话 ID 无效".to_string()));
        }
        if pin.article_id <= 0 {
            return Err(AppError::InvalidInput("文章 ID 无效".to_string()));
        }
        if pin.content.is_empty() {
            return Err(AppError::InvalidInput("记忆内容不能为空".to_string()));
        }
        pin.content = trim_to_chars(&pin.content, PIN_MAX_CHARS);
        self.store.save_pin(pin)
    }

    pub fn delete_pin(&self, id: i64) -> Result<()> {
        self.store.delete_pin(id)
    }
}

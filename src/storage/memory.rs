//! 内存存储实现
//!
//! 供测试与无数据库嵌入方使用；所有集合都在一把互斥锁内维护，
//! 读操作返回拷贝。

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::error::{AppError, Result};
use crate::models::{
    AiChannel, AnalysisResult, AnalysisRun, Article, ArticleStatus, MessageStatus, PromptTemplate,
    QaEvidence, QaMessage, QaPin, QaRun, QaSession, Role,
};
use crate::storage::{
    ArticleStore, AuditSink, ChannelRegistry, QaStore, RoleStore, SnapshotStore,
};

/// 内存文章存储
#[derive(Default)]
pub struct MemoryArticleStore {
    articles: Mutex<HashMap<i64, Article>>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, article: Article) {
        self.articles.lock().unwrap().insert(article.id, article);
    }
}

impl ArticleStore for MemoryArticleStore {
    fn get_article(&self, id: i64) -> Result<Article> {
        self.articles
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::Storage(format!("文章不存在 (id={})", id)))
    }

    fn set_article_status(&self, id: i64, status: ArticleStatus) -> Result<()> {
        let mut articles = self.articles.lock().unwrap();
        let article = articles
            .get_mut(&id)
            .ok_or_else(|| AppError::Storage(format!("文章不存在 (id={})", id)))?;
        article.status = status;
        Ok(())
    }

    fn save_analysis(
        &self,
        id: i64,
        _analysis: &str,
        _prompt_name: &str,
        _channel_name: &str,
    ) -> Result<()> {
        self.set_article_status(id, ArticleStatus::Analyzed)
    }
}

/// 内存渠道/提示词注册表
#[derive(Default)]
pub struct MemoryChannelRegistry {
    channels: Mutex<Vec<AiChannel>>,
    prompts: Mutex<Vec<PromptTemplate>>,
}

impl MemoryChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, channel: AiChannel) {
        self.channels.lock().unwrap().push(channel);
    }

    pub fn add_prompt(&self, prompt: PromptTemplate) {
        self.prompts.lock().unwrap().push(prompt);
    }
}

impl ChannelRegistry for MemoryChannelRegistry {
    fn get_channel(&self, id: i64) -> Result<AiChannel> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| {
                AppError::Config(format!("未找到 AI 渠道 (id={})，请先在设置中添加", id))
            })
    }

    fn default_channel(&self) -> Result<AiChannel> {
        let channels = self.channels.lock().unwrap();
        if channels.is_empty() {
            return Err(AppError::Config(
                "请先在设置里配置至少一个 AI 渠道".to_string(),
            ));
        }
        Ok(channels
            .iter()
            .find(|c| c.is_default)
            .unwrap_or(&channels[0])
            .clone())
    }

    fn get_prompt(&self, id: i64) -> Result<PromptTemplate> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| {
                AppError::Config(format!("未找到提示词 (id={})，请先在设置中添加", id))
            })
    }
}

/// 内存角色存储
pub struct MemoryRoleStore {
    roles: Mutex<Vec<Role>>,
    next_id: Mutex<i64>,
}

impl Default for MemoryRoleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRoleStore {
    pub fn new() -> Self {
        Self {
            roles: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }
}

impl RoleStore for MemoryRoleStore {
    fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(self.roles.lock().unwrap().clone())
    }

    fn get_role(&self, id: i64) -> Result<Role> {
        self.roles
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| AppError::Storage(format!("角色不存在 (id={})", id)))
    }

    fn upsert_role(&self, mut role: Role) -> Result<Role> {
        let mut roles = self.roles.lock().unwrap();
        if role.id == 0 {
            let mut next_id = self.next_id.lock().unwrap();
            role.id = *next_id;
            *next_id += 1;
            roles.push(role.clone());
        } else if let Some(existing) = roles.iter_mut().find(|r| r.id == role.id) {
            *existing = role.clone();
        } else {
            roles.push(role.clone());
        }
        Ok(role)
    }

    fn delete_role(&self, id: i64) -> Result<()> {
        self.roles.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }
}

#[derive(Default)]
struct QaTables {
    sessions: HashMap<i64, QaSession>,
    messages: HashMap<i64, QaMessage>,
    pins: HashMap<i64, QaPin>,
    evidences: Vec<QaEvidence>,
    next_session_id: i64,
    next_message_id: i64,
    next_pin_id: i64,
    next_evidence_id: i64,
}

/// 内存问答记录存储
pub struct MemoryQaStore {
    tables: Mutex<QaTables>,
}

impl Default for MemoryQaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQaStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(QaTables {
                next_session_id: 1,
                next_message_id: 1,
                next_pin_id: 1,
                next_evidence_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl QaStore for MemoryQaStore {
    fn create_session(&self, article_id: i64, title: &str) -> Result<QaSession> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        let session = QaSession {
            id: tables.next_session_id,
            article_id,
            title: title.to_string(),
            summary: String::new(),
            created_at: now,
            updated_at: now,
        };
        tables.next_session_id += 1;
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    fn get_session(&self, id: i64) -> Result<QaSession> {
        self.tables
            .lock()
            .unwrap()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::Storage(format!("会话不存在 (id={})", id)))
    }

    fn list_sessions(&self, article_id: i64) -> Result<Vec<QaSession>> {
        let tables = self.tables.lock().unwrap();
        let mut sessions: Vec<QaSession> = tables
            .sessions
            .values()
            .filter(|s| s.article_id == article_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    fn rename_session(&self, id: i64, title: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| AppError::Storage(format!("会话不存在 (id={})", id)))?;
        session.title = title.to_string();
        session.updated_at = Utc::now();
        Ok(())
    }

    fn delete_session(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.sessions.remove(&id);
        tables.messages.retain(|_, m| m.session_id != id);
        tables.pins.retain(|_, p| p.session_id != id);
        Ok(())
    }

    fn session_summary(&self, id: i64) -> Result<String> {
        Ok(self.get_session(id)?.summary)
    }

    fn set_session_summary(&self, id: i64, summary: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| AppError::Storage(format!("会话不存在 (id={})", id)))?;
        session.summary = summary.to_string();
        session.updated_at = Utc::now();
        Ok(())
    }

    fn insert_message(&self, mut message: QaMessage) -> Result<i64> {
        let mut tables = self.tables.lock().unwrap();
        message.id = tables.next_message_id;
        message.created_at = Utc::now();
        tables.next_message_id += 1;
        let id = message.id;
        tables.messages.insert(id, message);
        Ok(id)
    }

    fn get_message(&self, id: i64) -> Result<QaMessage> {
        self.tables
            .lock()
            .unwrap()
            .messages
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::Storage(format!("消息不存在 (id={})", id)))
    }

    fn list_messages(&self, session_id: i64) -> Result<Vec<QaMessage>> {
        let tables = self.tables.lock().unwrap();
        let mut messages: Vec<QaMessage> = tables
            .messages
            .values()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    fn finish_message_success(&self, id: i64, result: &AnalysisResult) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or_else(|| AppError::Storage(format!("消息不存在 (id={})", id)))?;
        message.content = result.text.clone();
        message.status = MessageStatus::Done;
        message.error_reason = String::new();
        message.duration_ms = result.duration_ms;
        message.prompt_tokens = result.prompt_tokens;
        message.completion_tokens = result.completion_tokens;
        message.total_tokens = result.total_tokens;
        Ok(())
    }

    fn finish_message_failure(&self, id: i64, error_reason: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let message = tables
            .messages
            .get_mut(&id)
            .ok_or_else(|| AppError::Storage(format!("消息不存在 (id={})", id)))?;
        message.status = MessageStatus::Failed;
        message.error_reason = error_reason.to_string();
        Ok(())
    }

    fn insert_evidences(&self, message_id: i64, evidences: &[QaEvidence]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        for evidence in evidences {
            let mut evidence = evidence.clone();
            evidence.id = tables.next_evidence_id;
            evidence.message_id = message_id;
            tables.next_evidence_id += 1;
            tables.evidences.push(evidence);
        }
        Ok(())
    }

    fn list_evidences(&self, message_id: i64, limit: usize) -> Result<Vec<QaEvidence>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .evidences
            .iter()
            .filter(|e| e.message_id == message_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_pins(&self, session_id: i64) -> Result<Vec<QaPin>> {
        let tables = self.tables.lock().unwrap();
        let mut pins: Vec<QaPin> = tables
            .pins
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        pins.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(pins)
    }

    fn save_pin(&self, mut pin: QaPin) -> Result<QaPin> {
        let mut tables = self.tables.lock().unwrap();
        let now = Utc::now();
        if pin.id == 0 {
            pin.id = tables.next_pin_id;
            pin.created_at = now;
            tables.next_pin_id += 1;
        } else if !tables.pins.contains_key(&pin.id) {
            return Err(AppError::Storage(format!("记忆不存在 (id={})", pin.id)));
        }
        pin.updated_at = now;
        tables.pins.insert(pin.id, pin.clone());
        Ok(pin)
    }

    fn delete_pin(&self, id: i64) -> Result<()> {
        self.tables.lock().unwrap().pins.remove(&id);
        Ok(())
    }
}

/// 内存审计接收方，保留全部记录供测试断言
#[derive(Default)]
pub struct MemoryAuditSink {
    analysis_runs: Mutex<Vec<AnalysisRun>>,
    qa_runs: Mutex<Vec<QaRun>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analysis_runs(&self) -> Vec<AnalysisRun> {
        self.analysis_runs.lock().unwrap().clone()
    }

    pub fn qa_runs(&self) -> Vec<QaRun> {
        self.qa_runs.lock().unwrap().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record_analysis_run(&self, run: AnalysisRun) {
        self.analysis_runs.lock().unwrap().push(run);
    }

    fn record_qa_run(&self, run: QaRun) {
        self.qa_runs.lock().unwrap().push(run);
    }
}

/// 内存快照存储
#[derive(Default)]
pub struct MemorySnapshotStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

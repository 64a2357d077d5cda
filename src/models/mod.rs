//! 数据模型
//!
//! 编排核心的记录类型：渠道/提示词、文章、角色、批量任务状态与快照、
//! 问答会话/消息/固定记忆/引用、审计记录。
//!
//! 所有对外可见的结构体都按 camelCase 序列化，与前端事件载荷保持一致。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// AI 渠道（接入点 + 凭证 + 模型）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiChannel {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub is_default: bool,
}

/// 提示词模板
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub id: i64,
    pub name: String,
    pub content: String,
    pub is_default: bool,
}

/// 解读模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Text,
    Structured,
}

impl AnalysisMode {
    /// 宽松解析：大小写不敏感，未知取值回落到 `Text`
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("structured") {
            AnalysisMode::Structured
        } else {
            AnalysisMode::Text
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Text => "text",
            AnalysisMode::Structured => "structured",
        }
    }
}

/// 一次 LLM 调用的结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: i64,
}

/// 文章解读状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    /// 待解读
    #[default]
    Pending,
    /// 解读中
    Analyzing,
    /// 已解读
    Analyzed,
}

/// 文章
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub status: ArticleStatus,
}

/// 批量任务中单篇文章的失败明细
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub article_id: i64,
    pub title: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// 批量任务状态
///
/// 不变式：`completed == succeeded + failed`，`in_progress <= concurrency`；
/// 任务结束当且仅当队列为空且没有在途调用
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub running: bool,
    pub paused: bool,
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub concurrency: usize,
    pub failures: Vec<BatchFailure>,
}

/// 批量任务快照，作为单个 JSON 串持久化到配置存储
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub status: BatchStatus,
    pub channel_id: i64,
    pub prompt_id: i64,
    pub mode: AnalysisMode,
    pub updated_at: DateTime<Utc>,
}

/// 问答角色（人设）
///
/// 不变式：启用角色中至多一个默认角色，由角色服务的修复逻辑维护
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub alias: String,
    pub domain_tags: String,
    pub system_prompt: String,
    pub model_override: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub enabled: bool,
    pub is_default: bool,
}

/// 问答会话
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaSession {
    pub id: i64,
    pub article_id: i64,
    pub title: String,
    /// 滚动摘要：新内容追加到尾部，超出预算时截断头部
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 消息归属方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    #[default]
    User,
    Assistant,
}

/// 消息状态，assistant 消息以 `Running` 创建，终态转换只发生一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Running,
    #[default]
    Done,
    Failed,
}

/// 问答消息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaMessage {
    pub id: i64,
    pub session_id: i64,
    pub article_id: i64,
    /// 追问和回答都通过 parent_id 挂到触发它们的消息上，0 表示无
    pub parent_id: i64,
    pub role_type: MessageRole,
    pub role_id: i64,
    pub role_name: String,
    pub content: String,
    pub status: MessageStatus,
    pub error_reason: String,
    pub duration_ms: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub evidences: Vec<QaEvidence>,
}

/// 用户固定到会话的事实，在删除前逐字进入该会话后续的每个提示词
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaPin {
    pub id: i64,
    pub session_id: i64,
    pub article_id: i64,
    pub source_message_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 回答与检索片段之间的引用关系
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaEvidence {
    pub id: i64,
    pub message_id: i64,
    pub chunk_index: usize,
    pub quote: String,
    pub reason: String,
}

/// 批量/单篇解读的审计记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRun {
    pub article_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub prompt_id: i64,
    pub prompt_name: String,
    pub mode: AnalysisMode,
    pub success: bool,
    pub error_reason: String,
    pub duration_ms: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub created_at: DateTime<Utc>,
}

/// 问答角色回合的审计记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaRun {
    pub session_id: i64,
    pub message_id: i64,
    pub article_id: i64,
    pub role_id: i64,
    pub role_name: String,
    pub success: bool,
    pub error_reason: String,
    pub duration_ms: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub created_at: DateTime<Utc>,
}

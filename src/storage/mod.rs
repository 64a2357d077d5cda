//! 存储集成方接口
//!
//! ## 职责
//!
//! 编排核心通过这里的 trait 访问一切持久化能力：文章、角色、渠道/提示词、
//! 问答记录、审计与快照。核心只写自己的任务/会话/消息/引用记录，
//! 其余 CRUD 属于集成方。
//!
//! `memory` 子模块提供内存实现，供测试和无数据库的嵌入方使用。

pub mod memory;

use crate::error::Result;
use crate::models::{
    AiChannel, AnalysisResult, AnalysisRun, Article, ArticleStatus, PromptTemplate, QaEvidence,
    QaMessage, QaPin, QaRun, QaSession, Role,
};

/// 文章存储
pub trait ArticleStore: Send + Sync {
    fn get_article(&self, id: i64) -> Result<Article>;

    /// 标记解读状态（待解读/解读中/已解读）
    fn set_article_status(&self, id: i64, status: ArticleStatus) -> Result<()>;

    /// 保存解读结果并把文章标记为已解读
    fn save_analysis(
        &self,
        id: i64,
        analysis: &str,
        prompt_name: &str,
        channel_name: &str,
    ) -> Result<()>;
}

/// 渠道与提示词注册表
///
/// 查不到一律视为配置错误，调用方不应重试
pub trait ChannelRegistry: Send + Sync {
    fn get_channel(&self, id: i64) -> Result<AiChannel>;

    /// 默认渠道：标记为默认的渠道，没有标记时取第一个
    fn default_channel(&self) -> Result<AiChannel>;

    fn get_prompt(&self, id: i64) -> Result<PromptTemplate>;
}

/// 角色存储
pub trait RoleStore: Send + Sync {
    fn list_roles(&self) -> Result<Vec<Role>>;

    fn get_role(&self, id: i64) -> Result<Role>;

    /// 新增或更新角色，`id == 0` 表示新增；返回落库后的角色
    fn upsert_role(&self, role: Role) -> Result<Role>;

    fn delete_role(&self, id: i64) -> Result<()>;
}

/// 问答记录存储，会话/消息/固定记忆/引用均归编排核心所有
pub trait QaStore: Send + Sync {
    fn create_session(&self, article_id: i64, title: &str) -> Result<QaSession>;

    fn get_session(&self, id: i64) -> Result<QaSession>;

    fn list_sessions(&self, article_id: i64) -> Result<Vec<QaSession>>;

    fn rename_session(&self, id: i64, title: &str) -> Result<()>;

    fn delete_session(&self, id: i64) -> Result<()>;

    fn session_summary(&self, id: i64) -> Result<String>;

    fn set_session_summary(&self, id: i64, summary: &str) -> Result<()>;

    /// 插入消息并返回分配的 id
    fn insert_message(&self, message: QaMessage) -> Result<i64>;

    fn get_message(&self, id: i64) -> Result<QaMessage>;

    fn list_messages(&self, session_id: i64) -> Result<Vec<QaMessage>>;

    /// running → done，写入内容与耗时/token 统计
    fn finish_message_success(&self, id: i64, result: &AnalysisResult) -> Result<()>;

    /// running → failed，只写入失败原因
    fn finish_message_failure(&self, id: i64, error_reason: &str) -> Result<()>;

    fn insert_evidences(&self, message_id: i64, evidences: &[QaEvidence]) -> Result<()>;

    fn list_evidences(&self, message_id: i64, limit: usize) -> Result<Vec<QaEvidence>>;

    fn list_pins(&self, session_id: i64) -> Result<Vec<QaPin>>;

    /// 新增或更新固定记忆，`id == 0` 表示新增
    fn save_pin(&self, pin: QaPin) -> Result<QaPin>;

    fn delete_pin(&self, id: i64) -> Result<()>;
}

/// 审计接收方，只追加不回读；失败由实现方自行消化
pub trait AuditSink: Send + Sync {
    fn record_analysis_run(&self, run: AnalysisRun);

    fn record_qa_run(&self, run: QaRun);
}

/// 快照键值存储
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: &str) -> Result<()>;
}

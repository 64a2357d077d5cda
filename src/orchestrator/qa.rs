//! 多角色问答编排 - 编排层
//!
//! ## 职责
//!
//! 1. **提问入口**：落用户消息、解析目标角色后立即返回，回答异步流出
//! 2. **检索增强**：按关键词命中挑选文章片段，拼装各角色的提示词
//! 3. **并发扇出**：角色并发上限固定（与批量调度互不相干），
//!    每个角色各自带 90 秒超时，互不影响成败
//! 4. **会话记忆**：全部角色结束后把"问/答"摘要追加进会话滚动摘要
//! 5. **取消语义**：新提问总是先取消上一次仍在进行的提问
//!
//! 同一会话上的并发提问在滚动摘要上是后写覆盖（与存储层语义一致），
//! 这里不做串行化。

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{classify_error_reason, AppError, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::models::{
    AiChannel, AnalysisMode, MessageRole, MessageStatus, QaEvidence, QaMessage, QaPin, QaRun, Role,
};
use crate::services::retrieval::{build_article_chunks, retrieve_top_chunks, ArticleChunk};
use crate::services::{Analyzer, RoleService};
use crate::storage::{ArticleStore, AuditSink, ChannelRegistry, QaStore, RoleStore};
use crate::utils::trim_to_chars;

const FOLLOW_UP_EVIDENCE_LIMIT: usize = 4;
const FOLLOW_UP_CONTEXT_CHARS: usize = 1200;
const EVIDENCE_QUOTE_CHARS: usize = 180;
const SESSION_TITLE_MAX_CHARS: usize = 64;

/// 追加到每个角色系统提示词后的回答格式约束
const QA_ANSWER_INSTRUCTION: &str = r#"

你正在回答用户对报告的追问。要求：
1) 只基于提供的报告上下文回答，不得编造。
2) 输出纯文本，不要 JSON。
3) 结尾单独一行写"参考片段: x,y,z"（x/y/z 为片段编号）。"#;

#[derive(Default)]
struct ActiveAsk {
    cancel: Option<CancellationToken>,
    seq: u64,
}

struct QaInner {
    config: Config,
    analyzer: Arc<dyn Analyzer>,
    articles: Arc<dyn ArticleStore>,
    registry: Arc<dyn ChannelRegistry>,
    qa: Arc<dyn QaStore>,
    roles: RoleService,
    audit: Arc<dyn AuditSink>,
    events: Arc<dyn EventSink>,
    active: Mutex<ActiveAsk>,
}

/// 多角色问答编排器
#[derive(Clone)]
pub struct QaOrchestrator {
    inner: Arc<QaInner>,
}

impl QaOrchestrator {
    pub fn new(
        config: Config,
        analyzer: Arc<dyn Analyzer>,
        articles: Arc<dyn ArticleStore>,
        registry: Arc<dyn ChannelRegistry>,
        qa: Arc<dyn QaStore>,
        roles: Arc<dyn RoleStore>,
        audit: Arc<dyn AuditSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(QaInner {
                config,
                analyzer,
                articles,
                registry,
                qa,
                roles: RoleService::new(roles),
                audit,
                events,
                active: Mutex::new(ActiveAsk::default()),
            }),
        }
    }

    /// 提问
    ///
    /// 落用户消息并解析角色后立即返回用户消息 id，各角色的回答经事件
    /// 异步流出。`session_id` 为空时新建会话；`follow_up_message_id`
    /// 指向上一轮要继续追问的回答。
    ///
    /// 新提问会先取消当前仍在进行的提问。
    pub fn ask(
        &self,
        session_id: Option<i64>,
        article_id: i64,
        question: &str,
        follow_up_message_id: Option<i64>,
    ) -> Result<i64> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::InvalidInput("问题不能为空".to_string()));
        }
        if follow_up_message_id.is_some() && session_id.is_none() {
            return Err(AppError::InvalidInput(
                "继续追问需要在已有会话中进行".to_string(),
            ));
        }
        info!(
            "[QA] 提问开始 session={:?} article={} question={}",
            session_id,
            article_id,
            trim_to_chars(question, 80)
        );

        let session_id = match session_id {
            Some(id) => id,
            None => {
                let session = self
                    .inner
                    .qa
                    .create_session(article_id, &trim_to_chars(question, SESSION_TITLE_MAX_CHARS))?;
                info!("[QA] 新建会话 session={} article={}", session.id, article_id);
                session.id
            }
        };

        let (roles, cleaned_question) = self.inner.roles.resolve_roles_by_mentions(question)?;
        info!(
            "[QA] 角色解析完成 session={} count={} question={}",
            session_id,
            roles.len(),
            trim_to_chars(&cleaned_question, 80)
        );

        let follow_up_context = match follow_up_message_id {
            Some(follow_up_id) => {
                self.build_follow_up_context(session_id, article_id, follow_up_id)?
            }
            None => String::new(),
        };

        let user_message_id = self.inner.qa.insert_message(QaMessage {
            session_id,
            article_id,
            parent_id: follow_up_message_id.unwrap_or(0),
            role_type: MessageRole::User,
            content: cleaned_question.clone(),
            status: MessageStatus::Done,
            ..Default::default()
        })?;

        // 新提问总是顶掉上一次仍在进行的提问
        let (token, seq) = {
            let mut active = self.inner.active.lock().unwrap();
            if let Some(previous) = active.cancel.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            active.cancel = Some(token.clone());
            active.seq += 1;
            (token, active.seq)
        };

        self.inner.events.emit(ProgressEvent::QaJobStart {
            session_id,
            question_message_id: user_message_id,
            role_count: roles.len(),
        });

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .run_ask(
                    session_id,
                    article_id,
                    user_message_id,
                    roles,
                    cleaned_question,
                    follow_up_context,
                    token,
                    seq,
                )
                .await;
        });
        Ok(user_message_id)
    }

    /// 取消当前仍在进行的提问
    pub fn cancel_ask(&self) -> Result<()> {
        let cancel = self.inner.active.lock().unwrap().cancel.clone();
        match cancel {
            Some(token) => {
                token.cancel();
                info!("[QA] 已请求取消当前提问");
                Ok(())
            }
            None => Err(AppError::InvalidInput(
                "当前没有进行中的提问任务".to_string(),
            )),
        }
    }

    async fn run_ask(
        self,
        session_id: i64,
        article_id: i64,
        user_message_id: i64,
        roles: Vec<Role>,
        cleaned_question: String,
        follow_up_context: String,
        token: CancellationToken,
        seq: u64,
    ) {
        if let Err(e) = self
            .run_ask_inner(
                session_id,
                article_id,
                user_message_id,
                roles,
                &cleaned_question,
                &follow_up_context,
                &token,
            )
            .await
        {
            warn!("[QA] 提问执行失败 session={} err={}", session_id, e);
            self.inner.events.emit(ProgressEvent::QaRoleError {
                message_id: 0,
                role_id: 0,
                role_name: String::new(),
                error: e.to_string(),
            });
        }

        {
            let mut active = self.inner.active.lock().unwrap();
            if active.seq == seq {
                active.cancel = None;
            }
        }
        self.inner
            .events
            .emit(ProgressEvent::QaJobDone { session_id });
        info!("[QA] 提问结束 session={}", session_id);
    }

    async fn run_ask_inner(
        &self,
        session_id: i64,
        article_id: i64,
        user_message_id: i64,
        roles: Vec<Role>,
        cleaned_question: &str,
        follow_up_context: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Ok(());
        }

        let article = self.inner.articles.get_article(article_id)?;
        let chunks = build_article_chunks(&article.content, self.inner.config.chunk_max_chars);
        let retrieved = retrieve_top_chunks(
            cleaned_question,
            chunks,
            self.inner.config.retrieve_top_k,
        );

        // 摘要/记忆读取失败不阻断提问，按空处理
        let summary = self.inner.qa.session_summary(session_id).unwrap_or_default();
        let pins = self.inner.qa.list_pins(session_id).unwrap_or_default();
        let channel = self.inner.registry.default_channel()?;

        let semaphore = Arc::new(Semaphore::new(self.inner.config.qa_concurrency));
        let answer_summaries: Arc<Mutex<Vec<String>>> =
            Arc::new(Mutex::new(Vec::with_capacity(roles.len())));

        let mut handles = Vec::with_capacity(roles.len());
        for role in roles {
            let worker = self.clone();
            let context = RoleCallContext {
                session_id,
                article_id,
                user_message_id,
                role,
                channel: channel.clone(),
                summary: summary.clone(),
                pins: pins.clone(),
                follow_up_context: follow_up_context.to_string(),
                question: cleaned_question.to_string(),
                retrieved: retrieved.clone(),
            };
            let semaphore = semaphore.clone();
            let answer_summaries = answer_summaries.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                worker.run_role(context, semaphore, answer_summaries, token).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("[QA] 所有角色处理完成 session={}", session_id);

        // 整次提问被取消时不写会话记忆
        if !token.is_cancelled() {
            let answers = answer_summaries.lock().unwrap().join("\n");
            let payload = format!(
                "Q: {}\n{}",
                trim_to_chars(cleaned_question, self.inner.config.summary_item_chars),
                answers
            );
            if let Err(e) = self.append_session_summary(session_id, &payload) {
                warn!("[QA] 更新会话摘要失败 session={} err={}", session_id, e);
            }
        }
        Ok(())
    }

    async fn run_role(
        self,
        context: RoleCallContext,
        semaphore: Arc<Semaphore>,
        answer_summaries: Arc<Mutex<Vec<String>>>,
        token: CancellationToken,
    ) {
        let permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = semaphore.acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return;
        };
        if token.is_cancelled() {
            return;
        }

        let role = &context.role;
        info!(
            "[QA] 角色开始回答 session={} role={}({})",
            context.session_id, role.id, role.name
        );

        let mut message = QaMessage {
            session_id: context.session_id,
            article_id: context.article_id,
            parent_id: context.user_message_id,
            role_type: MessageRole::Assistant,
            role_id: role.id,
            role_name: role.name.clone(),
            status: MessageStatus::Running,
            ..Default::default()
        };
        let assistant_message_id = match self.inner.qa.insert_message(message.clone()) {
            Ok(id) => id,
            Err(e) => {
                self.inner.events.emit(ProgressEvent::QaRoleError {
                    message_id: 0,
                    role_id: role.id,
                    role_name: role.name.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };
        message.id = assistant_message_id;
        self.inner.events.emit(ProgressEvent::QaRoleStart {
            message: message.clone(),
        });

        let mut active_channel = context.channel.clone();
        if !role.model_override.is_empty() {
            active_channel.model = role.model_override.clone();
        }

        let system_prompt = build_qa_system_prompt(role);
        let qa_input = build_qa_input(
            &context.summary,
            &context.pins,
            &context.follow_up_context,
            &context.question,
            &context.retrieved,
        );

        let started_at = Instant::now();
        let events = self.inner.events.clone();
        let (role_id, role_name) = (role.id, role.name.clone());
        let mut on_chunk = move |chunk: &str| {
            events.emit(ProgressEvent::QaRoleChunk {
                message_id: assistant_message_id,
                role_id,
                role_name: role_name.clone(),
                chunk: chunk.to_string(),
            });
        };

        let timeout = Duration::from_secs(self.inner.config.qa_role_timeout_secs);
        let outcome = tokio::time::timeout(
            timeout,
            self.inner.analyzer.analyze(
                &active_channel,
                &system_prompt,
                &qa_input,
                AnalysisMode::Text,
                &token,
                &mut on_chunk,
            ),
        )
        .await;

        let result = match outcome {
            Err(_elapsed) => Err(format!(
                "角色回答超时（{} 秒）",
                self.inner.config.qa_role_timeout_secs
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(result)) => Ok(result),
        };

        match result {
            Err(error_message) => {
                warn!(
                    "[QA] 角色回答失败 session={} role={}({}) message={} err={}",
                    context.session_id, role.id, role.name, assistant_message_id, error_message
                );
                let _ = self
                    .inner
                    .qa
                    .finish_message_failure(assistant_message_id, &trim_to_chars(&error_message, 255));
                self.inner.audit.record_qa_run(QaRun {
                    session_id: context.session_id,
                    message_id: assistant_message_id,
                    article_id: context.article_id,
                    role_id: role.id,
                    role_name: role.name.clone(),
                    success: false,
                    error_reason: classify_error_reason(&error_message).as_str().to_string(),
                    duration_ms: started_at.elapsed().as_millis() as i64,
                    created_at: Utc::now(),
                    ..Default::default()
                });
                self.inner.events.emit(ProgressEvent::QaRoleError {
                    message_id: assistant_message_id,
                    role_id: role.id,
                    role_name: role.name.clone(),
                    error: error_message,
                });
            }
            Ok(result) => {
                let _ = self
                    .inner
                    .qa
                    .finish_message_success(assistant_message_id, &result);
                self.inner.audit.record_qa_run(QaRun {
                    session_id: context.session_id,
                    message_id: assistant_message_id,
                    article_id: context.article_id,
                    role_id: role.id,
                    role_name: role.name.clone(),
                    success: true,
                    error_reason: String::new(),
                    duration_ms: result.duration_ms,
                    prompt_tokens: result.prompt_tokens,
                    completion_tokens: result.completion_tokens,
                    total_tokens: result.total_tokens,
                    created_at: Utc::now(),
                });

                let evidences: Vec<QaEvidence> = context
                    .retrieved
                    .iter()
                    .map(|chunk| QaEvidence {
                        id: 0,
                        message_id: assistant_message_id,
                        chunk_index: chunk.index,
                        quote: trim_to_chars(&chunk.text, EVIDENCE_QUOTE_CHARS),
                        reason: "问题关键词命中".to_string(),
                    })
                    .collect();
                let _ = self
                    .inner
                    .qa
                    .insert_evidences(assistant_message_id, &evidences);
                info!(
                    "[QA] 角色回答完成 session={} role={}({}) message={} duration_ms={}",
                    context.session_id,
                    role.id,
                    role.name,
                    assistant_message_id,
                    result.duration_ms
                );

                answer_summaries.lock().unwrap().push(format!(
                    "A[{}]: {}",
                    role.name,
                    trim_to_chars(&result.text, self.inner.config.summary_item_chars)
                ));

                message.content = result.text.clone();
                message.status = MessageStatus::Done;
                message.duration_ms = result.duration_ms;
                message.prompt_tokens = result.prompt_tokens;
                message.completion_tokens = result.completion_tokens;
                message.total_tokens = result.total_tokens;
                self.inner
                    .events
                    .emit(ProgressEvent::QaRoleDone { message });
            }
        }
    }

    /// 校验追问目标并汇出上一轮回答的内容与引用
    fn build_follow_up_context(
        &self,
        session_id: i64,
        article_id: i64,
        follow_up_message_id: i64,
    ) -> Result<String> {
        let message = self
            .inner
            .qa
            .get_message(follow_up_message_id)
            .map_err(|_| AppError::InvalidInput("未找到可继续追问的回答".to_string()))?;
        if message.session_id != session_id
            || message.article_id != article_id
            || message.role_type != MessageRole::Assistant
        {
            return Err(AppError::InvalidInput(
                "未找到可继续追问的回答".to_string(),
            ));
        }

        let evidences = self
            .inner
            .qa
            .list_evidences(follow_up_message_id, FOLLOW_UP_EVIDENCE_LIMIT)?;

        let mut context = String::from("上轮回答摘要:\n");
        context.push_str(&trim_to_chars(&message.content, FOLLOW_UP_CONTEXT_CHARS));
        if !evidences.is_empty() {
            context.push_str("\n\n上轮回答引用片段:\n");
            for evidence in &evidences {
                context.push_str(&format!(
                    "[{}] {}\n",
                    evidence.chunk_index,
                    trim_to_chars(&evidence.quote, EVIDENCE_QUOTE_CHARS)
                ));
            }
        }
        Ok(context.trim().to_string())
    }

    /// 把新的"问/答"块追加进滚动摘要并截断到尾部预算
    fn append_session_summary(&self, session_id: i64, payload: &str) -> Result<()> {
        let current = self.inner.qa.session_summary(session_id).unwrap_or_default();
        let next = format!("{}\n{}", current.trim(), payload.trim())
            .trim()
            .to_string();
        let next = crate::utils::tail_chars(&next, self.inner.config.summary_tail_chars);
        self.inner.qa.set_session_summary(session_id, &next)
    }
}

/// 单个角色调用所需的全部输入，在扇出前一次性拷贝
struct RoleCallContext {
    session_id: i64,
    article_id: i64,
    user_message_id: i64,
    role: Role,
    channel: AiChannel,
    summary: String,
    pins: Vec<QaPin>,
    follow_up_context: String,
    question: String,
    retrieved: Vec<ArticleChunk>,
}

fn build_qa_system_prompt(role: &Role) -> String {
    let base = role.system_prompt.trim();
    let base = if base.is_empty() {
        crate::services::roles::FALLBACK_ROLE_PROMPT
    } else {
        base
    };
    format!("{}{}", base, QA_ANSWER_INSTRUCTION)
}

/// 拼装用户消息：会话摘要 → 固定记忆 → 追问上下文 → 编号片段 → 问题
fn build_qa_input(
    summary: &str,
    pins: &[QaPin],
    follow_up_context: &str,
    question: &str,
    chunks: &[ArticleChunk],
) -> String {
    let mut input = String::new();
    if !summary.trim().is_empty() {
        input.push_str("会话摘要:\n");
        input.push_str(summary);
        input.push_str("\n\n");
    }
    if !pins.is_empty() {
        input.push_str("固定记忆(用户确认事实):\n");
        for (i, pin) in pins.iter().enumerate() {
            input.push_str(&format!("(P{}) {}\n", i + 1, pin.content));
        }
        input.push('\n');
    }
    if !follow_up_context.trim().is_empty() {
        input.push_str("上轮回答上下文(继续追问):\n");
        input.push_str(follow_up_context);
        input.push_str("\n\n");
    }
    input.push_str("报告相关片段:\n");
    for chunk in chunks {
        input.push_str(&format!("[{}] {}\n", chunk.index, chunk.text));
    }
    input.push_str("\n用户问题:\n");
    input.push_str(question);
    input
}

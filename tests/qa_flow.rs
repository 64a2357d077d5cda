//! 多角色问答集成测试
//!
//! 用脚本化的假客户端与内存存储驱动完整提问流程，
//! 覆盖提及解析/检索拼装/扇出成败/会话记忆/超时与取消

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stock_report_analysis::models::{
    AiChannel, AnalysisMode, AnalysisResult, Article, ArticleStatus, MessageRole, MessageStatus,
    QaPin, Role,
};
use stock_report_analysis::services::Analyzer;
use stock_report_analysis::storage::memory::{
    MemoryArticleStore, MemoryAuditSink, MemoryChannelRegistry, MemoryQaStore, MemoryRoleStore,
};
use stock_report_analysis::storage::QaStore;
use stock_report_analysis::{AppError, Config, NullEventSink, QaOrchestrator, QaService, RoleService};

/// 脚本化客户端
///
/// - 记录每次调用的 (系统提示词, 用户输入)
/// - 系统提示词包含 `fail_marker` 时返回错误
/// - `hang` 打开时一直等到被取消
/// - `sleep` 模拟慢响应，期间可被取消
struct ScriptedAnalyzer {
    fail_marker: Option<String>,
    hang: bool,
    sleep: Duration,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedAnalyzer {
    fn ok() -> Self {
        Self {
            fail_marker: None,
            hang: false,
            sleep: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing_for(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Self::ok()
        }
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::ok()
        }
    }

    fn slow(sleep: Duration) -> Self {
        Self {
            sleep,
            ..Self::ok()
        }
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(
        &self,
        _channel: &AiChannel,
        prompt: &str,
        content: &str,
        _mode: AnalysisMode,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> stock_report_analysis::Result<AnalysisResult> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), content.to_string()));

        if self.hang {
            cancel.cancelled().await;
            return Err(AppError::Canceled);
        }
        if !self.sleep.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Canceled),
                _ = tokio::time::sleep(self.sleep) => {}
            }
        }
        if let Some(marker) = &self.fail_marker {
            if prompt.contains(marker.as_str()) {
                return Err(AppError::Provider(
                    "upstream 500 internal error".to_string(),
                ));
            }
        }
        on_chunk("回答");
        on_chunk("完毕");
        Ok(AnalysisResult {
            text: "回答完毕。\n参考片段: 1".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            duration_ms: 2,
        })
    }
}

struct Fixture {
    orchestrator: QaOrchestrator,
    analyzer: Arc<ScriptedAnalyzer>,
    qa: Arc<MemoryQaStore>,
    audit: Arc<MemoryAuditSink>,
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

fn make_fixture_with(
    config: Config,
    article_content: &str,
    roles: Vec<Role>,
    analyzer: ScriptedAnalyzer,
) -> Fixture {
    let _ = tracing_subscriber::fmt::try_init();

    let analyzer = Arc::new(analyzer);
    let articles = Arc::new(MemoryArticleStore::new());
    articles.insert(Article {
        id: 1,
        title: "半年报".to_string(),
        content: article_content.to_string(),
        status: ArticleStatus::Pending,
    });

    let registry = Arc::new(MemoryChannelRegistry::new());
    registry.add_channel(AiChannel {
        id: 1,
        name: "默认渠道".to_string(),
        base_url: "http://localhost".to_string(),
        api_key: "key".to_string(),
        model: "m".to_string(),
        is_default: true,
    });

    let role_store: Arc<MemoryRoleStore> = Arc::new(MemoryRoleStore::new());
    let role_service = RoleService::new(role_store.clone());
    for role in roles {
        role_service.save_role(role).unwrap();
    }

    let qa = Arc::new(MemoryQaStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let orchestrator = QaOrchestrator::new(
        config,
        analyzer.clone(),
        articles,
        registry,
        qa.clone(),
        role_store,
        audit.clone(),
        Arc::new(NullEventSink),
    );
    Fixture {
        orchestrator,
        analyzer,
        qa,
        audit,
    }
}

fn make_fixture(article_content: &str, roles: Vec<Role>, analyzer: ScriptedAnalyzer) -> Fixture {
    make_fixture_with(Config::default(), article_content, roles, analyzer)
}

/// 轮询直到会话内的 assistant 消息全部到达终态
async fn wait_for_assistant_terminal(qa: &MemoryQaStore, session_id: i64, expected: usize) {
    for _ in 0..500 {
        let messages = qa.list_messages(session_id).unwrap();
        let assistants: Vec<_> = messages
            .iter()
            .filter(|m| m.role_type == MessageRole::Assistant)
            .collect();
        if assistants.len() == expected
            && assistants.iter().all(|m| m.status != MessageStatus::Running)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("assistant 消息超时未到达终态");
}

/// 轮询直到会话摘要非空
async fn wait_for_summary(qa: &MemoryQaStore, session_id: i64) -> String {
    for _ in 0..500 {
        let summary = qa.session_summary(session_id).unwrap();
        if !summary.is_empty() {
            return summary;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("会话摘要超时未写入");
}

/// 单默认角色场景：每个启用角色恰好一条 assistant 消息，
/// 完成后追加 "Q: .../A[analyst]: ..." 摘要
#[tokio::test]
async fn ask_single_default_role_end_to_end() {
    let fixture = make_fixture(
        "A.\nB.\nC.",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );

    let user_message_id = fixture
        .orchestrator
        .ask(None, 1, "总结一下", None)
        .unwrap();
    assert!(user_message_id > 0);

    // 会话由问题自动创建并命名
    let sessions = fixture.qa.list_sessions(1).unwrap();
    assert_eq!(sessions.len(), 1);
    let session_id = sessions[0].id;
    assert_eq!(sessions[0].title, "总结一下");

    wait_for_assistant_terminal(&fixture.qa, session_id, 1).await;
    let messages = fixture.qa.list_messages(session_id).unwrap();
    assert_eq!(messages.len(), 2);

    let user_message = &messages[0];
    assert_eq!(user_message.role_type, MessageRole::User);
    assert_eq!(user_message.content, "总结一下");

    let answer = &messages[1];
    assert_eq!(answer.role_type, MessageRole::Assistant);
    assert_eq!(answer.status, MessageStatus::Done);
    assert_eq!(answer.role_name, "analyst");
    assert_eq!(answer.parent_id, user_message.id);
    assert_eq!(answer.content, "回答完毕。\n参考片段: 1");
    assert_eq!(answer.total_tokens, 15);

    // 引用记录指向喂给模型的片段
    let evidences = fixture.qa.list_evidences(answer.id, usize::MAX).unwrap();
    assert!(!evidences.is_empty());
    assert_eq!(evidences[0].chunk_index, 1);

    let summary = wait_for_summary(&fixture.qa, session_id).await;
    assert!(summary.starts_with("Q: 总结一下\nA[analyst]: 回答完毕。"));

    let runs = fixture.audit.qa_runs();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].success);
}

/// `@finance @risk 问题`：两个角色按提及顺序扇出，提及 token 被剥离
#[tokio::test]
async fn ask_with_mentions_fans_out_to_both_roles() {
    let fixture = make_fixture(
        "营收持续增长。\n风险在于应收账款。",
        vec![make_role("财务", "finance"), make_role("风控", "risk")],
        ScriptedAnalyzer::ok(),
    );

    fixture
        .orchestrator
        .ask(None, 1, "@finance @risk 问题", None)
        .unwrap();
    let session_id = fixture.qa.list_sessions(1).unwrap()[0].id;
    wait_for_assistant_terminal(&fixture.qa, session_id, 2).await;

    let messages = fixture.qa.list_messages(session_id).unwrap();
    assert_eq!(messages[0].content, "问题");

    let mut role_names: Vec<String> = messages
        .iter()
        .filter(|m| m.role_type == MessageRole::Assistant)
        .map(|m| m.role_name.clone())
        .collect();
    role_names.sort();
    assert_eq!(role_names, vec!["财务".to_string(), "风控".to_string()]);

    // 两个角色各自拿到了自己的系统提示词
    let prompts: Vec<String> = fixture
        .analyzer
        .calls()
        .into_iter()
        .map(|(prompt, _)| prompt)
        .collect();
    assert!(prompts.iter().any(|p| p.starts_with("你是财务")));
    assert!(prompts.iter().any(|p| p.starts_with("你是风控")));
}

/// 检索命中的片段进入提示词；全不命中时回落到开头片段
#[tokio::test]
async fn retrieval_feeds_matching_chunks_into_prompt() {
    let paragraphs: Vec<String> = (1..=10)
        .map(|i| {
            if i == 3 {
                "第三段专门讨论毛利率水平。".to_string()
            } else {
                format!("第{}段是别的内容。", i)
            }
        })
        .collect();

    // 片段预算调小，保证每段独立成块
    let config = Config {
        chunk_max_chars: 16,
        ..Default::default()
    };
    let fixture = make_fixture_with(
        config,
        &paragraphs.join("\n"),
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );

    fixture
        .orchestrator
        .ask(None, 1, "毛利率 如何", None)
        .unwrap();
    let session_id = fixture.qa.list_sessions(1).unwrap()[0].id;
    wait_for_assistant_terminal(&fixture.qa, session_id, 1).await;

    let (_, input) = fixture.analyzer.calls().remove(0);
    assert!(input.contains("[3] 第三段专门讨论毛利率水平。"));
    assert!(input.contains("用户问题:\n毛利率 如何"));

    // 第二问：关键词全不命中，回落到开头片段
    fixture
        .orchestrator
        .ask(Some(session_id), 1, "完全无关词汇组合", None)
        .unwrap();
    wait_for_assistant_terminal(&fixture.qa, session_id, 2).await;
    let (_, fallback_input) = fixture.analyzer.calls().remove(1);
    assert!(fallback_input.contains("[1] "));
    assert!(fallback_input.contains("[6] "));
    assert!(!fallback_input.contains("[7] "));
}

/// 单角色失败不影响兄弟角色；失败原因分类进入审计
#[tokio::test]
async fn role_failure_is_isolated_from_siblings() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("财务", "finance"), make_role("风控", "risk")],
        ScriptedAnalyzer::failing_for("风控"),
    );

    fixture
        .orchestrator
        .ask(None, 1, "@finance @risk 怎么看", None)
        .unwrap();
    let session_id = fixture.qa.list_sessions(1).unwrap()[0].id;
    wait_for_assistant_terminal(&fixture.qa, session_id, 2).await;

    let messages = fixture.qa.list_messages(session_id).unwrap();
    let done: Vec<_> = messages
        .iter()
        .filter(|m| m.status == MessageStatus::Done && m.role_type == MessageRole::Assistant)
        .collect();
    let failed: Vec<_> = messages
        .iter()
        .filter(|m| m.status == MessageStatus::Failed)
        .collect();
    assert_eq!(done.len(), 1);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].role_name, "风控");
    assert!(!failed[0].error_reason.is_empty());

    // 失败消息没有引用记录
    let failed_evidences = fixture
        .qa
        .list_evidences(failed[0].id, usize::MAX)
        .unwrap();
    assert!(failed_evidences.is_empty());

    let runs = fixture.audit.qa_runs();
    assert_eq!(runs.len(), 2);
    let failed_run = runs.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed_run.error_reason, "server");

    // 摘要只包含成功角色的回答
    let summary = wait_for_summary(&fixture.qa, session_id).await;
    assert!(summary.contains("A[财务]"));
    assert!(!summary.contains("A[风控]"));
}

/// 追问校验：必须指向同会话同文章的 assistant 消息；新会话不允许追问
#[tokio::test]
async fn follow_up_validation_and_context() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );

    fixture.orchestrator.ask(None, 1, "第一问", None).unwrap();
    let session_id = fixture.qa.list_sessions(1).unwrap()[0].id;
    wait_for_assistant_terminal(&fixture.qa, session_id, 1).await;
    wait_for_summary(&fixture.qa, session_id).await;

    let messages = fixture.qa.list_messages(session_id).unwrap();
    let user_id = messages[0].id;
    let answer_id = messages[1].id;

    // 新会话带追问 id 是参数错误
    assert!(fixture
        .orchestrator
        .ask(None, 1, "追问", Some(answer_id))
        .is_err());
    // 指向用户消息同样被拒
    assert!(fixture
        .orchestrator
        .ask(Some(session_id), 1, "追问", Some(user_id))
        .is_err());
    // 指向不存在的消息
    assert!(fixture
        .orchestrator
        .ask(Some(session_id), 1, "追问", Some(9999))
        .is_err());

    // 合法追问：上一轮回答与引用进入提示词
    fixture
        .orchestrator
        .ask(Some(session_id), 1, "继续说说", Some(answer_id))
        .unwrap();
    wait_for_assistant_terminal(&fixture.qa, session_id, 2).await;

    let calls = fixture.analyzer.calls();
    let (_, follow_up_input) = &calls[calls.len() - 1];
    assert!(follow_up_input.contains("上轮回答上下文(继续追问):"));
    assert!(follow_up_input.contains("上轮回答摘要:"));
    assert!(follow_up_input.contains("回答完毕。"));
}

/// 固定记忆逐字进入后续提示词
#[tokio::test]
async fn pins_are_included_verbatim() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );
    let session = fixture.qa.create_session(1, "会话").unwrap();

    let qa_service = QaService::new(fixture.qa.clone());
    qa_service
        .save_pin(QaPin {
            session_id: session.id,
            article_id: 1,
            content: "营收口径按并表后计算".to_string(),
            ..Default::default()
        })
        .unwrap();

    fixture
        .orchestrator
        .ask(Some(session.id), 1, "怎么看", None)
        .unwrap();
    wait_for_assistant_terminal(&fixture.qa, session.id, 1).await;

    let (_, input) = fixture.analyzer.calls().remove(0);
    assert!(input.contains("固定记忆(用户确认事实):"));
    assert!(input.contains("(P1) 营收口径按并表后计算"));
}

/// 上一问的摘要成为下一问的上下文（会话记忆）
#[tokio::test]
async fn session_summary_feeds_next_question() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );

    fixture.orchestrator.ask(None, 1, "第一问", None).unwrap();
    let session_id = fixture.qa.list_sessions(1).unwrap()[0].id;
    wait_for_assistant_terminal(&fixture.qa, session_id, 1).await;
    wait_for_summary(&fixture.qa, session_id).await;

    fixture
        .orchestrator
        .ask(Some(session_id), 1, "第二问", None)
        .unwrap();
    wait_for_assistant_terminal(&fixture.qa, session_id, 2).await;

    let calls = fixture.analyzer.calls();
    let (_, second_input) = &calls[calls.len() - 1];
    assert!(second_input.contains("会话摘要:"));
    assert!(second_input.contains("Q: 第一问"));
}

/// 滚动摘要超出预算时只保留尾部
#[tokio::test]
async fn session_summary_is_tail_truncated() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );
    let session = fixture.qa.create_session(1, "会话").unwrap();
    // 预先填满摘要
    fixture
        .qa
        .set_session_summary(session.id, &"旧".repeat(2000))
        .unwrap();

    fixture
        .orchestrator
        .ask(Some(session.id), 1, "新问题", None)
        .unwrap();
    wait_for_assistant_terminal(&fixture.qa, session.id, 1).await;

    for _ in 0..500 {
        let summary = fixture.qa.session_summary(session.id).unwrap();
        if summary.contains("新问题") {
            assert!(summary.chars().count() <= 2000);
            assert!(summary.ends_with("参考片段: 1"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("摘要未更新");
}

/// 角色超时被单独分类为 timeout，与普通失败区分
#[tokio::test]
async fn role_timeout_is_classified_distinctly() {
    let config = Config {
        qa_role_timeout_secs: 1,
        ..Default::default()
    };
    let fixture = make_fixture_with(
        config,
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::slow(Duration::from_secs(30)),
    );

    fixture
        .orchestrator
        .ask(None, 1, "会超时的问题", None)
        .unwrap();
    let session_id = fixture.qa.list_sessions(1).unwrap()[0].id;
    wait_for_assistant_terminal(&fixture.qa, session_id, 1).await;

    let messages = fixture.qa.list_messages(session_id).unwrap();
    let answer = &messages[1];
    assert_eq!(answer.status, MessageStatus::Failed);
    assert!(answer.error_reason.contains("超时"));

    let runs = fixture.audit.qa_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].error_reason, "timeout");
}

/// 新提问顶掉上一问：在途角色以 canceled 收场，且被顶掉的那问不写摘要
#[tokio::test]
async fn new_ask_supersedes_and_cancels_previous() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::hanging(),
    );

    fixture.orchestrator.ask(None, 1, "第一问", None).unwrap();
    let first_session = fixture.qa.list_sessions(1).unwrap()[0].id;
    // 等第一问的角色进入 running
    for _ in 0..500 {
        let messages = fixture.qa.list_messages(first_session).unwrap();
        if messages
            .iter()
            .any(|m| m.role_type == MessageRole::Assistant)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // 新提问顶掉第一问
    fixture.orchestrator.ask(None, 1, "第二问", None).unwrap();
    wait_for_assistant_terminal(&fixture.qa, first_session, 1).await;

    let first_messages = fixture.qa.list_messages(first_session).unwrap();
    let canceled = first_messages
        .iter()
        .find(|m| m.role_type == MessageRole::Assistant)
        .unwrap();
    assert_eq!(canceled.status, MessageStatus::Failed);
    assert!(canceled.error_reason.contains("已取消"));

    let canceled_run = fixture
        .audit
        .qa_runs()
        .into_iter()
        .find(|r| !r.success)
        .unwrap();
    assert_eq!(canceled_run.error_reason, "canceled");

    // 被取消的提问不写会话摘要
    assert!(fixture
        .qa
        .session_summary(first_session)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cancel_ask_without_active_job_errors() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );
    assert!(fixture.orchestrator.cancel_ask().is_err());
}

#[tokio::test]
async fn cancel_ask_finalizes_running_roles() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::hanging(),
    );

    fixture.orchestrator.ask(None, 1, "取消我", None).unwrap();
    let session_id = fixture.qa.list_sessions(1).unwrap()[0].id;
    // 等角色消息进入 running 再取消
    for _ in 0..500 {
        if fixture
            .qa
            .list_messages(session_id)
            .unwrap()
            .iter()
            .any(|m| m.role_type == MessageRole::Assistant)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fixture.orchestrator.cancel_ask().unwrap();
    wait_for_assistant_terminal(&fixture.qa, session_id, 1).await;

    let messages = fixture.qa.list_messages(session_id).unwrap();
    let answer = messages
        .iter()
        .find(|m| m.role_type == MessageRole::Assistant)
        .unwrap();
    assert_eq!(answer.status, MessageStatus::Failed);
    assert!(answer.error_reason.contains("已取消"));
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let fixture = make_fixture(
        "内容。",
        vec![make_role("analyst", "")],
        ScriptedAnalyzer::ok(),
    );
    assert!(fixture.orchestrator.ask(None, 1, "   ", None).is_err());
}

//! 批量解读调度器 - 编排层
//!
//! ## 职责
//!
//! 1. **任务状态机**：Idle → Running →（Paused ↔ Running）→ Idle
//! 2. **并发控制**：并发上限钳制在 1..=8，作为在途网络调用的硬上限
//! 3. **队列调度**：单协调循环 + 多 worker，经一把锁和一个唤醒信号协作
//! 4. **崩溃恢复**：每次状态变化后把快照持久化为单个 JSON 串；
//!    重启后加载的快照一律视为未运行（没有 worker 能跨进程存活）
//! 5. **失败重试**：只重提历史失败的文章，沿用原渠道/提示词/并发/模式
//!
//! ## 设计特点
//!
//! - 任务状态只存在一份，由调度器独占持有；外部只能拿到深拷贝
//! - 单篇失败只累加计数，从不中断整个批量
//! - worker 完成后自行更新计数并唤醒协调循环

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{classify_error_reason, AppError, ErrorReason, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::models::{
    AiChannel, AnalysisMode, AnalysisResult, AnalysisRun, ArticleStatus, BatchFailure,
    BatchSnapshot, BatchStatus, PromptTemplate,
};
use crate::services::Analyzer;
use crate::storage::{ArticleStore, AuditSink, ChannelRegistry, SnapshotStore};

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 8;

/// 批量任务的全部可变状态，只在 `BatchInner::state` 的锁内访问
struct BatchState {
    status: BatchStatus,
    pending: VecDeque<i64>,
    channel: AiChannel,
    prompt: PromptTemplate,
    mode: AnalysisMode,
    snapshot_loaded: bool,
}

struct BatchInner {
    config: Config,
    analyzer: Arc<dyn Analyzer>,
    articles: Arc<dyn ArticleStore>,
    registry: Arc<dyn ChannelRegistry>,
    audit: Arc<dyn AuditSink>,
    events: Arc<dyn EventSink>,
    snapshots: Arc<dyn SnapshotStore>,
    state: Mutex<BatchState>,
    notify: Notify,
}

/// 批量解读调度器
#[derive(Clone)]
pub struct BatchDispatcher {
    inner: Arc<BatchInner>,
}

/// 协调循环每轮在锁内决定的下一步动作
enum Step {
    Dispatch(Vec<i64>, AiChannel, PromptTemplate, AnalysisMode),
    Finished(BatchSnapshot),
    Wait,
}

impl BatchDispatcher {
    pub fn new(
        config: Config,
        analyzer: Arc<dyn Analyzer>,
        articles: Arc<dyn ArticleStore>,
        registry: Arc<dyn ChannelRegistry>,
        audit: Arc<dyn AuditSink>,
        events: Arc<dyn EventSink>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                config,
                analyzer,
                articles,
                registry,
                audit,
                events,
                snapshots,
                state: Mutex::new(BatchState {
                    status: BatchStatus::default(),
                    pending: VecDeque::new(),
                    channel: AiChannel::default(),
                    prompt: PromptTemplate::default(),
                    mode: AnalysisMode::Text,
                    snapshot_loaded: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// 启动批量解读
    ///
    /// 已有任务在运行时报错；文章 id 去重并升序排序，并发钳制到 1..=8
    pub fn start(
        &self,
        article_ids: &[i64],
        channel_id: i64,
        prompt_id: i64,
        concurrency: usize,
        mode: AnalysisMode,
    ) -> Result<()> {
        if article_ids.is_empty() {
            return Err(AppError::InvalidInput(
                "请先选择至少一篇文章".to_string(),
            ));
        }
        let channel = self.inner.registry.get_channel(channel_id)?;
        let prompt = self.inner.registry.get_prompt(prompt_id)?;
        let concurrency = concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        let ids = unique_sorted_ids(article_ids);

        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            if state.status.running {
                return Err(AppError::InvalidInput(
                    "已有批量任务正在运行".to_string(),
                ));
            }
            state.status = BatchStatus {
                running: true,
                paused: false,
                total: ids.len(),
                completed: 0,
                succeeded: 0,
                failed: 0,
                in_progress: 0,
                concurrency,
                failures: Vec::new(),
            };
            state.pending = ids.into();
            state.channel = channel;
            state.prompt = prompt;
            state.mode = mode;
            state.snapshot_loaded = true;
            make_snapshot(&state)
        };

        info!(
            "🚀 批量解读启动: 共 {} 篇，最大并发 {}",
            snapshot.status.total, snapshot.status.concurrency
        );
        self.persist_snapshot(&snapshot);
        self.emit_status(snapshot.status);

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch_loop().await });
        Ok(())
    }

    /// 暂停：停止新的分发，在途调用继续跑完
    pub fn pause(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.status.running {
                return Err(AppError::InvalidInput(
                    "当前没有运行中的批量任务".to_string(),
                ));
            }
            state.status.paused = true;
            make_snapshot(&state)
        };
        info!("⏸️ 批量任务已暂停");
        self.persist_snapshot(&snapshot);
        self.emit_status(snapshot.status);
        Ok(())
    }

    /// 恢复被暂停的任务
    pub fn resume(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.status.running {
                return Err(AppError::InvalidInput(
                    "当前没有运行中的批量任务".to_string(),
                ));
            }
            state.status.paused = false;
            make_snapshot(&state)
        };
        self.inner.notify.notify_one();
        info!("▶️ 批量任务已恢复");
        self.persist_snapshot(&snapshot);
        self.emit_status(snapshot.status);
        Ok(())
    }

    /// 只重试历史失败的文章，沿用原渠道/提示词/并发/模式
    pub fn retry_failed(&self) -> Result<()> {
        let (ids, channel_id, prompt_id, concurrency, mode) = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.snapshot_loaded {
                self.load_snapshot_locked(&mut state);
            }
            if state.status.running {
                return Err(AppError::InvalidInput(
                    "请等待当前任务结束后再重试".to_string(),
                ));
            }
            if state.status.failures.is_empty() {
                return Err(AppError::InvalidInput(
                    "没有可重试的失败任务".to_string(),
                ));
            }
            let ids: Vec<i64> = state.status.failures.iter().map(|f| f.article_id).collect();
            (
                ids,
                state.channel.id,
                state.prompt.id,
                state.status.concurrency,
                state.mode,
            )
        };
        info!("🔁 重试 {} 篇失败文章", ids.len());
        self.start(&ids, channel_id, prompt_id, concurrency, mode)
    }

    /// 返回任务状态的深拷贝；进程重启后第一次读取时加载持久化快照
    pub fn status(&self) -> BatchStatus {
        let mut state = self.inner.state.lock().unwrap();
        if !state.snapshot_loaded {
            self.load_snapshot_locked(&mut state);
        }
        state.status.clone()
    }

    /// 单篇解读：标记 → 调用 → 保存 → 审计，增量文本走进度事件
    pub async fn analyze_article(
        &self,
        article_id: i64,
        channel_id: i64,
        prompt_id: i64,
        mode: AnalysisMode,
    ) -> Result<()> {
        let article = self.inner.articles.get_article(article_id)?;
        let channel = self.inner.registry.get_channel(channel_id)?;
        let prompt = self.inner.registry.get_prompt(prompt_id)?;

        self.inner
            .articles
            .set_article_status(article_id, ArticleStatus::Analyzing)?;

        let started_at = Instant::now();
        let cancel = CancellationToken::new();
        let events = self.inner.events.clone();
        let mut on_chunk = |chunk: &str| {
            events.emit(ProgressEvent::AnalysisChunk {
                chunk: chunk.to_string(),
            });
        };

        let result = self
            .inner
            .analyzer
            .analyze(
                &channel,
                &prompt.content,
                &article.content,
                mode,
                &cancel,
                &mut on_chunk,
            )
            .await;

        match result {
            Err(e) => {
                let _ = self
                    .inner
                    .articles
                    .set_article_status(article_id, ArticleStatus::Pending);
                self.record_analysis_run(
                    article_id,
                    &channel,
                    &prompt,
                    mode,
                    &AnalysisResult::default(),
                    Some(classify_error_reason(&e.to_string())),
                    started_at,
                );
                Err(e)
            }
            Ok(result) => {
                if let Err(e) = self.inner.articles.save_analysis(
                    article_id,
                    &result.text,
                    &prompt.name,
                    &channel.name,
                ) {
                    let _ = self
                        .inner
                        .articles
                        .set_article_status(article_id, ArticleStatus::Pending);
                    self.record_analysis_run(
                        article_id,
                        &channel,
                        &prompt,
                        mode,
                        &result,
                        Some(ErrorReason::SaveError),
                        started_at,
                    );
                    return Err(e);
                }
                self.record_analysis_run(
                    article_id, &channel, &prompt, mode, &result, None, started_at,
                );
                Ok(())
            }
        }
    }

    async fn dispatch_loop(self) {
        loop {
            let step = {
                let mut state = self.inner.state.lock().unwrap();
                if !state.status.running {
                    return;
                }
                if state.status.paused {
                    Step::Wait
                } else if state.pending.is_empty() && state.status.in_progress == 0 {
                    state.status.running = false;
                    state.status.paused = false;
                    Step::Finished(make_snapshot(&state))
                } else {
                    let mut batch = Vec::new();
                    while state.status.in_progress < state.status.concurrency {
                        let Some(article_id) = state.pending.pop_front() else {
                            break;
                        };
                        state.status.in_progress += 1;
                        batch.push(article_id);
                    }
                    if batch.is_empty() {
                        Step::Wait
                    } else {
                        Step::Dispatch(
                            batch,
                            state.channel.clone(),
                            state.prompt.clone(),
                            state.mode,
                        )
                    }
                }
            };

            match step {
                Step::Dispatch(ids, channel, prompt, mode) => {
                    for article_id in ids {
                        let worker = self.clone();
                        let channel = channel.clone();
                        let prompt = prompt.clone();
                        tokio::spawn(async move {
                            worker.run_batch_article(article_id, channel, prompt, mode).await;
                        });
                    }
                }
                Step::Finished(snapshot) => {
                    info!(
                        "✅ 批量解读完成: 成功 {}/{}，失败 {}",
                        snapshot.status.succeeded, snapshot.status.total, snapshot.status.failed
                    );
                    self.persist_snapshot(&snapshot);
                    self.emit_status(snapshot.status);
                    self.inner.events.emit(ProgressEvent::BatchDone);
                    return;
                }
                Step::Wait => {
                    self.inner.notify.notified().await;
                }
            }
        }
    }

    async fn run_batch_article(
        self,
        article_id: i64,
        channel: AiChannel,
        prompt: PromptTemplate,
        mode: AnalysisMode,
    ) {
        let started_at = Instant::now();
        let article = match self.inner.articles.get_article(article_id) {
            Ok(article) => article,
            Err(e) => {
                self.finish_batch_article(
                    article_id,
                    String::new(),
                    Some(format!("获取文章失败: {}", e)),
                    &channel,
                    &prompt,
                    mode,
                    &AnalysisResult::default(),
                    started_at,
                );
                return;
            }
        };

        let _ = self
            .inner
            .articles
            .set_article_status(article_id, ArticleStatus::Analyzing);

        let cancel = CancellationToken::new();
        let mut discard_chunks = |_chunk: &str| {};
        let result = self
            .inner
            .analyzer
            .analyze(
                &channel,
                &prompt.content,
                &article.content,
                mode,
                &cancel,
                &mut discard_chunks,
            )
            .await;

        match result {
            Err(e) => {
                let _ = self
                    .inner
                    .articles
                    .set_article_status(article_id, ArticleStatus::Pending);
                self.finish_batch_article(
                    article_id,
                    article.title,
                    Some(format!("解读失败: {}", e)),
                    &channel,
                    &prompt,
                    mode,
                    &AnalysisResult::default(),
                    started_at,
                );
            }
            Ok(result) => {
                if let Err(e) = self.inner.articles.save_analysis(
                    article_id,
                    &result.text,
                    &prompt.name,
                    &channel.name,
                ) {
                    let _ = self
                        .inner
                        .articles
                        .set_article_status(article_id, ArticleStatus::Pending);
                    self.finish_batch_article(
                        article_id,
                        article.title,
                        Some(format!("保存失败: {}", e)),
                        &channel,
                        &prompt,
                        mode,
                        &result,
                        started_at,
                    );
                    return;
                }
                self.finish_batch_article(
                    article_id,
                    article.title,
                    None,
                    &channel,
                    &prompt,
                    mode,
                    &result,
                    started_at,
                );
            }
        }
    }

    /// worker 收尾：写审计、更新计数、持久化快照、发事件、唤醒协调循环
    fn finish_batch_article(
        &self,
        article_id: i64,
        title: String,
        failure: Option<String>,
        channel: &AiChannel,
        prompt: &PromptTemplate,
        mode: AnalysisMode,
        result: &AnalysisResult,
        started_at: Instant,
    ) {
        let error_reason = failure.as_deref().map(classify_error_reason);
        self.record_analysis_run(
            article_id,
            channel,
            prompt,
            mode,
            result,
            error_reason,
            started_at,
        );

        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            state.status.in_progress -= 1;
            state.status.completed += 1;
            match &failure {
                None => state.status.succeeded += 1,
                Some(reason) => {
                    state.status.failed += 1;
                    state.status.failures.push(BatchFailure {
                        article_id,
                        title,
                        reason: reason.clone(),
                        at: Utc::now(),
                    });
                }
            }
            make_snapshot(&state)
        };
        self.persist_snapshot(&snapshot);

        self.inner.events.emit(ProgressEvent::BatchProgress {
            current: snapshot.status.completed,
            total: snapshot.status.total,
        });
        if let Some(reason) = failure {
            warn!("❌ 文章 {} 解读失败: {}", article_id, reason);
            self.inner
                .events
                .emit(ProgressEvent::BatchError { message: reason });
        }
        self.emit_status(snapshot.status);
        self.inner.notify.notify_one();
    }

    fn record_analysis_run(
        &self,
        article_id: i64,
        channel: &AiChannel,
        prompt: &PromptTemplate,
        mode: AnalysisMode,
        result: &AnalysisResult,
        error_reason: Option<ErrorReason>,
        started_at: Instant,
    ) {
        let duration_ms = if result.duration_ms > 0 {
            result.duration_ms
        } else {
            started_at.elapsed().as_millis() as i64
        };
        self.inner.audit.record_analysis_run(AnalysisRun {
            article_id,
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            prompt_id: prompt.id,
            prompt_name: prompt.name.clone(),
            mode,
            success: error_reason.is_none(),
            error_reason: error_reason.map(|r| r.as_str().to_string()).unwrap_or_default(),
            duration_ms,
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.completion_tokens,
            total_tokens: result.total_tokens,
            created_at: Utc::now(),
        });
    }

    /// 进程重启后第一次访问时恢复快照；缺失或损坏一律当作没有历史任务
    fn load_snapshot_locked(&self, state: &mut BatchState) {
        state.snapshot_loaded = true;

        let Some(raw) = self.inner.snapshots.get(&self.inner.config.batch_snapshot_key) else {
            return;
        };
        if raw.trim().is_empty() {
            return;
        }
        let snapshot: BatchSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("批量任务快照损坏，忽略: {}", e);
                return;
            }
        };

        // 重启后没有存活的 worker，一律标记为未运行
        let mut status = snapshot.status;
        status.running = false;
        status.paused = false;
        state.status = status;
        state.channel = AiChannel {
            id: snapshot.channel_id,
            ..Default::default()
        };
        state.prompt = PromptTemplate {
            id: snapshot.prompt_id,
            ..Default::default()
        };
        state.mode = snapshot.mode;
    }

    fn persist_snapshot(&self, snapshot: &BatchSnapshot) {
        let raw = match serde_json::to_string(snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("序列化批量任务快照失败: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .inner
            .snapshots
            .put(&self.inner.config.batch_snapshot_key, &raw)
        {
            warn!("保存批量任务快照失败: {}", e);
        }
    }

    fn emit_status(&self, status: BatchStatus) {
        self.inner.events.emit(ProgressEvent::BatchStatus { status });
    }
}

fn make_snapshot(state: &BatchState) -> BatchSnapshot {
    BatchSnapshot {
        status: state.status.clone(),
        channel_id: state.channel.id,
        prompt_id: state.prompt.id,
        mode: state.mode,
        updated_at: Utc::now(),
    }
}

/// 去重并升序排序
fn unique_sorted_ids(ids: &[i64]) -> Vec<i64> {
    let mut result: Vec<i64> = ids.to_vec();
    result.sort_unstable();
    result.dedup();
    result
}

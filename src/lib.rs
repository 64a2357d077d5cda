//! # Stock Report Analysis
//!
//! 面向股票研报的 LLM 解读编排核心：流式调用客户端、可暂停/可恢复/
//! 可崩溃恢复的批量调度器、多角色检索增强问答。
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 集成方接口（Storage / Events）
//! - `storage/` - 文章、角色、渠道/提示词、问答记录、审计、快照的 trait
//! - `events` - 带类型的进度事件与观察者接口
//!
//! ### ② 业务能力层（Services）
//! - `services/ai_client` - LLM 流式调用能力（SSE / 整体 JSON 双轨）
//! - `services/retrieval` - 片段切分与关键词检索能力
//! - `services/roles` - 角色解析与默认角色修复能力
//! - `services/qa_admin` - 会话/固定记忆维护能力
//!
//! ### ③ 编排层（Orchestration）
//! - `orchestrator/batch` - 批量解读调度器（状态机 + worker 池）
//! - `orchestrator/qa` - 多角色问答编排器（扇出 + 会话记忆）
//!
//! ### ④ 周边
//! - `scheduler` - 显式启停的周期任务运行器
//! - `config` / `error` / `models` / `utils`

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod utils;

// 重新导出常用类型
pub use config::Config;
pub use error::{classify_error_reason, AppError, ErrorReason, Result};
pub use events::{EventSink, NullEventSink, ProgressEvent};
pub use models::{AnalysisMode, AnalysisResult, BatchStatus};
pub use orchestrator::{BatchDispatcher, QaOrchestrator};
pub use scheduler::PeriodicRunner;
pub use services::{AiClient, Analyzer, QaService, RoleService};

//! 进度事件
//!
//! ## 职责
//!
//! 编排核心只负责产出带类型的生命周期事件，由外部展示层决定如何消费。
//! 发送是不可失败的：没有订阅者或订阅者出错都不能影响核心流程。

use serde::Serialize;

use crate::models::{BatchStatus, QaMessage};

/// 编排核心产出的生命周期事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    /// 单篇解读的增量文本
    AnalysisChunk { chunk: String },
    /// 批量任务状态变更（含启动/暂停/恢复/结束）
    BatchStatus { status: BatchStatus },
    /// 批量任务进度
    BatchProgress { current: usize, total: usize },
    /// 批量任务中单篇文章失败
    BatchError { message: String },
    /// 批量任务结束
    BatchDone,
    /// 一次提问开始分发
    QaJobStart {
        session_id: i64,
        question_message_id: i64,
        role_count: usize,
    },
    /// 角色开始回答
    QaRoleStart { message: QaMessage },
    /// 角色回答的增量文本
    QaRoleChunk {
        message_id: i64,
        role_id: i64,
        role_name: String,
        chunk: String,
    },
    /// 角色回答完成
    QaRoleDone { message: QaMessage },
    /// 角色回答失败
    QaRoleError {
        message_id: i64,
        role_id: i64,
        role_name: String,
        error: String,
    },
    /// 一次提问的所有角色均已结束
    QaJobDone { session_id: i64 },
}

/// 事件接收方
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// 丢弃所有事件的默认实现
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: ProgressEvent) {}
}

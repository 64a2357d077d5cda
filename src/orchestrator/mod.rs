//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责并发调度与生命周期管理，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch` - 批量解读调度器
//! - 持有唯一的批量任务状态（单锁 + 唤醒信号）
//! - 暂停/恢复/失败重试/崩溃恢复
//! - worker 并发上限 1..=8
//!
//! ### `qa` - 多角色问答编排器
//! - 解析 @提及并扇出到多个角色
//! - 检索增强的提示词拼装与会话记忆
//! - 角色级超时 + 提问级取消
//!
//! ## 层次关系
//!
//! ```text
//! orchestrator (batch / qa)
//!     ↓
//! services (能力层：ai_client / retrieval / roles / qa_admin)
//!     ↓
//! storage / events (集成方接口)
//! ```
//!
//! ## 设计原则
//!
//! 1. **状态独占**：任务与会话状态只经编排器读写，外部拿拷贝
//! 2. **失败隔离**：单篇/单角色失败不影响同批次的其他工作
//! 3. **向下依赖**：编排层 → services → storage/events

pub mod batch;
pub mod qa;

pub use batch::BatchDispatcher;
pub use qa::QaOrchestrator;

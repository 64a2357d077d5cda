//! 错误类型与失败原因分类
//!
//! ## 职责
//!
//! - `AppError`：编排核心对外暴露的错误类型
//! - `ErrorReason`：审计记录使用的失败原因标签（闭合集合）
//! - `classify_error_reason`：按序匹配的规则表，把错误文本归类到标签

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排核心错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置缺失或无效（渠道、提示词、角色等未配置）
    #[error("配置错误: {0}")]
    Config(String),

    /// 调用方传入的参数不合法
    #[error("参数错误: {0}")]
    InvalidInput(String),

    /// 上游返回了非 2xx 状态码
    #[error("API error {status}: {body}")]
    ApiStatus { status: u16, body: String },

    /// 上游返回了无法处理的响应类型
    #[error("非预期的响应类型 {content_type}: {preview}")]
    UnexpectedContentType {
        content_type: String,
        preview: String,
    },

    /// 上游在 2xx 响应体中携带的错误信息
    #[error("{0}")]
    Provider(String),

    /// 上游产出了空内容
    #[error("API 返回内容为空")]
    EmptyContent,

    /// 本次调用被取消
    #[error("已取消本次提问")]
    Canceled,

    /// 网络请求失败
    #[error("网络请求失败: {0}")]
    Http(#[from] reqwest::Error),

    /// 存储集成方返回的错误
    #[error("存储操作失败: {0}")]
    Storage(String),

    /// JSON 编解码失败
    #[error("解析 JSON 响应失败: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// 失败原因标签
///
/// 审计与看板使用的闭合集合，序列化为 snake_case 短标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Canceled,
    Timeout,
    RateLimit,
    Auth,
    ContextLimit,
    Server,
    Network,
    SaveError,
    Unknown,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::Canceled => "canceled",
            ErrorReason::Timeout => "timeout",
            ErrorReason::RateLimit => "rate_limit",
            ErrorReason::Auth => "auth",
            ErrorReason::ContextLimit => "context_limit",
            ErrorReason::Server => "server",
            ErrorReason::Network => "network",
            ErrorReason::SaveError => "save_error",
            ErrorReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类规则表，自上而下首条命中即返回
///
/// 取消必须排在超时之前：被取消的调用往往同时带有超时类字样
const CLASSIFY_RULES: &[(&[&str], ErrorReason)] = &[
    (&["已取消", "canceled", "cancelled"], ErrorReason::Canceled),
    (
        &["超时", "timeout", "timed out", "deadline"],
        ErrorReason::Timeout,
    ),
    (
        &["rate limit", "too many requests", "429"],
        ErrorReason::RateLimit,
    ),
    (
        &["unauthorized", "401", "forbidden", "403", "api key"],
        ErrorReason::Auth,
    ),
    (
        &["context length", "max context", "context_length"],
        ErrorReason::ContextLimit,
    ),
    (&["500", "502", "503", "504"], ErrorReason::Server),
    (
        &["connection", "network", "dns", "dial"],
        ErrorReason::Network,
    ),
    (&["保存", "save"], ErrorReason::SaveError),
];

/// 把错误文本归类为失败原因标签
///
/// 对错误消息做小写归一后逐条匹配规则表，没有命中时返回 `Unknown`
pub fn classify_error_reason(message: &str) -> ErrorReason {
    let msg = message.to_lowercase();
    for (patterns, reason) in CLASSIFY_RULES {
        if patterns.iter().any(|p| msg.contains(p)) {
            return *reason;
        }
    }
    ErrorReason::Unknown
}

//! LLM 流式调用客户端 - 业务能力层
//!
//! ## 职责
//!
//! - 向 OpenAI 兼容接入点发起一次 chat completion 调用
//! - 按响应类型分流：整体 JSON 回复一次性回调，SSE 流逐条回调
//! - 统计 token 用量与整体耗时
//! - 不做任何重试，重试策略由上层决定

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{AiChannel, AnalysisMode, AnalysisResult};

/// 结构化模式附加到系统提示词的输出约束
const STRUCTURED_SCHEMA_INSTRUCTION: &str = r#"

请严格以 JSON 输出，且必须是一个可解析的 JSON 对象，不要使用 Markdown 代码块。
JSON Schema:
{
  "summary": "string",
  "risks": ["string"],
  "catalysts": ["string"],
  "valuationView": "string"
}"#;

/// LLM 调用能力的注入点，便于上层在测试中替换
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// 发起一次解读调用
    ///
    /// `on_chunk` 在文本到达时立即回调；`cancel` 在请求与读流的任意阶段生效
    async fn analyze(
        &self,
        channel: &AiChannel,
        prompt: &str,
        content: &str,
        mode: AnalysisMode,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AnalysisResult>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct StreamChoice {
    #[serde(default)]
    message: StreamDelta,
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

/// LLM 客户端
pub struct AiClient {
    http: reqwest::Client,
}

impl AiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self { http })
    }

    async fn read_buffered(
        &self,
        response: reqwest::Response,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AnalysisResult> {
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Canceled),
            body = response.text() => body?,
        };

        let reply: StreamChunk = serde_json::from_str(&body)?;
        if let Some(error) = reply.error {
            if !error.message.is_empty() {
                return Err(AppError::Provider(error.message));
            }
        }

        let text = pick_choice_content(&reply.choices);
        if text.is_empty() {
            return Err(AppError::EmptyContent);
        }
        on_chunk(text);

        let usage = reply.usage.unwrap_or_default();
        Ok(AnalysisResult {
            text: text.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            duration_ms: 0,
        })
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AnalysisResult> {
        let mut full = String::new();
        let mut usage = Usage::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        'reading: loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Canceled),
                item = stream.next() => item,
            };
            let Some(item) = item else {
                // 流结束时缓冲区里可能还留有最后一行
                if !buffer.is_empty() {
                    let line = String::from_utf8_lossy(&buffer).to_string();
                    consume_sse_line(&line, &mut full, &mut usage, on_chunk)?;
                }
                break;
            };
            buffer.extend_from_slice(&item?);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                if consume_sse_line(&line, &mut full, &mut usage, on_chunk)? == SseLine::Done {
                    break 'reading;
                }
            }
        }

        if full.is_empty() {
            return Err(AppError::EmptyContent);
        }
        Ok(AnalysisResult {
            text: full,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            duration_ms: 0,
        })
    }
}

#[derive(PartialEq)]
enum SseLine {
    Consumed,
    Done,
}

/// 处理单行 SSE：累积文本、更新用量、识别错误与结束标记
///
/// 无法解码的数据行直接跳过，不中断整个流
fn consume_sse_line(
    line: &str,
    full: &mut String,
    usage: &mut Usage,
    on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Result<SseLine> {
    let Some(data) = parse_sse_data_line(line) else {
        return Ok(SseLine::Consumed);
    };
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
        return Ok(SseLine::Consumed);
    };
    if let Some(error) = chunk.error {
        if !error.message.is_empty() {
            return Err(AppError::Provider(error.message));
        }
    }
    if let Some(chunk_usage) = chunk.usage {
        *usage = chunk_usage;
    }

    let text = pick_choice_content(&chunk.choices);
    if !text.is_empty() {
        full.push_str(text);
        on_chunk(text);
    }
    Ok(SseLine::Consumed)
}

#[async_trait]
impl Analyzer for AiClient {
    async fn analyze(
        &self,
        channel: &AiChannel,
        prompt: &str,
        content: &str,
        mode: AnalysisMode,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AnalysisResult> {
        let started_at = Instant::now();

        let system_prompt = build_system_prompt(prompt, mode);
        let request = ChatRequest {
            model: &channel.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content,
                },
            ],
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            response_format: match mode {
                AnalysisMode::Structured => Some(ResponseFormat {
                    kind: "json_object",
                }),
                AnalysisMode::Text => None,
            },
        };

        let url = format!(
            "{}/chat/completions",
            channel.base_url.trim_end_matches('/')
        );
        debug!("调用 LLM API，模型: {}，模式: {}", channel.model, mode.as_str());

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Canceled),
            response = self
                .http
                .post(&url)
                .bearer_auth(&channel.api_key)
                .json(&request)
                .send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ApiStatus {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut result = if content_type.contains("application/json") {
            self.read_buffered(response, cancel, on_chunk).await?
        } else if content_type.contains("text/event-stream") {
            self.read_stream(response, cancel, on_chunk).await?
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::UnexpectedContentType {
                content_type,
                preview: body.chars().take(200).collect(),
            });
        };

        result.duration_ms = started_at.elapsed().as_millis() as i64;
        debug!(
            "LLM 调用完成，输出 {} 字符，耗时 {}ms",
            result.text.chars().count(),
            result.duration_ms
        );
        Ok(result)
    }
}

fn build_system_prompt(prompt: &str, mode: AnalysisMode) -> String {
    match mode {
        AnalysisMode::Text => prompt.to_string(),
        AnalysisMode::Structured => format!("{}{}", prompt, STRUCTURED_SCHEMA_INSTRUCTION),
    }
}

/// 提取 `data:` 行的有效载荷；其余行（注释、空行、事件名）返回 None
fn parse_sse_data_line(line: &str) -> Option<&str> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    Some(data)
}

/// 按 delta → message → text 的优先级取首个 choice 的文本
fn pick_choice_content(choices: &[StreamChoice]) -> &str {
    let Some(choice) = choices.first() else {
        return "";
    };
    if !choice.delta.content.is_empty() {
        &choice.delta.content
    } else if !choice.message.content.is_empty() {
        &choice.message.content
    } else {
        &choice.text
    }
}

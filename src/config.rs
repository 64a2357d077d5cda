/// 程序配置
///
/// 集中保存编排核心的运行参数，均可通过环境变量覆盖
#[derive(Clone, Debug)]
pub struct Config {
    /// 单次 LLM 请求的整体超时（秒）
    pub http_timeout_secs: u64,
    /// 问答中单个角色回答的超时（秒）
    pub qa_role_timeout_secs: u64,
    /// 问答角色并发上限
    pub qa_concurrency: usize,
    /// 检索片段的字符预算
    pub chunk_max_chars: usize,
    /// 检索返回的片段数量
    pub retrieve_top_k: usize,
    /// 会话摘要保留的尾部字符数
    pub summary_tail_chars: usize,
    /// 摘要中单条问答的截断长度
    pub summary_item_chars: usize,
    /// 批量任务快照在配置存储中的键
    pub batch_snapshot_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_timeout_secs: 300,
            qa_role_timeout_secs: 90,
            qa_concurrency: 2,
            chunk_max_chars: 900,
            retrieve_top_k: 6,
            summary_tail_chars: 2000,
            summary_item_chars: 240,
            batch_snapshot_key: "batch_status_snapshot".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.http_timeout_secs),
            qa_role_timeout_secs: std::env::var("QA_ROLE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.qa_role_timeout_secs),
            qa_concurrency: std::env::var("QA_CONCURRENCY").ok().and_then(|v| v.parse().ok()).unwrap_or(default.qa_concurrency),
            chunk_max_chars: std::env::var("CHUNK_MAX_CHARS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.chunk_max_chars),
            retrieve_top_k: std::env::var("RETRIEVE_TOP_K").ok().and_then(|v| v.parse().ok()).unwrap_or(default.retrieve_top_k),
            summary_tail_chars: std::env::var("SUMMARY_TAIL_CHARS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.summary_tail_chars),
            summary_item_chars: std::env::var("SUMMARY_ITEM_CHARS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.summary_item_chars),
            batch_snapshot_key: std::env::var("BATCH_SNAPSHOT_KEY").unwrap_or(default.batch_snapshot_key),
        }
    }
}

//! 轻量检索 - 业务能力层
//!
//! ## 职责
//!
//! - 把文章切成按段落对齐、受字符预算约束的片段
//! - 从问题中提取关键词并按出现次数给片段打分
//! - 取 top-K 片段，并恢复原文顺序后交给提示词组装

use std::sync::LazyLock;

use regex::Regex;

use crate::utils::trim_to_chars;

/// 字母/数字/汉字组成、长度不小于 2 的连续串
static KEYWORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]{2,}").expect("关键词正则不合法"));

/// 检索片段，编号从 1 开始
#[derive(Debug, Clone)]
pub struct ArticleChunk {
    pub index: usize,
    pub text: String,
    pub score: usize,
}

/// 把文章切成段落对齐的片段
///
/// 逐段累积，超出 `max_chars` 字符预算时封口开新片段；
/// 段落切分产出为空时退化为整篇截断的单个片段
pub fn build_article_chunks(content: &str, max_chars: usize) -> Vec<ArticleChunk> {
    let max_chars = if max_chars == 0 { 900 } else { max_chars };
    let content = content.replace("\r\n", "\n");

    let mut chunks: Vec<ArticleChunk> = Vec::new();
    let mut current = String::new();
    let mut index = 1;

    let mut flush = |current: &mut String, chunks: &mut Vec<ArticleChunk>, index: &mut usize| {
        let text = current.trim().to_string();
        current.clear();
        if text.is_empty() {
            return;
        }
        chunks.push(ArticleChunk {
            index: *index,
            text,
            score: 0,
        });
        *index += 1;
    };

    for paragraph in content.split('\n') {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !current.is_empty()
            && current.chars().count() + 1 + paragraph.chars().count() > max_chars
        {
            flush(&mut current, &mut chunks, &mut index);
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(paragraph);
    }
    flush(&mut current, &mut chunks, &mut index);

    if chunks.is_empty() && !content.trim().is_empty() {
        chunks.push(ArticleChunk {
            index: 1,
            text: trim_to_chars(&content, max_chars),
            score: 0,
        });
    }
    chunks
}

/// 提取检索关键词（小写、去重、保持出现顺序）
///
/// 提不出关键词时退化为整个问题本身，保证检索永远有词可查
pub fn extract_keywords(question: &str) -> Vec<String> {
    let question = question.to_lowercase();
    let mut seen = std::collections::HashSet::new();
    let keywords: Vec<String> = KEYWORD_PATTERN
        .find_iter(&question)
        .map(|m| m.as_str().to_string())
        .filter(|k| seen.insert(k.clone()))
        .collect();
    if keywords.is_empty() {
        return vec![question.trim().to_string()];
    }
    keywords
}

/// 选出与问题最相关的 K 个片段
///
/// 按关键词出现次数打分，得分相同按原文编号；全部得分为零时
/// 回落到按原文顺序取前 K 个，检索永远不会空手而归。
/// 选中的片段最终恢复原文顺序返回。
pub fn retrieve_top_chunks(
    question: &str,
    mut chunks: Vec<ArticleChunk>,
    k: usize,
) -> Vec<ArticleChunk> {
    if chunks.is_empty() {
        return Vec::new();
    }
    let k = if k == 0 { 6 } else { k }.min(chunks.len());

    let terms = extract_keywords(question);
    for chunk in &mut chunks {
        let text_lower = chunk.text.to_lowercase();
        chunk.score = terms
            .iter()
            .map(|term| text_lower.matches(term.as_str()).count())
            .sum();
    }

    chunks.sort_by(|a, b| b.score.cmp(&a.score).then(a.index.cmp(&b.index)));

    if chunks[0].score == 0 {
        chunks.truncate(k);
        return chunks;
    }

    chunks.truncate(k);
    chunks.sort_by_key(|c| c.index);
    chunks
}

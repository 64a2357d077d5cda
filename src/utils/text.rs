//! 文本工具
//!
//! 以字符（而非字节）为单位的截断与空白归一，中文内容必须按字符处理

/// 去除首尾空白后保留前 `limit` 个字符
pub fn trim_to_chars(text: &str, limit: usize) -> String {
    let text = text.trim();
    if limit == 0 {
        return String::new();
    }
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}

/// 保留最后 `limit` 个字符
pub fn tail_chars(text: &str, limit: usize) -> String {
    if limit == 0 {
        return String::new();
    }
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    text.chars().skip(count - limit).collect()
}

/// 把连续空白压缩为单个空格
pub fn normalize_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

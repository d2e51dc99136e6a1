//! Output Truncation - 分级截断工具输出
//!
//! Responsibilities:
//! - 按当前上下文规模选择截断等级 (light / medium / heavy)
//! - 保留头尾行，中间部分替换为截断标记
//! - 从被截掉的中段提取语义提示 (错误、TODO、声明)

use regex::Regex;
use std::sync::OnceLock;

/// 截断等级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationLevel {
    Light,
    Medium,
    Heavy,
}

impl TruncationLevel {
    /// 超过该字符数才截断
    pub fn max_chars(&self) -> usize {
        match self {
            TruncationLevel::Light => 5000,
            TruncationLevel::Medium => 3000,
            TruncationLevel::Heavy => 1000,
        }
    }

    /// 头尾各保留的行数
    pub fn edge_lines(&self) -> usize {
        match self {
            TruncationLevel::Heavy => 5,
            _ => 15,
        }
    }

    /// 上下文越大截断越重：< 1/5 高水位 light，< 3/5 medium，其余 heavy
    pub fn for_context(estimated_tokens: usize, high_water_mark: usize) -> Self {
        if estimated_tokens < high_water_mark / 5 {
            TruncationLevel::Light
        } else if estimated_tokens < high_water_mark.saturating_mul(3) / 5 {
            TruncationLevel::Medium
        } else {
            TruncationLevel::Heavy
        }
    }
}

/// Truncated output result
#[derive(Debug, Clone)]
pub struct TruncatedOutput {
    pub content: String,
    pub truncated: bool,
    pub level: TruncationLevel,
    /// 原始字符数
    pub original_chars: usize,
    pub line_count: usize,
}

/// Output truncation handler
#[derive(Debug, Clone)]
pub struct OutputTruncator {
    high_water_mark: usize,
}

const MAX_HINTS_PER_PATTERN: usize = 5;

fn keyword_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)error|failure|exception|bug|todo|fixme").ok())
        .as_ref()
}

fn declaration_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?m)^(?:export\s+)?(?:pub\s+)?(?:class|function|fn|struct|enum|trait|const|let|var|interface|type)\s+[A-Za-z0-9_$]+",
            )
            .ok()
        })
        .as_ref()
}

impl OutputTruncator {
    pub fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }

    pub fn level_for(&self, estimated_tokens: usize) -> TruncationLevel {
        TruncationLevel::for_context(estimated_tokens, self.high_water_mark)
    }

    /// 按上下文规模截断
    pub fn truncate_for_context(&self, output: &str, estimated_tokens: usize) -> TruncatedOutput {
        self.truncate(output, self.level_for(estimated_tokens))
    }

    /// 按指定等级截断
    pub fn truncate(&self, output: &str, level: TruncationLevel) -> TruncatedOutput {
        let original_chars = output.chars().count();
        let lines: Vec<&str> = output.split('\n').collect();
        let line_count = lines.len();

        if original_chars <= level.max_chars() {
            return TruncatedOutput {
                content: output.to_string(),
                truncated: false,
                level,
                original_chars,
                line_count,
            };
        }

        let edge = level.edge_lines();
        let content = if line_count > edge * 2 {
            let head = lines[..edge].join("\n");
            let tail = lines[line_count - edge..].join("\n");
            let middle = lines[edge..line_count - edge].join("\n");
            let hints = semantic_hints(&middle);
            let hint_block = if hints.is_empty() {
                String::new()
            } else {
                format!("\n[SEMANTIC HINTS: {}]\n", hints.join(", "))
            };
            format!(
                "{head}\n\n... [TRUNCATED {} lines] ...{hint_block}\n\n{tail}",
                line_count - edge * 2
            )
        } else {
            // 少量超长行：按字符保留头尾
            let keep = level.max_chars() / 2;
            let head: String = output.chars().take(keep).collect();
            let tail: String = output.chars().skip(original_chars - keep).collect();
            format!(
                "{head}\n\n... [TRUNCATED {} chars] ...\n\n{tail}",
                original_chars - keep * 2
            )
        };

        TruncatedOutput {
            content,
            truncated: true,
            level,
            original_chars,
            line_count,
        }
    }
}

impl Default for OutputTruncator {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn semantic_hints(middle: &str) -> Vec<String> {
    let mut hints = Vec::new();
    for pattern in [keyword_pattern(), declaration_pattern()].into_iter().flatten() {
        hints.extend(
            pattern
                .find_iter(middle)
                .take(MAX_HINTS_PER_PATTERN)
                .map(|m| m.as_str().to_string()),
        );
    }
    hints
}

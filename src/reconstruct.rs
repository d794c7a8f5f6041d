//! Bilingual display rendering.
//!
//! Combines an original message with its translation according to the
//! display mode. Structured blocks in the original (reasoning tags, table
//! edit tags, `<details>` and fenced code) are cut out before paragraph
//! alignment and restored verbatim, so they are never split or duplicated.

use crate::config::DisplayMode;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Private-use range placeholder delimiters are drawn from.
const SENTINEL_RANGE: std::ops::RangeInclusive<u32> = 0xE000..=0xF8FF;

static BR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("br regex"));
static BACKTICK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new("`{2,}").expect("backtick regex"));

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think regex"));
static THINKING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<thinking>.*?</thinking>").expect("thinking regex"));
static TABLE_EDIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tableEdit>.*?</tableEdit>").expect("tableEdit regex"));
static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("code fence regex"));
static DETAILS_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<details\b[^>]*>").expect("details regex"));
static DETAILS_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(/?)details\b[^>]*>").expect("details tag regex"));

/// Kinds of protected blocks, in matching priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Think,
    Thinking,
    TableEdit,
    Details,
    CodeFence,
}

impl BlockKind {
    const PRIORITY: [BlockKind; 5] = [
        BlockKind::Think,
        BlockKind::Thinking,
        BlockKind::TableEdit,
        BlockKind::Details,
        BlockKind::CodeFence,
    ];

    fn find_at(&self, text: &str, from: usize) -> Option<(usize, usize)> {
        let re = match self {
            BlockKind::Think => &*THINK_RE,
            BlockKind::Thinking => &*THINKING_RE,
            BlockKind::TableEdit => &*TABLE_EDIT_RE,
            BlockKind::CodeFence => &*CODE_FENCE_RE,
            BlockKind::Details => return find_details(text, from),
        };
        re.find_at(text, from).map(|m| (m.start(), m.end()))
    }
}

/// Finds the next balanced `<details>...</details>` region starting at or
/// after `from`. Opening tags without a matching close are skipped.
fn find_details(text: &str, from: usize) -> Option<(usize, usize)> {
    let mut search = from;
    while let Some(open) = DETAILS_OPEN_RE.find_at(text, search) {
        let mut depth = 0usize;
        for caps in DETAILS_TAG_RE.captures_iter(&text[open.start()..]) {
            let tag = caps.get(0)?;
            if caps.get(1).is_some_and(|m| m.as_str() == "/") {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some((open.start(), open.start() + tag.end()));
                }
            } else {
                depth += 1;
            }
        }
        search = open.end();
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Block(BlockKind, &'a str),
}

/// Splits `text` into literal runs and protected blocks in one left-to-right
/// pass. At each position the earliest block wins; ties go to priority order.
pub fn tokenize(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut pos = 0usize;

    while pos < text.len() {
        let mut best: Option<(BlockKind, usize, usize)> = None;
        for kind in BlockKind::PRIORITY {
            if let Some((start, end)) = kind.find_at(text, pos) {
                if best.map_or(true, |(_, s, _)| start < s) {
                    best = Some((kind, start, end));
                }
            }
        }

        match best {
            Some((kind, start, end)) => {
                if start > pos {
                    segments.push(Segment::Literal(&text[pos..start]));
                }
                segments.push(Segment::Block(kind, &text[start..end]));
                pos = end;
            }
            None => {
                segments.push(Segment::Literal(&text[pos..]));
                break;
            }
        }
    }

    segments
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconstructionError {
    #[error("no free placeholder characters left in the original text")]
    NoFreeSentinel,
    #[error("invalid placeholder pattern: {0}")]
    Pattern(String),
    #[error("unknown placeholder #{0}")]
    UnknownPlaceholder(usize),
}

/// Non-fatal conditions the caller should surface to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconstructionWarning {
    ParagraphMismatch { original: usize, translated: usize },
    Degraded(String),
}

impl fmt::Display for ReconstructionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconstructionWarning::ParagraphMismatch { original, translated } => write!(
                f,
                "Paragraph count mismatch (original {}, translated {}); showing the whole text side by side",
                original, translated
            ),
            ReconstructionWarning::Degraded(reason) => {
                write!(f, "Could not combine original and translation ({}); showing translation only", reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstruction {
    pub text: String,
    pub warning: Option<ReconstructionWarning>,
}

impl Reconstruction {
    fn plain(text: String) -> Self {
        Reconstruction { text, warning: None }
    }
}

/// Template of the original: literal text with every block replaced by a
/// placeholder token, plus the blocks themselves. The token delimiters are a
/// pair of private-use characters that do not occur in the original.
struct Template {
    text: String,
    blocks: Vec<String>,
    token_re: Regex,
}

fn pick_sentinels(original: &str) -> Option<(char, char)> {
    let mut candidates = SENTINEL_RANGE
        .filter_map(char::from_u32)
        .filter(|c| !original.contains(*c));
    Some((candidates.next()?, candidates.next()?))
}

impl Template {
    fn build(original: &str) -> Result<Self, ReconstructionError> {
        let (open, close) = pick_sentinels(original).ok_or(ReconstructionError::NoFreeSentinel)?;
        let token_re = Regex::new(&format!(
            "{}(\\d+){}",
            regex::escape(&open.to_string()),
            regex::escape(&close.to_string())
        ))
        .map_err(|e| ReconstructionError::Pattern(e.to_string()))?;

        let mut text = String::with_capacity(original.len());
        let mut blocks = Vec::new();
        for segment in tokenize(original) {
            match segment {
                Segment::Literal(s) => text.push_str(s),
                Segment::Block(_, s) => {
                    text.push(open);
                    text.push_str(&blocks.len().to_string());
                    text.push(close);
                    blocks.push(s.to_string());
                }
            }
        }

        Ok(Template { text: normalize_breaks(&text), blocks, token_re })
    }

    fn restore(&self, text: &str) -> Result<String, ReconstructionError> {
        let mut out = String::with_capacity(text.len());
        let mut pos = 0usize;
        for caps in self.token_re.captures_iter(text) {
            let (Some(whole), Some(index)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let idx: usize = index.as_str().parse().unwrap_or(usize::MAX);
            let block = self
                .blocks
                .get(idx)
                .ok_or(ReconstructionError::UnknownPlaceholder(idx))?;
            out.push_str(&text[pos..whole.start()]);
            out.push_str(block);
            pos = whole.end();
        }
        out.push_str(&text[pos..]);
        Ok(out)
    }

    /// Just the blocks referenced on `line`, one per line.
    fn restore_blocks_only(&self, line: &str) -> Result<String, ReconstructionError> {
        let tokens: Vec<&str> = self.token_re.find_iter(line).map(|m| m.as_str()).collect();
        self.restore(&tokens.join("\n"))
    }

    fn has_tokens(&self, line: &str) -> bool {
        self.token_re.is_match(line)
    }

    fn strip_tokens(&self, line: &str) -> String {
        self.token_re.replace_all(line, "").trim().to_string()
    }

    fn prose_lines(&self) -> Vec<String> {
        self.text
            .split('\n')
            .map(|l| self.strip_tokens(l))
            .filter(|l| !l.is_empty())
            .collect()
    }
}

fn normalize_breaks(text: &str) -> String {
    BR_RE.replace_all(&text.replace("\r\n", "\n"), "\n").trim().to_string()
}

/// Collapses backtick runs and closes an unbalanced inline code span.
pub fn fix_backticks(text: &str) -> String {
    let mut fixed = BACKTICK_RUN_RE.replace_all(text, "`").into_owned();
    if fixed.chars().filter(|&c| c == '`').count() % 2 == 1 {
        fixed.push('`');
    }
    fixed
}

fn fragment(mode: DisplayMode, translated: &str, original: &str) -> String {
    match mode {
        DisplayMode::Folded => format!(
            "<details class=\"llm-translator-details mode-folded\"><summary><span class=\"translated_text\">{}</span></summary><span class=\"original_text\">{}</span></details>",
            translated, original
        ),
        DisplayMode::Unfolded | DisplayMode::Disabled => format!(
            "<span class=\"translated_text mode-unfolded\">{}</span><br><span class=\"original_text mode-unfolded\">{}</span>",
            translated, original
        ),
    }
}

/// Builds the display text for a message. Never fails: internal errors
/// degrade to the translation alone.
pub fn reconstruct(mode: DisplayMode, original: &str, translated: Option<&str>) -> Reconstruction {
    let translated = translated.unwrap_or("");
    if mode == DisplayMode::Disabled {
        return Reconstruction::plain(translated.to_string());
    }

    match try_reconstruct(mode, original, translated) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("[Reconstruct] Failed to combine original and translation: {}", e);
            Reconstruction {
                text: fix_backticks(translated),
                warning: Some(ReconstructionWarning::Degraded(e.to_string())),
            }
        }
    }
}

fn try_reconstruct(
    mode: DisplayMode,
    original: &str,
    translated: &str,
) -> Result<Reconstruction, ReconstructionError> {
    let template = Template::build(original)?;
    let translated = normalize_breaks(translated);

    let original_prose = template.prose_lines();
    let translated_lines: Vec<&str> = translated
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if !original_prose.is_empty() && original_prose.len() == translated_lines.len() {
        let mut originals = original_prose.iter();
        let mut translations = translated_lines.iter();
        let mut out: Vec<String> = Vec::new();

        for line in template.text.split('\n') {
            if line.trim().is_empty() {
                out.push(String::new());
                continue;
            }
            if template.strip_tokens(line).is_empty() {
                out.push(template.restore(line)?);
                continue;
            }
            let (Some(orig), Some(trans)) = (originals.next(), translations.next()) else {
                break;
            };
            out.push(fragment(mode, &fix_backticks(trans), orig));
            if template.has_tokens(line) {
                out.push(template.restore_blocks_only(line)?);
            }
        }

        return Ok(Reconstruction::plain(out.join("\n")));
    }

    if original_prose.is_empty() {
        if !template.blocks.is_empty() {
            return Ok(Reconstruction::plain(template.restore(&template.text)?));
        }
        return Ok(Reconstruction::plain(fix_backticks(&translated)));
    }

    tracing::warn!(
        "[Reconstruct] Paragraph count mismatch: original {}, translated {}",
        original_prose.len(),
        translated_lines.len()
    );
    let whole_original = template.restore(&template.text)?;
    Ok(Reconstruction {
        text: fragment(mode, &fix_backticks(&translated), &whole_original),
        warning: Some(ReconstructionWarning::ParagraphMismatch {
            original: original_prose.len(),
            translated: translated_lines.len(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_mode_returns_translation_unchanged() {
        let r = reconstruct(DisplayMode::Disabled, "Hello", Some("  안녕 ``` "));
        assert_eq!(r.text, "  안녕 ``` ");
        assert_eq!(reconstruct(DisplayMode::Disabled, "Hello", None).text, "");
    }

    #[test]
    fn unfolded_pairs_lines_in_order() {
        let r = reconstruct(DisplayMode::Unfolded, "Hello\nWorld", Some("안녕\n세계"));
        assert!(r.warning.is_none());

        let t = &r.text;
        let positions: Vec<usize> = ["안녕", "<br>", "Hello", "세계", "World"]
            .iter()
            .scan(0usize, |from, needle| {
                let at = t[*from..].find(needle).map(|i| i + *from)?;
                *from = at + needle.len();
                Some(at)
            })
            .collect();
        assert_eq!(positions.len(), 5);
    }

    #[test]
    fn folded_emits_one_details_per_line() {
        let r = reconstruct(DisplayMode::Folded, "a\n\nb\nc", Some("A\nB\nC"));
        assert_eq!(r.text.matches("mode-folded").count(), 3);
        assert!(r.text.contains("<summary><span class=\"translated_text\">A</span></summary><span class=\"original_text\">a</span>"));
        assert_eq!(r.text.split('\n').nth(1), Some(""));
    }

    #[test]
    fn code_fence_survives_aligned_and_mismatched_paths() {
        let fence = "```rust\nfn main() {\n    println!(\"hi\");\n}\n```";
        let original = format!("Intro\n{}\nOutro", fence);

        let aligned = reconstruct(DisplayMode::Unfolded, &original, Some("소개\n결말"));
        assert!(aligned.warning.is_none());
        assert!(aligned.text.contains(fence));

        let mismatched = reconstruct(DisplayMode::Folded, &original, Some("소개\n중간\n결말"));
        assert!(mismatched.text.contains(fence));
        assert_eq!(
            mismatched.warning,
            Some(ReconstructionWarning::ParagraphMismatch { original: 2, translated: 3 })
        );
    }

    #[test]
    fn block_only_original_is_restored_in_place() {
        let original = "<think>\nplanning\n</think>";
        let r = reconstruct(DisplayMode::Unfolded, original, Some("생각"));
        assert_eq!(r.text, original);
        assert!(r.warning.is_none());
    }

    #[test]
    fn inline_block_follows_its_line() {
        let r = reconstruct(
            DisplayMode::Unfolded,
            "Hi <thinking>x</thinking>\nBye",
            Some("안녕\n잘가"),
        );
        let lines: Vec<&str> = r.text.split('\n').collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains(">Hi<"));
        assert_eq!(lines[1], "<thinking>x</thinking>");
    }

    #[test]
    fn line_breaks_are_normalized() {
        let r = reconstruct(DisplayMode::Unfolded, "One<br>Two", Some("하나<BR />둘"));
        assert!(r.warning.is_none());
        assert_eq!(r.text.split('\n').count(), 2);
    }

    #[test]
    fn backtick_correction() {
        assert_eq!(fix_backticks("a ` b ` c `"), "a ` b ` c ``");
        assert_eq!(fix_backticks("use `x` here"), "use `x` here");
        assert_eq!(fix_backticks("```code"), "`code`");
    }

    #[test]
    fn translated_fragment_gets_balanced_backticks() {
        let r = reconstruct(DisplayMode::Unfolded, "Run it", Some("`run` it `now"));
        assert!(r.text.contains("`run` it `now`"));
    }

    #[test]
    fn private_use_characters_in_original_are_kept() {
        let original = "icon \u{E000}0\u{E001} here\n<think>t</think>";
        let r = reconstruct(DisplayMode::Unfolded, original, Some("아이콘"));
        assert!(r.warning.is_none());
        assert!(r.text.contains("<span class=\"original_text mode-unfolded\">icon \u{E000}0\u{E001} here</span>"));
        assert!(r.text.ends_with("\n<think>t</think>"));
    }

    #[test]
    fn exhausted_placeholder_range_degrades_to_translation_only() {
        let original: String = SENTINEL_RANGE.filter_map(char::from_u32).collect();
        let r = reconstruct(DisplayMode::Folded, &original, Some("x ` y"));
        assert_eq!(r.text, "x ` y`");
        assert!(matches!(r.warning, Some(ReconstructionWarning::Degraded(_))));
    }

    #[test]
    fn tokenizer_prefers_earliest_block() {
        let text = "```\n<think>inside</think>\n```\n<think>after</think>";
        let segments = tokenize(text);
        assert_eq!(
            segments,
            vec![
                Segment::Block(BlockKind::CodeFence, "```\n<think>inside</think>\n```"),
                Segment::Literal("\n"),
                Segment::Block(BlockKind::Think, "<think>after</think>"),
            ]
        );
    }

    #[test]
    fn nested_details_are_one_block() {
        let text = "<details><summary>s</summary><details>inner</details>tail</details> rest";
        let segments = tokenize(text);
        assert_eq!(
            segments[0],
            Segment::Block(
                BlockKind::Details,
                "<details><summary>s</summary><details>inner</details>tail</details>"
            )
        );
        assert_eq!(segments[1], Segment::Literal(" rest"));
    }

    #[test]
    fn unclosed_fence_is_plain_text() {
        let segments = tokenize("```not closed");
        assert_eq!(segments, vec![Segment::Literal("```not closed")]);
    }
}

use once_cell::sync::Lazy;
use regex::Regex;

static TRAILING_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+\n").expect("valid trailing space regex"));
static BLANK_LINES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank lines regex"));
static INLINE_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("valid inline space regex"));
static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[a-zA-Z]*\n?|\n?```$").expect("valid code fence regex"));

/// Cleans model OCR output: drops a wrapping code fence, squeezes runs of
/// spaces and keeps at most one empty line between paragraphs.
pub fn normalize_ocr_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = CODE_FENCE_RE.replace_all(text.trim(), "");
    let text = TRAILING_SPACE_RE.replace_all(&text, "\n");
    let text = INLINE_SPACE_RE.replace_all(&text, " ");
    let text = BLANK_LINES_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Splits a reply into chunks of at most `max_chars` characters, cutting at
/// the last newline inside a chunk when there is one.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        if rest.chars().count() <= max_chars {
            chunks.push(rest.to_string());
            break;
        }

        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        let window = &rest[..limit];
        let cut = match window.rfind('\n') {
            Some(index) if index > 0 => index,
            _ => limit,
        };

        let chunk = rest[..cut].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = rest[cut..].trim_start();
    }

    chunks
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let mut iter = text.chars();
    let truncated: String = iter.by_ref().take(max_chars).collect();
    if iter.next().is_some() {
        format!("{truncated}...")
    } else {
        truncated
    }
}

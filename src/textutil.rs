// src/textutil.rs
// Small shared helpers: chunking, jitter, log redaction, timestamps.

use once_cell::sync::OnceCell;
use rand::Rng;
use regex::Regex;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Uniform random delay in `min_ms..=max_ms`. Degenerate ranges return `min_ms`.
pub fn jitter_ms(min_ms: u64, max_ms: u64) -> u64 {
    if max_ms <= min_ms {
        return min_ms;
    }
    rand::rng().random_range(min_ms..=max_ms)
}

/// Redact a secret for logging: keep 3 head / 2 tail characters.
pub fn sanitize_for_log(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.chars().count() <= 6 {
        return "***".to_string();
    }
    let head: String = value.chars().take(3).collect();
    let tail: String = value.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{head}***{tail}")
}

/// First `$TICKER` mention in a text, uppercased.
pub fn extract_first_ticker(text: &str) -> Option<String> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9]{1,9})").unwrap());
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}

/// Split cast text into chunks of at most `max_len` characters.
///
/// Prefers blank-line paragraph boundaries and packs adjacent paragraphs into
/// one chunk while they fit. A paragraph longer than `max_len` is broken at
/// the last whitespace at or before the limit; only a single over-long word
/// forces a hard split. Always produces at least one chunk.
pub fn split_cast_text(text: &str, max_len: usize) -> Vec<String> {
    let normalized = text.trim();
    if normalized.chars().count() <= max_len {
        return vec![normalized.to_string()];
    }

    let mut parts: Vec<String> = Vec::new();
    let paragraphs: Vec<&str> = split_paragraphs(normalized);
    let mut current = String::new();

    for paragraph in paragraphs {
        if current.is_empty() {
            if paragraph.chars().count() <= max_len {
                current = paragraph.to_string();
                continue;
            }
            current = split_long_paragraph(paragraph, max_len, &mut parts);
            continue;
        }

        let candidate = format!("{current}\n\n{paragraph}");
        if candidate.chars().count() <= max_len {
            current = candidate;
            continue;
        }

        push_trimmed(&mut parts, &current);
        current.clear();
        if paragraph.chars().count() <= max_len {
            current = paragraph.to_string();
        } else {
            current = split_long_paragraph(paragraph, max_len, &mut parts);
        }
    }

    push_trimmed(&mut parts, &current);
    if parts.is_empty() {
        parts.push(normalized.chars().take(max_len).collect());
    }
    parts
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap());
    re.split(text).map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn push_trimmed(parts: &mut Vec<String>, value: &str) {
    let trimmed = value.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
}

/// Greedily emit `max_len`-bounded slices of `paragraph` into `parts`,
/// returning the remainder that still fits in one chunk.
fn split_long_paragraph(paragraph: &str, max_len: usize, parts: &mut Vec<String>) -> String {
    let mut rest: Vec<char> = paragraph.chars().collect();
    while rest.len() > max_len {
        let window = &rest[..=max_len];
        let split_at = window
            .iter()
            .rposition(|c| c.is_whitespace())
            .unwrap_or(max_len);
        let head: String = rest[..split_at].iter().collect();
        push_trimmed(parts, &head);
        let tail: String = rest[split_at..].iter().collect();
        rest = tail.trim().chars().collect();
    }
    rest.into_iter().collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_cast_text("  hello world  ", 300), vec!["hello world"]);
    }

    #[test]
    fn splits_on_paragraph_boundaries_first() {
        let text = "first paragraph here\n\nsecond paragraph here";
        let chunks = split_cast_text(text, 25);
        assert_eq!(chunks, vec!["first paragraph here", "second paragraph here"]);
    }

    #[test]
    fn packs_paragraphs_while_they_fit() {
        let text = "aa\n\nbb\n\nlong tail paragraph that will not fit with the rest";
        let chunks = split_cast_text(text, 10);
        assert_eq!(chunks[0], "aa\n\nbb");
    }

    #[test]
    fn long_run_splits_at_whitespace_and_reconstructs() {
        let word = "word";
        let text = std::iter::repeat(word).take(400).collect::<Vec<_>>().join(" ");
        assert_eq!(text.len(), 1999);
        let chunks = split_cast_text(&text, 300);
        assert_eq!(chunks.len(), 7);
        for c in &chunks {
            assert!(c.chars().count() <= 300, "chunk too long: {}", c.len());
            assert!(!c.starts_with(' ') && !c.ends_with(' '));
        }
        let rejoined = chunks.join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn oversized_word_forces_hard_split() {
        let text = "x".repeat(700);
        let chunks = split_cast_text(&text, 300);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 300);
        assert_eq!(chunks[2].len(), 100);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..50 {
            let v = jitter_ms(100, 200);
            assert!((100..=200).contains(&v));
        }
        assert_eq!(jitter_ms(200, 100), 200);
    }

    #[test]
    fn sanitize_keeps_head_and_tail_only() {
        assert_eq!(sanitize_for_log(""), "");
        assert_eq!(sanitize_for_log("abc123"), "***");
        assert_eq!(sanitize_for_log("neynar-key-9f2"), "ney***f2");
    }

    #[test]
    fn ticker_extraction() {
        assert_eq!(extract_first_ticker("watching $sol and $BTC"), Some("SOL".into()));
        assert_eq!(extract_first_ticker("no tickers here"), None);
    }
}

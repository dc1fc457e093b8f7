//! Text cleanup for speech input, speech output and logs

use std::sync::LazyLock;

use regex::Regex;

/// Default cap on text sent to the synthesizer
pub const TTS_MAX_CHARS: usize = 1200;

/// Default cap on text written to logs
pub const LOG_MAX_CHARS: usize = 4000;

const ROLE_WORDS: &str = "system|assistant|user|tool|developer|function";

static FENCED_ROLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?is)```\s*(?:{ROLE_WORDS})\b.*?```")).expect("valid regex")
});

static ROLE_ONLY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?mi)^[ \t]*(?:{ROLE_WORDS})[ \t]*$")).expect("valid regex")
});

static ROLE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?mi)^[ \t]*(?:{ROLE_WORDS})[ \t]*:[ \t]*")).expect("valid regex")
});

static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[<>{}]").expect("valid regex"));

static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid regex"));

static FILLERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:um+|uh+|like|you know|hmm+|erm+|ah+)\b").expect("valid regex")
});

/// Remove role wrappers some model outputs include
///
/// Drops fenced blocks labelled with a role, bare role lines and
/// `role:` prefixes.
#[must_use]
pub fn strip_role_blocks(text: &str) -> String {
    let s = FENCED_ROLE.replace_all(text, "");
    let s = ROLE_ONLY_LINE.replace_all(&s, "");
    let s = ROLE_PREFIX.replace_all(&s, "");
    let s = BLANK_RUN.replace_all(&s, "\n\n");
    s.trim().to_string()
}

fn unescape_entities(text: &str) -> String {
    let s = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures<'_>| {
        let raw = &caps[1];
        let code = raw
            .strip_prefix('x')
            .map_or_else(|| raw.parse().ok(), |hex| u32::from_str_radix(hex, 16).ok());
        code.and_then(char::from_u32)
            .map_or_else(|| caps[0].to_string(), String::from)
    });
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Collapse whitespace runs to single spaces
#[must_use]
pub fn collapse_ws(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Make text safe for the synthesizer
///
/// Strips role wrappers, unescapes HTML entities, removes characters that
/// look like markup, collapses whitespace and caps the length on a word
/// boundary.
#[must_use]
pub fn tts_sanitize(text: &str, max_chars: usize) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let s = strip_role_blocks(text);
    let s = unescape_entities(&s).replace('\r', "");
    let s = MARKUP.replace_all(&s, "");
    let s = collapse_ws(&s);

    if s.chars().count() <= max_chars {
        return s;
    }

    let cut: String = s.chars().take(max_chars).collect();
    let trimmed = match cut.rfind(' ') {
        Some(space) if cut[..space].chars().count() > 50 => &cut[..space],
        _ => cut.as_str(),
    };
    format!("{}...", trimmed.trim_end())
}

/// Remove filler words from a transcript
#[must_use]
pub fn clean_stt_text(text: &str) -> String {
    collapse_ws(&FILLERS.replace_all(text.trim(), ""))
}

/// Safer string for log files
#[must_use]
pub fn sanitize_for_log(text: &str, max_chars: usize) -> String {
    let s = strip_role_blocks(text);
    if s.chars().count() <= max_chars {
        return s;
    }
    let mut cut: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

//! Per-framework grammars. Each returns `None` when the output does not
//! look like its framework, letting the parser fall back.

pub mod cargo;
pub mod generic;
pub mod go;
pub mod jest;
pub mod pytest;

use std::sync::LazyLock;

use regex::Regex;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ANSI_RE regex should compile"));

pub(crate) fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Split a failure text into its first non-empty line and the remainder.
pub(crate) fn split_message(text: &str) -> (String, Option<String>) {
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty());
    let first = lines.next().map(|l| l.trim().to_string()).unwrap_or_default();
    let rest = lines.collect::<Vec<_>>().join("\n");
    let rest = if rest.trim().is_empty() { None } else { Some(rest) };
    (first, rest)
}

pub(crate) fn parse_count(text: &str) -> u32 {
    text.parse().unwrap_or(0)
}

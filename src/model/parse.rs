//! `<think>…</think><answer>…</answer>` envelope extraction (spec §4.4).
//!
//! Stray text around the envelope is discarded rather than rejected, and
//! smart quotes/NBSP/BOM noise is normalized before parsing, since model
//! output reliably contains exactly this kind of incidental noise.

use crate::errors::AgentError;
use regex::Regex;
use std::sync::OnceLock;

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("valid regex"))
}

fn answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<answer>(.*?)</answer>").expect("valid regex"))
}

/// Normalizes smart quotes, em/en dashes, NBSP, and BOM noise a model may
/// emit around its structured output.
pub fn sanitize_model_text(text: &str) -> String {
    text.replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'")
        .replace('\u{00ab}', "\"")
        .replace('\u{00bb}', "\"")
        .replace('\u{2014}', "-")
        .replace('\u{2013}', "-")
        .replace('\u{00a0}', " ")
        .replace('\u{feff}', "")
}

/// Extracts `(thought, actionText)`. A missing `<think>` block yields an
/// empty thought; a missing `<answer>` block is `MalformedResponse`.
pub fn extract_think_answer(raw: &str) -> Result<(String, String), AgentError> {
    let cleaned = sanitize_model_text(raw);

    let thought = think_re()
        .captures(&cleaned)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();

    let action_text = answer_re()
        .captures(&cleaned)
        .map(|c| c[1].trim().to_string())
        .ok_or_else(|| AgentError::MalformedResponse("missing <answer> block".into()))?;

    if action_text.is_empty() {
        return Err(AgentError::MalformedResponse("empty <answer> block".into()));
    }

    Ok((thought, action_text))
}

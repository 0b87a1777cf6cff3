//! Transcript extraction and sentence splitting.
//!
//! Upstream payloads nest transcript text in a handful of known shapes.
//! The extractor tries the canonical `serverContent.outputTranscription`
//! path first, then falls back to a bounded, cycle-safe walk that scores
//! every candidate string and keeps the most sentence-like one.

use serde_json::Value;
use smallvec::SmallVec;
use std::collections::HashSet;

/// Characters that terminate a sentence.
const TERMINALS: &[char] = &['。', '．', '.', '？', '?', '！', '!', '…'];

/// Keys whose string values are transcript candidates.
const TEXT_VALUE_KEYS: &[&str] = &[
    "text",
    "transcript",
    "outputText",
    "output_text",
    "displayText",
    "display_text",
    "caption",
];

/// Keys recursed into while walking for candidates.
const TEXT_CONTAINER_KEYS: &[&str] = &[
    "serverContent",
    "server_content",
    "outputTranscription",
    "output_transcription",
    "modelTurn",
    "model_turn",
    "parts",
    "content",
    "contents",
    "candidates",
    "outputs",
    "response",
    "result",
    "delta",
    "message",
    "turns",
];

const MAX_WALK_DEPTH: usize = 12;

pub fn is_terminal(c: char) -> bool {
    TERMINALS.contains(&c)
}

fn contains_cjk(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(c,
            '\u{3040}'..='\u{30ff}' // hiragana, katakana
            | '\u{3400}'..='\u{9fff}' // CJK ideographs
            | '\u{f900}'..='\u{faff}'
            | '\u{ff66}'..='\u{ff9d}' // halfwidth kana
        )
    })
}

/// Score a candidate: length, +10 for a terminal ending, +2 for whitespace,
/// +1 for CJK content.
pub fn score_candidate(s: &str) -> i64 {
    let mut score = s.chars().count() as i64;
    if s.chars().last().map(is_terminal).unwrap_or(false) {
        score += 10;
    }
    if s.chars().any(char::is_whitespace) {
        score += 2;
    }
    if contains_cjk(s) {
        score += 1;
    }
    score
}

/// A scored candidate, exposed for diagnostics via [`inspect`].
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub score: i64,
}

/// Extract the best transcript string from a payload, if any.
pub fn extract_transcript(payload: &Value) -> Option<String> {
    if let Some(text) = direct_transcription(payload) {
        return Some(text.to_string());
    }
    let candidates = collect_candidates(payload);
    candidates
        .into_iter()
        .max_by(|a, b| {
            a.score
                .cmp(&b.score)
                .then(a.text.chars().count().cmp(&b.text.chars().count()))
        })
        .map(|c| c.text)
}

/// Candidate summaries for diagnostics, highest score first.
pub fn inspect(payload: &Value) -> Vec<Candidate> {
    let mut candidates = collect_candidates(payload);
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    candidates
}

fn direct_transcription(payload: &Value) -> Option<&str> {
    for content_key in ["serverContent", "server_content"] {
        for transcription_key in ["outputTranscription", "output_transcription"] {
            if let Some(text) = payload
                .get(content_key)
                .and_then(|c| c.get(transcription_key))
                .and_then(|t| t.get("text"))
                .and_then(Value::as_str)
            {
                return Some(text);
            }
        }
    }
    None
}

fn collect_candidates(payload: &Value) -> Vec<Candidate> {
    let mut seen_nodes: HashSet<usize> = HashSet::new();
    let mut seen_texts: HashSet<String> = HashSet::new();
    let mut out: Vec<Candidate> = Vec::new();
    walk(payload, 0, &mut seen_nodes, &mut seen_texts, &mut out);
    out
}

fn walk(
    node: &Value,
    depth: usize,
    seen_nodes: &mut HashSet<usize>,
    seen_texts: &mut HashSet<String>,
    out: &mut Vec<Candidate>,
) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    if !seen_nodes.insert(node as *const Value as usize) {
        return;
    }
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                if TEXT_VALUE_KEYS.contains(&key.as_str()) {
                    if let Some(s) = value.as_str() {
                        let trimmed = s.trim();
                        if !trimmed.is_empty() && seen_texts.insert(trimmed.to_string()) {
                            out.push(Candidate {
                                text: s.to_string(),
                                score: score_candidate(s),
                            });
                        }
                    }
                }
                if TEXT_CONTAINER_KEYS.contains(&key.as_str()) {
                    walk(value, depth + 1, seen_nodes, seen_texts, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, depth + 1, seen_nodes, seen_texts, out);
            }
        }
        _ => {}
    }
}

/// Split a transcript into complete sentences and a trailing partial.
///
/// Complete sentences are trimmed; whitespace-only sentences are skipped.
/// The partial keeps its raw form so callers can measure growth exactly.
pub fn split_sentences(text: &str) -> (Vec<String>, String) {
    let mut complete: Vec<String> = Vec::new();
    let mut buf = String::new();
    for c in text.chars() {
        buf.push(c);
        if is_terminal(c) {
            let sentence = buf.trim();
            if !sentence.is_empty() {
                complete.push(sentence.to_string());
            }
            buf.clear();
        }
    }
    (complete, buf)
}

/// Whether the payload signals that generation of the current turn is done.
pub fn is_generation_complete(payload: &Value) -> bool {
    let complete_at = |node: &Value| {
        for key in [
            "generationComplete",
            "generation_complete",
            "turnComplete",
            "turn_complete",
        ] {
            if node.get(key).and_then(Value::as_bool) == Some(true) {
                return true;
            }
        }
        false
    };
    if complete_at(payload) {
        return true;
    }
    for content_key in ["serverContent", "server_content"] {
        if let Some(content) = payload.get(content_key) {
            if complete_at(content) {
                return true;
            }
        }
    }
    let events: SmallVec<[&Value; 2]> = ["event", "type"]
        .iter()
        .filter_map(|k| payload.get(*k))
        .collect();
    events.iter().any(|v| {
        v.as_str()
            .map(|s| {
                let s = s.to_ascii_lowercase();
                s == "finish" || s == "completed" || s == "turncomplete"
            })
            .unwrap_or(false)
    })
}

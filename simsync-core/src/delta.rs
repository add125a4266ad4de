//! Text delta codec.
//!
//! Deltas use the diff-match-patch delta encoding shared with the server:
//! tab-separated tokens where `=N` keeps the next N characters of the base
//! text, `-N` drops the next N characters and `+text` inserts URI-encoded
//! text. Counts are in Unicode scalar values, and a delta must consume the
//! whole base text.

use similar::{capture_diff_slices, Algorithm, DiffOp};
use thiserror::Error;

/// Errors raised while decoding or applying a delta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("invalid delta operation in token '{0}'")]
    InvalidToken(String),

    #[error("invalid count in delta token '{0}'")]
    InvalidCount(String),

    #[error("insert text is not valid UTF-8 once decoded: '{0}'")]
    InvalidEscape(String),

    #[error("delta covers {consumed} characters but the base text has {base}")]
    LengthMismatch { consumed: usize, base: usize },
}

/// One span of a two-string diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    Equal(String),
    Delete(String),
    Insert(String),
}

impl Diff {
    pub fn text(&self) -> &str {
        match self {
            Diff::Equal(text) | Diff::Delete(text) | Diff::Insert(text) => text,
        }
    }
}

/// Converts between string pairs and delta strings.
///
/// The entity store only needs `apply`; change producers use `delta`.
pub trait DeltaCodec: Send + Sync {
    /// Reconstructs the new text from `base` and a delta computed against it.
    fn apply(&self, base: &str, delta: &str) -> Result<String, DeltaError>;

    /// Computes the delta that turns `old` into `new`.
    fn delta(&self, old: &str, new: &str) -> String;
}

/// The diff-match-patch compatible codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffMatchPatch;

impl DeltaCodec for DiffMatchPatch {
    fn apply(&self, base: &str, delta: &str) -> Result<String, DeltaError> {
        let diffs = diff_from_delta(base, delta)?;
        Ok(target_text(&diffs))
    }

    fn delta(&self, old: &str, new: &str) -> String {
        diff_to_delta(&diff_main(old, new))
    }
}

/// Expands a delta against its base text into a full diff.
pub fn diff_from_delta(base: &str, delta: &str) -> Result<Vec<Diff>, DeltaError> {
    let chars: Vec<char> = base.chars().collect();
    let mut pointer = 0usize;
    let mut diffs = Vec::new();

    for token in delta.split('\t') {
        // Blank tokens come from a trailing tab.
        let Some(op) = token.chars().next() else {
            continue;
        };
        let param = &token[op.len_utf8()..];

        match op {
            '+' => {
                let text = urlencoding::decode(param)
                    .map_err(|_| DeltaError::InvalidEscape(param.to_string()))?;
                diffs.push(Diff::Insert(text.into_owned()));
            }
            '-' | '=' => {
                let count = parse_count(param)
                    .ok_or_else(|| DeltaError::InvalidCount(token.to_string()))?;
                let end = match pointer.checked_add(count) {
                    Some(end) if end <= chars.len() => end,
                    _ => {
                        return Err(DeltaError::LengthMismatch {
                            consumed: pointer.saturating_add(count),
                            base: chars.len(),
                        })
                    }
                };
                let text: String = chars[pointer..end].iter().collect();
                pointer = end;
                if op == '=' {
                    diffs.push(Diff::Equal(text));
                } else {
                    diffs.push(Diff::Delete(text));
                }
            }
            _ => return Err(DeltaError::InvalidToken(token.to_string())),
        }
    }

    if pointer != chars.len() {
        return Err(DeltaError::LengthMismatch {
            consumed: pointer,
            base: chars.len(),
        });
    }

    Ok(diffs)
}

/// Encodes a diff as a delta string.
pub fn diff_to_delta(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .map(|diff| match diff {
            Diff::Insert(text) => format!("+{}", encode_insert(text)),
            Diff::Delete(text) => format!("-{}", text.chars().count()),
            Diff::Equal(text) => format!("={}", text.chars().count()),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

/// Computes a character-level diff between two strings.
pub fn diff_main(old: &str, new: &str) -> Vec<Diff> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut diffs = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, &old_chars, &new_chars) {
        match op {
            DiffOp::Equal { old_index, len, .. } => {
                push_merged(&mut diffs, Diff::Equal(collect(&old_chars, old_index, len)));
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                push_merged(
                    &mut diffs,
                    Diff::Delete(collect(&old_chars, old_index, old_len)),
                );
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                push_merged(
                    &mut diffs,
                    Diff::Insert(collect(&new_chars, new_index, new_len)),
                );
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                push_merged(
                    &mut diffs,
                    Diff::Delete(collect(&old_chars, old_index, old_len)),
                );
                push_merged(
                    &mut diffs,
                    Diff::Insert(collect(&new_chars, new_index, new_len)),
                );
            }
        }
    }
    diffs
}

/// The text a diff produces (its equal and inserted spans).
pub fn target_text(diffs: &[Diff]) -> String {
    let mut out = String::new();
    for diff in diffs {
        match diff {
            Diff::Equal(text) | Diff::Insert(text) => out.push_str(text),
            Diff::Delete(_) => {}
        }
    }
    out
}

/// Counts are plain decimal digits; `str::parse` would also take a sign.
fn parse_count(param: &str) -> Option<usize> {
    if param.is_empty() || !param.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    param.parse().ok()
}

fn collect(chars: &[char], start: usize, len: usize) -> String {
    chars[start..start + len].iter().collect()
}

fn push_merged(diffs: &mut Vec<Diff>, next: Diff) {
    if let Some(prev) = diffs.last_mut() {
        match (prev, &next) {
            (Diff::Equal(prev), Diff::Equal(text))
            | (Diff::Delete(prev), Diff::Delete(text))
            | (Diff::Insert(prev), Diff::Insert(text)) => {
                prev.push_str(text);
                return;
            }
            _ => {}
        }
    }
    if !next.text().is_empty() {
        diffs.push(next);
    }
}

/// URI-encodes insert text the way diff-match-patch does: reserved
/// punctuation and spaces stay literal.
fn encode_insert(text: &str) -> String {
    const KEEP: [(&str, &str); 18] = [
        ("%20", " "),
        ("%21", "!"),
        ("%7E", "~"),
        ("%27", "'"),
        ("%28", "("),
        ("%29", ")"),
        ("%3B", ";"),
        ("%2F", "/"),
        ("%3F", "?"),
        ("%3A", ":"),
        ("%40", "@"),
        ("%26", "&"),
        ("%3D", "="),
        ("%2B", "+"),
        ("%24", "$"),
        ("%2C", ","),
        ("%23", "#"),
        ("%2A", "*"),
    ];

    let mut encoded = urlencoding::encode(text).into_owned();
    for (escaped, literal) in KEEP {
        encoded = encoded.replace(escaped, literal);
    }
    encoded
}

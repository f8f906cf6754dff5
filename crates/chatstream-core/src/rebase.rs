//! Maps a character range from one version of a text onto another.
//!
//! The two texts are aligned with a Myers diff over chars. A range survives
//! only if it lies entirely inside one unchanged run; anything touched by an
//! edit, or an insertion point with two possible targets, is a conflict.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp};

// Past this the diff degrades to a coarser (still valid) alignment, which can
// only turn a rebase into a conflict.
const DIFF_DEADLINE: Duration = Duration::from_millis(100);

/// Half-open range of char offsets, `start..end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overlap test. An empty range (insertion point) overlaps any range that
    /// contains or touches its position.
    pub fn overlaps(&self, other: &TextRange) -> bool {
        if self.is_empty() || other.is_empty() {
            return self.start <= other.end && other.start <= self.end;
        }
        self.start < other.end && other.start < self.end
    }
}

/// Unchanged run: `a[a_start..a_start+len] == b[b_start..b_start+len]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Run {
    a_start: usize,
    b_start: usize,
    len: usize,
}

/// Maps `range` (char offsets into `from`) onto `to`. Returns `None` when the
/// range content was edited, the position is ambiguous, or the texts differ by
/// more than `max_distance` char edits.
pub fn rebase_range(from: &str, to: &str, range: TextRange, max_distance: usize) -> Option<TextRange> {
    if from == to {
        return Some(range);
    }
    let a: Vec<char> = from.chars().collect();
    let b: Vec<char> = to.chars().collect();
    if range.start > range.end || range.end > a.len() {
        return None;
    }
    let runs = align(&a, &b, max_distance)?;

    if range.is_empty() {
        let point = range.start;
        let mut target: Option<usize> = None;
        for run in runs.iter().filter(|r| r.len > 0) {
            if run.a_start <= point && point <= run.a_start + run.len {
                let mapped = run.b_start + (point - run.a_start);
                match target {
                    Some(existing) if existing != mapped => return None,
                    _ => target = Some(mapped),
                }
            }
        }
        return target.map(|p| TextRange::new(p, p));
    }

    runs.iter()
        .find(|run| run.a_start <= range.start && range.end <= run.a_start + run.len)
        .map(|run| {
            let start = run.b_start + (range.start - run.a_start);
            TextRange::new(start, start + range.len())
        })
}

/// Replaces `range` (char offsets) of `text` with `replacement`.
pub fn splice(text: &str, range: TextRange, replacement: &str) -> String {
    let start = byte_offset(text, range.start);
    let end = byte_offset(text, range.end);
    let mut out = String::with_capacity(text.len() - (end - start) + replacement.len());
    out.push_str(&text[..start]);
    out.push_str(replacement);
    out.push_str(&text[end..]);
    out
}

/// Text covered by `range` (char offsets).
pub fn slice(text: &str, range: TextRange) -> &str {
    &text[byte_offset(text, range.start)..byte_offset(text, range.end)]
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

fn align(a: &[char], b: &[char], max_distance: usize) -> Option<Vec<Run>> {
    if a.len().abs_diff(b.len()) > max_distance {
        return None;
    }
    let ops = similar::capture_diff_slices_deadline(
        Algorithm::Myers,
        a,
        b,
        Some(Instant::now() + DIFF_DEADLINE),
    );
    let mut distance = 0usize;
    let mut runs = Vec::new();
    for op in ops {
        match op {
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => runs.push(Run {
                a_start: old_index,
                b_start: new_index,
                len,
            }),
            DiffOp::Delete { old_len, .. } => distance += old_len,
            DiffOp::Insert { new_len, .. } => distance += new_len,
            DiffOp::Replace {
                old_len, new_len, ..
            } => distance += old_len + new_len,
        }
        if distance > max_distance {
            return None;
        }
    }
    Some(runs)
}

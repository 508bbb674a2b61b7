//! Splits a raw token stream into answer text and marked-up reasoning.
//!
//! Models that deliberate in the open wrap their thinking in a
//! `<think>...</think>` pair inline with the answer tokens. The extractor
//! routes the enclosed content to reasoning segments and everything else to
//! text segments, holding back partial markers that straddle chunk
//! boundaries so a split marker is never leaked as answer text.

const OPEN_MARKER: &str = "<think>";
const CLOSE_MARKER: &str = "</think>";

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Reasoning(String),
}

/// Incremental marker-pair extractor. Feed raw deltas with [`push`],
/// then call [`finish`] exactly once when the model stream ends.
///
/// [`push`]: ReasoningExtractor::push
/// [`finish`]: ReasoningExtractor::finish
#[derive(Debug, Default)]
pub struct ReasoningExtractor {
    /// Held-back input: either a potential partial marker (outside) or
    /// unscanned reasoning bytes (inside).
    pending: String,
    /// Accumulated reasoning content, emitted whole at the closing marker.
    reasoning: String,
    inside: bool,
}

impl ReasoningExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one raw delta, returning any segments it completes. Reasoning
    /// is buffered until its closing marker so a truncated stream can still
    /// reclassify it.
    pub fn push(&mut self, delta: &str) -> Vec<Segment> {
        self.pending.push_str(delta);
        let mut out = Vec::new();
        loop {
            if self.inside {
                if let Some(at) = self.pending.find(CLOSE_MARKER) {
                    self.reasoning.push_str(&self.pending[..at]);
                    self.pending.drain(..at + CLOSE_MARKER.len());
                    self.inside = false;
                    let reasoning = std::mem::take(&mut self.reasoning);
                    if !reasoning.is_empty() {
                        out.push(Segment::Reasoning(reasoning));
                    }
                } else {
                    let keep = partial_marker_len(&self.pending, CLOSE_MARKER);
                    let scanned = self.pending.len() - keep;
                    self.reasoning.push_str(&self.pending[..scanned]);
                    self.pending.drain(..scanned);
                    break;
                }
            } else if let Some(at) = self.pending.find(OPEN_MARKER) {
                if at > 0 {
                    out.push(Segment::Text(self.pending[..at].to_string()));
                }
                self.pending.drain(..at + OPEN_MARKER.len());
                self.inside = true;
            } else {
                let keep = partial_marker_len(&self.pending, OPEN_MARKER);
                let emit = self.pending.len() - keep;
                if emit > 0 {
                    let text: String = self.pending.drain(..emit).collect();
                    out.push(Segment::Text(text));
                }
                break;
            }
        }
        out
    }

    /// Flush at end of stream. An unterminated marker means the content was
    /// never really reasoning; it is demoted to answer text rather than
    /// dropped.
    pub fn finish(mut self) -> Vec<Segment> {
        let mut tail = std::mem::take(&mut self.reasoning);
        tail.push_str(&self.pending);
        if tail.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Text(tail)]
        }
    }
}

/// Length of the longest proper marker prefix this input ends with. That
/// suffix may become a full marker once more input arrives, so it must be
/// held back.
fn partial_marker_len(input: &str, marker: &str) -> usize {
    let max = marker.len().min(input.len() + 1).saturating_sub(1);
    (1..=max)
        .rev()
        .find(|&k| input.ends_with(&marker[..k]))
        .unwrap_or(0)
}

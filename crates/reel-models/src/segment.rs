//! Text segmentation.
//!
//! Long narration text is split into sentence-aligned segments sized for one
//! speech/video synthesis call each. All lengths are counted in characters
//! (Unicode scalar values), never bytes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speech rate used for duration estimates.
pub const CHARS_PER_SECOND: f64 = 3.5;

const SENTENCE_TERMINALS: &[char] = &['。', '！', '？', '；', '…', '.', '!', '?', ';'];
const CLOSING_MARKS: &[char] = &['"', '\'', '”', '’', '」', '』', '）', ')', ']'];

/// Segmentation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("text is empty")]
    EmptyText,
}

pub type SegmentResult<T> = Result<T, SegmentError>;

/// Named bound profile controlling segment size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationStrategy {
    Short,
    Medium,
    Long,
    #[default]
    Auto,
}

/// Length bounds for a strategy, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBounds {
    pub min: u32,
    pub ideal: u32,
    pub max: u32,
}

impl SegmentBounds {
    /// Hard ceiling a segment may reach when absorbing one more sentence
    /// brings it closer to `ideal`.
    pub fn overflow_limit(&self) -> u32 {
        self.max * 11 / 10
    }
}

impl SegmentationStrategy {
    /// Resolve `Auto` against the total text length. Concrete strategies are returned as-is.
    pub fn resolve(self, total_chars: u32) -> Self {
        match self {
            Self::Auto if total_chars <= 150 => Self::Short,
            Self::Auto if total_chars <= 300 => Self::Medium,
            Self::Auto => Self::Long,
            other => other,
        }
    }

    /// Bounds for this strategy. `Auto` reports the `Medium` bounds; resolve it first.
    pub fn bounds(self) -> SegmentBounds {
        match self {
            Self::Short => SegmentBounds { min: 50, ideal: 100, max: 150 },
            Self::Medium | Self::Auto => SegmentBounds { min: 100, ideal: 200, max: 300 },
            Self::Long => SegmentBounds { min: 200, ideal: 400, max: 600 },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::Auto => "auto",
        }
    }
}

impl std::fmt::Display for SegmentationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SegmentationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "short" => Ok(Self::Short),
            "medium" => Ok(Self::Medium),
            "long" => Ok(Self::Long),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown segmentation strategy: {other}")),
        }
    }
}

/// One bounded slice of the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Segment {
    pub index: u32,
    /// Character offset into the trimmed source text.
    pub offset: u32,
    /// Exact slice of the trimmed source.
    pub text: String,
    pub char_count: u32,
    pub estimated_duration_sec: u32,
}

impl Segment {
    fn new(index: u32, offset: u32, text: &str) -> Self {
        let char_count = char_len(text);
        Self {
            index,
            offset,
            text: text.to_string(),
            char_count,
            estimated_duration_sec: estimate_duration_secs(char_count),
        }
    }

    /// Text sent to speech synthesis.
    pub fn speech_text(&self) -> &str {
        self.text.trim()
    }
}

/// Output of [`segment`] and [`segment_at_offsets`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SegmentationResult {
    /// Resolved strategy (never `Auto`).
    pub strategy: SegmentationStrategy,
    pub needs_segmentation: bool,
    pub segments: Vec<Segment>,
    pub total_chars: u32,
    pub total_estimated_duration_sec: u32,
}

impl SegmentationResult {
    pub fn segment_count(&self) -> u32 {
        self.segments.len() as u32
    }
}

fn char_len(s: &str) -> u32 {
    s.chars().count() as u32
}

/// Estimated speech duration: `ceil(chars / 3.5)` in integer arithmetic.
pub fn estimate_duration_secs(chars: u32) -> u32 {
    ((2 * chars as u64 + 6) / 7) as u32
}

/// Concatenate segment texts in index order.
pub fn reconstruct(segments: &[Segment]) -> String {
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.index);
    ordered.iter().map(|s| s.text.as_str()).collect()
}

/// Split text into sentences. Concatenating the output yields the input.
///
/// A sentence ends at a terminal character; closing quotes/brackets and
/// repeated terminals directly after it stay with the same sentence. A
/// trailing fragment without a terminal is the final sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !SENTENCE_TERMINALS.contains(&c) {
            continue;
        }
        let mut end = text.len();
        while let Some(&(i, next)) = chars.peek() {
            if SENTENCE_TERMINALS.contains(&next) || CLOSING_MARKS.contains(&next) {
                chars.next();
            } else {
                end = i;
                break;
            }
        }
        sentences.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Split text into segments for the given strategy.
pub fn segment(text: &str, strategy: SegmentationStrategy) -> SegmentResult<SegmentationResult> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SegmentError::EmptyText);
    }

    let total_chars = char_len(text);
    let strategy = strategy.resolve(total_chars);
    let bounds = strategy.bounds();

    let segments = if total_chars <= bounds.max {
        vec![Segment::new(0, 0, text)]
    } else {
        pack(text, bounds)
    };

    Ok(build_result(strategy, segments, total_chars))
}

/// Split text exactly at the given character offsets (manual override).
///
/// Offsets are clamped to `[1, len - 1]`, sorted and deduplicated.
pub fn segment_at_offsets(text: &str, offsets: &[u32]) -> SegmentResult<SegmentationResult> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SegmentError::EmptyText);
    }

    let total_chars = char_len(text);
    let mut cuts: Vec<u32> = if total_chars < 2 {
        Vec::new()
    } else {
        offsets.iter().map(|&o| o.clamp(1, total_chars - 1)).collect()
    };
    cuts.sort_unstable();
    cuts.dedup();

    // char offset -> byte offset
    let byte_at: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut segments = Vec::with_capacity(cuts.len() + 1);
    let mut prev = 0u32;
    for cut in cuts.into_iter().chain(std::iter::once(total_chars)) {
        if cut > prev {
            let piece = &text[byte_at[prev as usize]..byte_at[cut as usize]];
            segments.push(Segment::new(segments.len() as u32, prev, piece));
        }
        prev = cut;
    }

    let strategy = SegmentationStrategy::Auto.resolve(total_chars);
    Ok(build_result(strategy, segments, total_chars))
}

fn build_result(
    strategy: SegmentationStrategy,
    segments: Vec<Segment>,
    total_chars: u32,
) -> SegmentationResult {
    SegmentationResult {
        strategy,
        needs_segmentation: segments.len() > 1,
        segments,
        total_chars,
        total_estimated_duration_sec: estimate_duration_secs(total_chars),
    }
}

/// Pending segment being accumulated: byte range plus char bookkeeping.
struct Pending {
    start: usize,
    end: usize,
    offset: u32,
    chars: u32,
}

/// Greedy sentence packing. A segment may close below `min` when the next
/// sentence does not fit within the overflow limit; it is not merged back.
fn pack(text: &str, bounds: SegmentBounds) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current: Option<Pending> = None;
    let mut byte_pos = 0usize;
    let mut char_pos = 0u32;

    let close = |p: Pending, segments: &mut Vec<Segment>| {
        let index = segments.len() as u32;
        segments.push(Segment::new(index, p.offset, &text[p.start..p.end]));
    };

    for sentence in split_sentences(text) {
        let len = char_len(sentence);
        let next = Pending {
            start: byte_pos,
            end: byte_pos + sentence.len(),
            offset: char_pos,
            chars: len,
        };
        byte_pos += sentence.len();
        char_pos += len;

        let Some(mut cur) = current.take() else {
            current = Some(next);
            continue;
        };

        let combined = cur.chars + len;
        let absorb = if cur.chars >= bounds.ideal {
            false
        } else if combined <= bounds.max {
            true
        } else {
            combined <= bounds.overflow_limit()
                && combined.abs_diff(bounds.ideal) < cur.chars.abs_diff(bounds.ideal)
        };

        if absorb {
            cur.end = next.end;
            cur.chars = combined;
            current = Some(cur);
        } else {
            close(cur, &mut segments);
            current = Some(next);
        }
    }

    if let Some(cur) = current {
        close(cur, &mut segments);
    }
    segments
}

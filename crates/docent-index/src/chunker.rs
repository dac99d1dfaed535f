//! Markdown-aware document splitting.
//!
//! Documents are cut at headings and blank-line paragraph breaks first
//! (ignoring anything inside fenced code blocks). Adjacent paragraphs of the
//! same section are packed together up to `max_chars`; a paragraph longer
//! than that is cut with a sliding window whose consecutive pieces share
//! `min_overlap_chars` characters. Lengths are counted in characters.

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::source_url::SourceUrls;
use crate::types::{Chunk, ChunkId, content_hash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub max_chars: usize,
    pub min_overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            min_overlap_chars: 200,
        }
    }
}

impl ChunkerConfig {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `max_chars` is zero or the overlap is not
    /// strictly smaller than `max_chars`.
    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(IndexError::InvalidConfig("max_chars must be positive".into()));
        }
        if self.min_overlap_chars >= self.max_chars {
            return Err(IndexError::InvalidConfig(format!(
                "min_overlap_chars ({}) must be smaller than max_chars ({})",
                self.min_overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    urls: SourceUrls,
}

/// Structural unit: a run of lines between two paragraph or section breaks.
#[derive(Debug)]
struct Unit {
    start: usize,
    end: usize,
    section: usize,
    heading: Option<String>,
}

struct Span {
    start: usize,
    end: usize,
    heading: Option<String>,
}

impl Chunker {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is inconsistent.
    pub fn new(config: ChunkerConfig, urls: SourceUrls) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, urls })
    }

    #[must_use]
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` (the content of the document at relative `path`) into chunks.
    ///
    /// Empty and whitespace-only documents yield no chunks.
    #[must_use]
    pub fn split(&self, path: &str, text: &str) -> Vec<Chunk> {
        self.pack(text, structural_units(text))
            .into_iter()
            .enumerate()
            .map(|(seq, span)| {
                let body = &text[span.start..span.end];
                let url = self.urls.section_url(path, span.heading.as_deref());
                Chunk {
                    id: ChunkId::derive(path, seq, body),
                    path: path.to_owned(),
                    seq,
                    text: body.to_owned(),
                    start: span.start,
                    end: span.end,
                    heading: span.heading,
                    url,
                    content_hash: content_hash(body),
                }
            })
            .collect()
    }

    fn pack(&self, text: &str, units: Vec<Unit>) -> Vec<Span> {
        let max = self.config.max_chars;
        let mut spans = Vec::new();
        // (span, section, char count)
        let mut current: Option<(Span, usize, usize)> = None;

        for unit in units {
            let len = text[unit.start..unit.end].chars().count();
            if len > max {
                if let Some((span, _, _)) = current.take() {
                    spans.push(span);
                }
                for (start, end) in self.windows(text, unit.start, unit.end) {
                    spans.push(Span {
                        start,
                        end,
                        heading: unit.heading.clone(),
                    });
                }
                continue;
            }
            match &mut current {
                Some((span, section, chars)) if *section == unit.section && *chars + len <= max => {
                    span.end = unit.end;
                    *chars += len;
                }
                _ => {
                    if let Some((span, _, _)) = current.take() {
                        spans.push(span);
                    }
                    current = Some((
                        Span {
                            start: unit.start,
                            end: unit.end,
                            heading: unit.heading,
                        },
                        unit.section,
                        len,
                    ));
                }
            }
        }
        if let Some((span, _, _)) = current {
            spans.push(span);
        }
        spans
    }

    /// Cut `text[start..end]` into pieces of at most `max_chars` characters,
    /// preferring to end each piece after whitespace.
    fn windows(&self, text: &str, mut start: usize, end: usize) -> Vec<(usize, usize)> {
        let max = self.config.max_chars;
        let overlap = self.config.min_overlap_chars;
        let mut out = Vec::new();

        loop {
            let slice = &text[start..end];
            let Some((limit_rel, _)) = slice.char_indices().nth(max) else {
                out.push((start, end));
                return out;
            };
            let limit = start + limit_rel;
            // A piece must be longer than the overlap so the next one starts further on.
            let min_end = slice
                .char_indices()
                .nth(overlap + 1)
                .map_or(limit, |(i, _)| (start + i).min(limit));
            let piece_end = text[min_end..limit]
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map_or(limit, |(i, c)| min_end + i + c.len_utf8());
            out.push((start, piece_end));

            start = if overlap == 0 {
                piece_end
            } else {
                text[start..piece_end]
                    .char_indices()
                    .rev()
                    .nth(overlap - 1)
                    .map_or(piece_end, |(i, _)| start + i)
            };
        }
    }
}

fn structural_units(text: &str) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut offset = 0;
    let mut unit_start = 0;
    let mut section = 0;
    let mut heading: Option<String> = None;
    let mut has_content = false;
    let mut prev_blank = false;
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        let blank = trimmed.is_empty();
        let title = if in_fence { None } else { heading_text(line) };

        if has_content && !in_fence {
            let section_break = title.is_some();
            if section_break || (!blank && prev_blank) {
                units.push(Unit {
                    start: unit_start,
                    end: offset,
                    section,
                    heading: heading.clone(),
                });
                unit_start = offset;
                has_content = false;
                if section_break {
                    section += 1;
                }
            }
        }

        if title.is_some() {
            heading = title;
        }
        if is_fence(trimmed) {
            in_fence = !in_fence;
        }
        has_content |= !blank;
        prev_blank = blank;
        offset += line.len();
    }

    if has_content {
        units.push(Unit {
            start: unit_start,
            end: text.len(),
            section,
            heading,
        });
    }
    units
}

fn is_fence(trimmed: &str) -> bool {
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// Title of an ATX heading line (`# Title`), or `None` for other lines.
fn heading_text(line: &str) -> Option<String> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let level = rest.bytes().take_while(|b| *b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let after = &rest[level..];
    if !(after.is_empty() || after.starts_with(char::is_whitespace)) {
        return None;
    }
    Some(after.trim().trim_end_matches('#').trim_end().to_owned())
}

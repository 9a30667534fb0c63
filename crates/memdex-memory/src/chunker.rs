//! Markdown-aware paragraph chunking.
//!
//! Blank lines separate paragraphs and every paragraph becomes its own
//! chunk, so retrieval returns focused context. Heading lines are glued to
//! the paragraph that follows them. Fenced code blocks are never split at
//! their inner blank lines. A paragraph longer than the size budget is cut on
//! line boundaries; chunks always hold whole lines so their line spans map
//! exactly back to the source file.

/// A chunk of text with its 1-based inclusive line span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Chunk text, original line breaks kept.
    pub text: String,
    /// First line, 1-based.
    pub start_line: usize,
    /// Last line, inclusive.
    pub end_line: usize,
}

/// A run of lines that must stay together (0-based, inclusive).
#[derive(Debug, Clone, Copy)]
struct Block {
    start: usize,
    end: usize,
    heading: bool,
}

/// Split `content` into chunks of at most `max_chars` characters, except
/// where a single line is longer than the budget.
pub fn chunk_markdown(content: &str, max_chars: usize) -> Vec<TextChunk> {
    let max_chars = max_chars.max(1);
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();

    // Pending span plus whether it holds only headings so far.
    let mut pending: Option<(usize, usize, bool)> = None;

    for block in split_blocks(&lines) {
        if span_len(&lines, block.start, block.end) > max_chars {
            if let Some((start, end, _)) = pending.take() {
                chunks.push(make_chunk(&lines, start, end));
            }
            split_oversized(&lines, block, max_chars, &mut chunks);
            continue;
        }

        pending = match pending {
            Some((start, _, true)) if span_len(&lines, start, block.end) <= max_chars => {
                Some((start, block.end, block.heading))
            }
            Some((start, end, _)) => {
                chunks.push(make_chunk(&lines, start, end));
                Some((block.start, block.end, block.heading))
            }
            None => Some((block.start, block.end, block.heading)),
        };
    }

    if let Some((start, end, _)) = pending {
        chunks.push(make_chunk(&lines, start, end));
    }
    chunks
}

fn split_blocks(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    let mut in_fence = false;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let is_fence = trimmed.starts_with("```") || trimmed.starts_with("~~~");

        if in_fence {
            if let Some(block) = current.as_mut() {
                block.end = i;
            }
            if is_fence {
                in_fence = false;
            }
            continue;
        }

        if trimmed.is_empty() {
            blocks.extend(current.take());
            continue;
        }

        if is_heading(trimmed) {
            blocks.extend(current.take());
            blocks.push(Block {
                start: i,
                end: i,
                heading: true,
            });
            continue;
        }

        match current.as_mut() {
            Some(block) => block.end = i,
            None => {
                current = Some(Block {
                    start: i,
                    end: i,
                    heading: false,
                });
            }
        }
        if is_fence {
            in_fence = true;
        }
    }

    blocks.extend(current);
    blocks
}

/// ATX heading: one to six `#` followed by a space or end of line.
fn is_heading(trimmed: &str) -> bool {
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
}

fn split_oversized(lines: &[&str], block: Block, max_chars: usize, chunks: &mut Vec<TextChunk>) {
    let mut start = block.start;
    for i in block.start..=block.end {
        if i > start && span_len(lines, start, i) > max_chars {
            chunks.push(make_chunk(lines, start, i - 1));
            start = i;
        }
    }
    chunks.push(make_chunk(lines, start, block.end));
}

/// Character length of `lines[start..=end]` joined with newlines.
fn span_len(lines: &[&str], start: usize, end: usize) -> usize {
    lines[start..=end]
        .iter()
        .map(|l| l.chars().count())
        .sum::<usize>()
        + (end - start)
}

fn make_chunk(lines: &[&str], start: usize, end: usize) -> TextChunk {
    TextChunk {
        text: lines[start..=end].join("\n"),
        start_line: start + 1,
        end_line: end + 1,
    }
}

//! Sentence-aware text chunker.
//!
//! Splits text into [`Chunk`]s of whole sentences, up to `chunk_size`
//! characters each. Every chunk after the first starts with the trailing
//! sentences of its predecessor (at most `chunk_overlap` characters) so a
//! thought that straddles a boundary is visible in both chunks.
//!
//! Sentence boundaries are heuristic: after `.`, `!` or `?` followed by
//! whitespace and an uppercase letter, or after a line break.
//!
//! All lengths and offsets are counted in characters, not bytes.

use serde_json::Value;

use crate::config::{ChunkSizes, ChunkingConfig};
use crate::models::Metadata;

/// A bounded span of a document, the unit of embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// Character offset of the first sentence in the source text.
    pub start_char: usize,
    /// Character offset one past the last sentence in the source text.
    pub end_char: usize,
    pub chunk_index: usize,
    /// Leading characters of `text` repeated from the previous chunk,
    /// including the separating space.
    pub overlap_chars: usize,
    pub metadata: Metadata,
}

impl Chunk {
    /// The part of this chunk not repeated from its predecessor.
    pub fn fresh_text(&self) -> String {
        self.text.chars().skip(self.overlap_chars).collect()
    }
}

/// One trimmed sentence and its span in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl Sentence {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Split `text` into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<Sentence> {
    let chars: Vec<char> = text.chars().collect();
    let mut cuts = Vec::new();

    // visible_from[i]: first non-whitespace index at or after i.
    let mut visible_from: Vec<Option<usize>> = vec![None; chars.len() + 1];
    for i in (0..chars.len()).rev() {
        visible_from[i] = if chars[i].is_whitespace() {
            visible_from[i + 1]
        } else {
            Some(i)
        };
    }

    for (i, &c) in chars.iter().enumerate() {
        let next_visible = visible_from[i + 1];

        match c {
            '.' | '!' | '?' => {
                if let Some(j) = next_visible {
                    if j > i + 1 && chars[j].is_uppercase() {
                        cuts.push(i + 1);
                    }
                }
            }
            '\n' if next_visible.is_some() => cuts.push(i + 1),
            _ => {}
        }
    }
    cuts.push(chars.len());

    let mut sentences = Vec::new();
    let mut start = 0;
    for cut in cuts {
        if cut <= start {
            continue;
        }
        let (mut s, mut e) = (start, cut);
        while s < e && chars[s].is_whitespace() {
            s += 1;
        }
        while e > s && chars[e - 1].is_whitespace() {
            e -= 1;
        }
        if s < e {
            sentences.push(Sentence {
                text: chars[s..e].iter().collect(),
                start: s,
                end: e,
            });
        }
        start = cut;
    }
    sentences
}

/// Sentences making up one chunk; the first `overlap` are carried over.
struct Group {
    members: Vec<usize>,
    overlap: usize,
}

fn joined_len(sentences: &[Sentence], members: &[usize]) -> usize {
    if members.is_empty() {
        return 0;
    }
    members.iter().map(|&i| sentences[i].len()).sum::<usize>() + members.len() - 1
}

fn join(sentences: &[Sentence], members: &[usize]) -> String {
    members
        .iter()
        .map(|&i| sentences[i].text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct TextChunker {
    sizes: ChunkSizes,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(ChunkSizes::TEXT)
    }
}

impl TextChunker {
    pub fn new(sizes: ChunkSizes) -> Self {
        Self { sizes }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.text_sizes())
    }

    pub fn sizes(&self) -> ChunkSizes {
        self.sizes
    }

    /// Split `text` into overlapping chunks.
    ///
    /// Whitespace-only text yields no chunks. Text shorter than
    /// `min_chunk_size` yields one chunk holding the trimmed input.
    pub fn chunk(&self, text: &str, metadata: Option<&Metadata>) -> Vec<Chunk> {
        let base = metadata.cloned().unwrap_or_default();

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let trimmed_len = trimmed.chars().count();
        if trimmed_len < self.sizes.min_chunk_size {
            let start = text.chars().take_while(|c| c.is_whitespace()).count();
            let mut meta = base;
            meta.insert("chunk_index".into(), Value::from(0));
            meta.insert("total_chunks".into(), Value::from(1));
            return vec![Chunk {
                text: trimmed.to_string(),
                start_char: start,
                end_char: start + trimmed_len,
                chunk_index: 0,
                overlap_chars: 0,
                metadata: meta,
            }];
        }

        let sentences = split_sentences(text);
        let groups = self.group(&sentences);
        let total = groups.len();

        groups
            .iter()
            .enumerate()
            .map(|(index, group)| {
                let overlap_chars = if group.overlap > 0 {
                    joined_len(&sentences, &group.members[..group.overlap]) + 1
                } else {
                    0
                };
                let mut meta = base.clone();
                meta.insert("chunk_index".into(), Value::from(index));
                meta.insert("total_chunks".into(), Value::from(total));
                Chunk {
                    text: join(&sentences, &group.members),
                    start_char: sentences[group.members[0]].start,
                    end_char: sentences[group.members[group.members.len() - 1]].end,
                    chunk_index: index,
                    overlap_chars,
                    metadata: meta,
                }
            })
            .collect()
    }

    fn group(&self, sentences: &[Sentence]) -> Vec<Group> {
        let ChunkSizes {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        } = self.sizes;

        let mut groups: Vec<Group> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        let mut overlap = 0;

        for (idx, sentence) in sentences.iter().enumerate() {
            let current_len = joined_len(sentences, &current);
            let with_next = if current.is_empty() {
                sentence.len()
            } else {
                current_len + 1 + sentence.len()
            };

            if with_next > chunk_size && current.len() > overlap {
                // Seed the next chunk with the trailing sentences that fit the overlap budget.
                let mut carried = Vec::new();
                let mut carried_len = 0;
                for &j in current.iter().rev() {
                    let cost = sentences[j].len() + 1;
                    if carried_len + cost > chunk_overlap {
                        break;
                    }
                    carried.insert(0, j);
                    carried_len += cost;
                }

                groups.push(Group {
                    members: std::mem::take(&mut current),
                    overlap,
                });
                overlap = carried.len();
                current = carried;
            }

            current.push(idx);
        }

        if current.len() > overlap {
            let short = joined_len(sentences, &current) < min_chunk_size;
            match groups.last_mut() {
                Some(previous) if short => previous.members.extend_from_slice(&current[overlap..]),
                _ => groups.push(Group {
                    members: current,
                    overlap,
                }),
            }
        }

        groups
    }

    /// Chunk a titled document and stamp each chunk with its provenance.
    pub fn chunk_document(
        &self,
        title: &str,
        body: &str,
        source_id: &str,
        source_type: &str,
        metadata: Option<&Metadata>,
    ) -> Vec<Chunk> {
        let text = if title.trim().is_empty() {
            body.to_string()
        } else {
            format!("{}\n\n{}", title, body)
        };

        let mut chunks = self.chunk(&text, metadata);
        for chunk in &mut chunks {
            chunk.metadata.insert("source_id".into(), Value::from(source_id));
            chunk.metadata.insert("source_type".into(), Value::from(source_type));
            chunk.metadata.insert("title".into(), Value::from(title));
        }
        chunks
    }
}

/// Chunker for mail: smaller chunks and a `Subject/From/To` header.
#[derive(Debug, Clone)]
pub struct EmailChunker {
    inner: TextChunker,
}

impl Default for EmailChunker {
    fn default() -> Self {
        Self::new(ChunkSizes::EMAIL)
    }
}

impl EmailChunker {
    pub fn new(sizes: ChunkSizes) -> Self {
        Self {
            inner: TextChunker::new(sizes),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.email)
    }

    pub fn chunk_email(
        &self,
        subject: &str,
        body: &str,
        from: &str,
        to: &str,
        message_id: &str,
        metadata: Option<&Metadata>,
    ) -> Vec<Chunk> {
        let text = format!(
            "Subject: {}\nFrom: {}\nTo: {}\n\n{}",
            subject, from, to, body
        );

        let mut chunks = self.inner.chunk(&text, metadata);
        for chunk in &mut chunks {
            let meta = &mut chunk.metadata;
            meta.insert("source_id".into(), Value::from(message_id));
            meta.insert("source_type".into(), Value::from("email"));
            meta.insert("title".into(), Value::from(subject));
            // Provenance keys above always reflect this message; header keys
            // defer to whatever the caller already recorded.
            meta.entry("subject").or_insert_with(|| Value::from(subject));
            meta.entry("from").or_insert_with(|| Value::from(from));
            meta.entry("to").or_insert_with(|| Value::from(to));
        }
        chunks
    }
}

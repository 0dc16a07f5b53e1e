//! Sentence-aware text segmentation.
//!
//! Text is split on sentence-terminal punctuation (CJK and Latin) and line
//! breaks, then candidate sentences accumulate into chunks of at most
//! `max_chars` code points. A single sentence longer than the limit is
//! hard-split into fixed-size, code-point-aligned slices. All counting is
//! per code point so CJK and Latin text behave uniformly.

use chrono::Utc;
use uuid::Uuid;

use kbase_core::error::{KbError, Result};
use kbase_core::types::TextChunk;

/// Chunk size applied when the caller passes zero or a negative value.
pub const DEFAULT_CHUNK_CHARS: usize = 200;

fn is_sentence_terminal(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '；' | ';' | '!' | '?' | '\n' | '\r')
}

/// Split raw text into chunk strings of at most `max_chars` code points.
///
/// Whitespace-only input yields no chunks. Sentences within one chunk are
/// joined with a single space, and that separator counts toward the limit.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_chars = if max_chars == 0 { DEFAULT_CHUNK_CHARS } else { max_chars };

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for sentence in text.split(is_sentence_terminal) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let sent_len = sentence.chars().count();

        // Oversized sentence: emit fixed-size slices directly, leaving any
        // accumulated buffer for the following sentences.
        if sent_len > max_chars {
            let runes: Vec<char> = sentence.chars().collect();
            for slice in runes.chunks(max_chars) {
                chunks.push(slice.iter().collect());
            }
            continue;
        }

        // The joining space counts, so every emitted chunk stays within
        // the limit.
        if current_len > 0 && current_len + 1 + sent_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(sentence);
        current_len += sent_len;
    }

    if current_len > 0 {
        chunks.push(current);
    }

    chunks
}

/// Split `content` into [`TextChunk`] rows for `document_id`.
///
/// `chunk_size <= 0` falls back to [`DEFAULT_CHUNK_CHARS`]. Chunk indexes
/// are contiguous from 0; `word_count` is the code-point count of the
/// chunk content.
pub fn chunk_text(document_id: &str, content: &str, chunk_size: i64) -> Result<Vec<TextChunk>> {
    let document_id = Uuid::parse_str(document_id)
        .map_err(|e| KbError::Validation(format!("invalid document id: {e}")))?;
    let max_chars = if chunk_size <= 0 { DEFAULT_CHUNK_CHARS } else { chunk_size as usize };

    let now = Utc::now();
    Ok(split_text(content, max_chars)
        .into_iter()
        .enumerate()
        .map(|(idx, content)| {
            let word_count = content.chars().count() as i64;
            TextChunk {
                id: Uuid::new_v4(),
                document_id,
                content,
                chunk_index: idx as i64,
                start_pos: 0,
                end_pos: word_count,
                word_count,
                embedding: None,
                created_at: now,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "00000000-0000-0000-0000-000000000000";

    #[test]
    fn hard_splits_a_long_sentence() {
        let chunks = chunk_text(DOC, "abcdefghij", 3).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[3].chunk_index, 3);
        assert_eq!(chunks[0].word_count, 3);
        assert_eq!(chunks[3].word_count, 1);
        assert_eq!(chunks[0].content, "abc");
        assert_eq!(chunks[3].content, "j");
    }

    #[test]
    fn empty_and_whitespace_yield_no_chunks() {
        assert!(chunk_text(DOC, "", 100).unwrap().is_empty());
        assert!(chunk_text(DOC, "   \n\t ", 100).unwrap().is_empty());
    }

    #[test]
    fn invalid_document_id_is_rejected() {
        assert!(matches!(
            chunk_text("not-a-uuid", "text", 100),
            Err(KbError::Validation(_))
        ));
    }

    #[test]
    fn accumulates_sentences_up_to_the_limit() {
        // Two short sentences fit one chunk of 10; the third starts a new one.
        let chunks = split_text("ab. cd. efgh.", 10);
        // '.' is not a terminator; the whole string is one 13-char sentence,
        // hard-split at 10.
        assert_eq!(chunks, vec!["ab. cd. ef", "gh."]);

        let chunks = split_text("ab! cd! efgh!", 10);
        assert_eq!(chunks, vec!["ab cd efgh"]);

        let chunks = split_text("ab! cd! efgh!", 5);
        assert_eq!(chunks, vec!["ab cd", "efgh"]);
    }

    #[test]
    fn every_chunk_respects_the_limit() {
        let text = "第一句话。第二句比较长一些。短句！然后是另一个例子；最后一句话呢？";
        for max in [4usize, 7, 12, 30] {
            for chunk in split_text(text, max) {
                assert!(
                    chunk.chars().count() <= max,
                    "chunk {chunk:?} exceeds {max}"
                );
            }
        }
    }

    #[test]
    fn non_whitespace_characters_survive_in_order() {
        let text = "句子一。句子二！句子三？\nsentence four; five!";
        let joined: String = split_text(text, 8).concat();
        let original: String = text.chars().filter(|c| !c.is_whitespace() && !is_sentence_terminal(*c)).collect();
        let survived: String = joined.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(survived, original);
    }

    #[test]
    fn indexes_are_contiguous_from_zero() {
        let chunks = chunk_text(DOC, "一句。二句。三句。四句。五句。", 4).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn default_applies_for_non_positive_chunk_size() {
        let text = "word. ".repeat(100);
        let chunks = chunk_text(DOC, &text, 0).unwrap();
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.word_count as usize <= DEFAULT_CHUNK_CHARS);
        }
        assert_eq!(
            chunk_text(DOC, &text, -5).unwrap().len(),
            chunks.len()
        );
    }
}

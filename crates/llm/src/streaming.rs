//! Speech chunking for streamed replies
//!
//! Reply tokens are buffered until a sentence or clause boundary so each
//! chunk can be synthesized on its own. Chunks keep every byte of the reply
//! (including whitespace) so their offsets line up with the full text.

/// A synthesizable piece of the reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechChunk {
    pub text: String,
    /// Byte offset of `text` in the full reply
    pub offset: usize,
}

impl SpeechChunk {
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

/// Buffers tokens and emits chunks at speakable boundaries
#[derive(Debug)]
pub struct SpeechChunker {
    buffer: String,
    offset: usize,
    /// Clause punctuation only splits once the buffer is at least this long
    clause_min_chars: usize,
}

const DEFAULT_CLAUSE_MIN_CHARS: usize = 40;

fn is_sentence_end(c: char) -> bool {
    // Includes Devanagari danda for Hinglish replies
    matches!(c, '.' | '!' | '?' | '\n' | '।' | '॥')
}

fn is_clause_end(c: char) -> bool {
    matches!(c, ',' | ';' | ':')
}

impl SpeechChunker {
    pub fn new() -> Self {
        Self::with_clause_min_chars(DEFAULT_CLAUSE_MIN_CHARS)
    }

    pub fn with_clause_min_chars(clause_min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            offset: 0,
            clause_min_chars,
        }
    }

    /// Start offsets at `offset` (used when resuming mid-text)
    pub fn starting_at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Add a token and get any complete chunks
    pub fn push(&mut self, token: &str) -> Vec<SpeechChunk> {
        self.buffer.push_str(token);

        let mut chunks = Vec::new();
        while let Some(end) = self.boundary() {
            let rest = self.buffer.split_off(end);
            let text = std::mem::replace(&mut self.buffer, rest);
            let chunk = SpeechChunk {
                offset: self.offset,
                text,
            };
            self.offset = chunk.end();
            chunks.push(chunk);
        }
        chunks
    }

    /// Flush whatever is left
    pub fn flush(&mut self) -> Option<SpeechChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.buffer);
        let chunk = SpeechChunk {
            offset: self.offset,
            text,
        };
        self.offset = chunk.end();
        if chunk.text.trim().is_empty() {
            None
        } else {
            Some(chunk)
        }
    }

    /// Byte index just past the first boundary, including the whitespace
    /// that confirms it
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            let splits = is_sentence_end(c) || (is_clause_end(c) && idx >= self.clause_min_chars);
            if !splits {
                continue;
            }
            if c == '\n' {
                return Some(idx + c.len_utf8());
            }
            match chars.peek() {
                Some(&(next_idx, next)) if next.is_whitespace() => {
                    let end = next_idx + next.len_utf8();
                    if self.buffer[..idx].trim().is_empty() {
                        continue;
                    }
                    return Some(end);
                }
                _ => continue,
            }
        }
        None
    }
}

impl Default for SpeechChunker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_chunks_keep_offsets() {
        let mut chunker = SpeechChunker::new();
        let reply = "Thank you. Where are you from? I ask because";

        let mut chunks = Vec::new();
        for token in ["Thank", " you.", " Where are", " you from?", " I ask", " because"] {
            chunks.extend(chunker.push(token));
        }
        chunks.extend(chunker.flush());

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Thank you. ", "Where are you from? ", "I ask because"]);
        for chunk in &chunks {
            assert_eq!(&reply[chunk.offset..chunk.end()], chunk.text);
        }
    }

    #[test]
    fn test_decimal_point_is_not_a_boundary() {
        let mut chunker = SpeechChunker::new();
        assert!(chunker.push("The rate is 3.5 percent").is_empty());
        assert_eq!(chunker.flush().unwrap().text, "The rate is 3.5 percent");
    }

    #[test]
    fn test_clause_split_only_when_long() {
        let mut chunker = SpeechChunker::new();
        assert!(chunker.push("Okay, ").is_empty());

        let long = "that makes sense and I understand how difficult this is, ";
        let chunks = chunker.push(long);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("Okay, that"));
        assert!(chunks[0].text.ends_with("is, "));
    }

    #[test]
    fn test_starting_offset() {
        let mut chunker = SpeechChunker::new().starting_at(10);
        let chunks = chunker.push("again. ");
        assert_eq!(chunks[0].offset, 10);
        assert_eq!(chunks[0].end(), 17);
    }

    #[test]
    fn test_whitespace_tail_is_not_a_chunk() {
        let mut chunker = SpeechChunker::new();
        chunker.push("Done. ");
        assert!(chunker.flush().is_none());
    }
}

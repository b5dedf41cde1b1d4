use graphrag_common::config::IndexingConfig;
use graphrag_common::{Document, TextChunk};

/// Packs sentences into chunks of at most `chunk_size` chars, carrying up to
/// `chunk_overlap` chars of trailing sentences into the next chunk.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self { chunk_size, chunk_overlap: chunk_overlap.min(chunk_size - 1) }
    }

    pub fn from_config(config: &IndexingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn split(&self, document: &Document) -> Vec<TextChunk> {
        if document.content.trim().is_empty() {
            return Vec::new();
        }

        let pieces: Vec<String> = split_sentences(&document.content)
            .into_iter()
            .flat_map(|s| self.hard_wrap(s))
            .collect();

        self.merge(&pieces)
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .enumerate()
            .map(|(i, content)| TextChunk::new(&document.source_id, i, content))
            .collect()
    }

    pub fn split_all(&self, documents: &[Document]) -> Vec<TextChunk> {
        documents.iter().flat_map(|d| self.split(d)).collect()
    }

    /// Sentences longer than a whole chunk are cut on char boundaries.
    fn hard_wrap(&self, sentence: String) -> Vec<String> {
        if sentence.chars().count() <= self.chunk_size {
            return vec![sentence];
        }
        let chars: Vec<char> = sentence.chars().collect();
        chars.chunks(self.chunk_size).map(|c| c.iter().collect()).collect()
    }

    fn merge(&self, sentences: &[String]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: Vec<&str> = Vec::new();
        let mut window_len = 0;

        for sentence in sentences {
            let len = sentence.chars().count();
            if !window.is_empty() && window_len + len > self.chunk_size {
                chunks.push(window.concat());

                // Keep trailing sentences that fit in the overlap and still leave room.
                let mut kept = 0;
                let mut kept_len = 0;
                for s in window.iter().rev() {
                    let l = s.chars().count();
                    if kept_len + l > self.chunk_overlap || kept_len + l + len > self.chunk_size {
                        break;
                    }
                    kept_len += l;
                    kept += 1;
                }
                window.drain(..window.len() - kept);
                window_len = kept_len;
            }
            window.push(sentence);
            window_len += len;
        }

        if !window.is_empty() {
            chunks.push(window.concat());
        }
        chunks
    }
}

/// Splits after `.`, `?` or `!` followed by whitespace, and on blank lines.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = match (c, chars.peek()) {
            ('\n', Some('\n')) => {
                current.push('\n');
                chars.next();
                true
            }
            ('.' | '?' | '!', Some(next)) if next.is_whitespace() => {
                current.push(*next);
                chars.next();
                true
            }
            _ => false,
        };
        if boundary && !current.trim().is_empty() {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }
    sentences
}

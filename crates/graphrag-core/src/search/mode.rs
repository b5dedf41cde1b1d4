use graphrag_common::SearchMode;

/// Phrases that signal a corpus-wide question.
const GLOBAL_HINTS: &[&str] = &[
    "overall",
    "main themes",
    "main topics",
    "key topics",
    "key themes",
    "summarize",
    "summarise",
    "summary",
    "trends",
    "across",
    "in general",
    "overview",
    "big picture",
];

/// Keyword router between local and global search.
#[derive(Debug, Clone, Default)]
pub struct SearchModeDetector;

impl SearchModeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Never returns `Auto`.
    pub fn detect(&self, query: &str) -> SearchMode {
        let lowered = query.to_lowercase();
        if GLOBAL_HINTS.iter().any(|hint| lowered.contains(hint)) {
            SearchMode::Global
        } else {
            SearchMode::Local
        }
    }

    /// Resolves `Auto` through `detect`; explicit modes pass through.
    pub fn resolve(&self, requested: SearchMode, query: &str) -> SearchMode {
        match requested {
            SearchMode::Auto => self.detect(query),
            explicit => explicit,
        }
    }
}

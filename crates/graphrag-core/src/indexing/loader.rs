use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use graphrag_common::config::SourceConfig;
use graphrag_common::Document;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Loads every document a source expands to. Failures are fatal for the build.
    async fn load(&self, source: &SourceConfig) -> Result<Vec<Document>>;
}

/// Reads a single file, or every text file under a directory in sorted path order.
/// Files under a directory get `{source id}/{relative path}` as their source id.
#[derive(Debug, Clone, Default)]
pub struct FileSystemLoader {
    base_dir: Option<PathBuf>,
}

impl FileSystemLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative source paths are resolved against `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: Some(base_dir.into()) }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        match &self.base_dir {
            Some(base) if p.is_relative() => base.join(p),
            _ => p.to_path_buf(),
        }
    }
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TEXT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Blocking walk, run off the async runtime.
async fn collect_text_files(root: &Path) -> Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&root).follow_links(true).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if entry.file_type().is_file() && is_text_file(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok::<_, anyhow::Error>(files)
    })
    .await?
}

#[async_trait]
impl DocumentLoader for FileSystemLoader {
    async fn load(&self, source: &SourceConfig) -> Result<Vec<Document>> {
        let path = self.resolve(&source.path);
        let meta = tokio::fs::metadata(&path).await
            .with_context(|| format!("Source {} not found at {}", source.source_id(), path.display()))?;

        if meta.is_file() {
            let content = tokio::fs::read_to_string(&path).await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            return Ok(vec![Document {
                source_id: source.source_id().to_string(),
                path: Some(path.display().to_string()),
                content,
            }]);
        }

        let mut documents = Vec::new();
        for file in collect_text_files(&path).await? {
            let content = tokio::fs::read_to_string(&file).await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let relative = file.strip_prefix(&path).unwrap_or(&file);
            let relative = relative.to_string_lossy().replace('\\', "/");
            documents.push(Document {
                source_id: format!("{}/{}", source.source_id().trim_end_matches('/'), relative),
                path: Some(file.display().to_string()),
                content,
            });
        }
        tracing::debug!("Loaded {} documents from {}", documents.len(), path.display());
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "Acme builds rockets.").unwrap();

        let loader = FileSystemLoader::with_base_dir(dir.path());
        let docs = loader.load(&SourceConfig::new("a.txt")).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id, "a.txt");
        assert_eq!(docs[0].content, "Acme builds rockets.");
    }

    #[tokio::test]
    async fn test_directory_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("corpus/sub")).unwrap();
        std::fs::write(dir.path().join("corpus/b.md"), "b").unwrap();
        std::fs::write(dir.path().join("corpus/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("corpus/sub/c.TXT"), "c").unwrap();
        std::fs::write(dir.path().join("corpus/image.png"), [0u8, 1, 2]).unwrap();

        let loader = FileSystemLoader::with_base_dir(dir.path());
        let source = SourceConfig { id: Some("docs".into()), path: "corpus".into() };
        let docs = loader.load(&source).await.unwrap();

        let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["docs/a.txt", "docs/b.md", "docs/sub/c.TXT"]);
    }

    #[tokio::test]
    async fn test_nested_directories_walk_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("corpus/notes/deep")).unwrap();
        std::fs::create_dir_all(dir.path().join("corpus/empty")).unwrap();
        std::fs::write(dir.path().join("corpus/z.md"), "z").unwrap();
        std::fs::write(dir.path().join("corpus/notes/deep/x.markdown"), "x").unwrap();
        std::fs::write(dir.path().join("corpus/notes/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("corpus/notes/skip.json"), "{}").unwrap();

        let loader = FileSystemLoader::with_base_dir(dir.path());
        let docs = loader.load(&SourceConfig { id: Some("kb".into()), path: "corpus".into() }).await.unwrap();

        let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["kb/notes/a.txt", "kb/notes/deep/x.markdown", "kb/z.md"]);
        assert_eq!(docs[1].content, "x");
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let loader = FileSystemLoader::new();
        let err = loader.load(&SourceConfig::new("/definitely/not/here.txt")).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

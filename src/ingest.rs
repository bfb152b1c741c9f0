//! Filesystem ingestion: walk a notes directory and push `.md` / `.txt`
//! files into the index.
//!
//! The document id is the path relative to the notes root, so repeated
//! ingestion runs hit the same ids and the index's content-hash gate
//! turns unchanged files into no-ops.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::index::{IndexStore, UpsertOutcome};
use crate::models::Document;

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

fn is_note(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md") | Some("markdown") | Some("txt")
    )
}

/// Index every note file under `dir`. Unreadable files are logged and
/// skipped rather than aborting the walk.
pub async fn ingest_dir(index: &Arc<dyn IndexStore>, dir: &Path) -> Result<IngestSummary> {
    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    let mut summary = IngestSummary::default();

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                summary.skipped += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_note(entry.path()) {
            continue;
        }

        let content = match std::fs::read_to_string(entry.path()) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(error = %e, path = %entry.path().display(), "skipping unreadable file");
                summary.skipped += 1;
                continue;
            }
        };

        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("path outside notes root: {}", entry.path().display()))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let title = entry
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| rel_str.clone());

        let doc = Document::new(rel_str.clone(), rel_str, title, content);
        match index.upsert(&doc).await? {
            UpsertOutcome::Indexed { .. } => summary.indexed += 1,
            UpsertOutcome::Unchanged => summary.unchanged += 1,
            UpsertOutcome::Removed => {}
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;

    #[tokio::test]
    async fn test_ingest_dir_filters_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "alpha note").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta note").unwrap();
        std::fs::write(dir.path().join("c.bin"), "not a note").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/d.md"), "delta note").unwrap();

        let index: Arc<dyn IndexStore> = Arc::new(MemoryIndex::new(700));
        let summary = ingest_dir(&index, dir.path()).await.unwrap();
        assert_eq!(summary.indexed, 3);
        assert_eq!(index.document_count().await.unwrap(), 3);

        // Re-ingesting the same tree is a no-op.
        let summary = ingest_dir(&index, dir.path()).await.unwrap();
        assert_eq!(summary.indexed, 0);
        assert_eq!(summary.unchanged, 3);
    }

    #[tokio::test]
    async fn test_ingest_dir_rejects_missing_dir() {
        let index: Arc<dyn IndexStore> = Arc::new(MemoryIndex::new(700));
        assert!(ingest_dir(&index, Path::new("/no/such/dir")).await.is_err());
    }
}

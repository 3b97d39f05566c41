//! Ingest text documents for a client

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::service::{DocumentSummary, KnowledgeService};

/// File extensions picked up when walking a directory.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

pub struct IngestArgs {
    pub client: String,
    pub files: Vec<PathBuf>,
    pub dir: Option<PathBuf>,
    /// Run clustering once every file is ingested
    pub cluster: bool,
}

/// Explicit files first, then text files found under `dir`, without duplicates.
pub fn collect_files(files: &[PathBuf], dir: Option<&Path>) -> Vec<PathBuf> {
    let mut collected: Vec<PathBuf> = Vec::new();
    for file in files {
        if !collected.contains(file) {
            collected.push(file.clone());
        }
    }

    if let Some(dir) = dir {
        let mut found: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping unreadable entry: {}", err);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            })
            .collect();
        found.sort();
        for path in found {
            if !collected.contains(&path) {
                collected.push(path);
            }
        }
    }
    collected
}

pub async fn run(service: &KnowledgeService, args: IngestArgs) -> Result<Vec<DocumentSummary>> {
    let files = collect_files(&args.files, args.dir.as_deref());
    if files.is_empty() {
        anyhow::bail!("No input files given (pass files or --dir)");
    }

    let mut summaries = Vec::new();
    for path in &files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let summary = service
            .ingest_document(&args.client, &filename, &path.display().to_string(), &text)
            .await
            .with_context(|| format!("Failed to ingest {}", path.display()))?;
        println!(
            "{}: {} chunks ({} fallback), {} entities, {} facts, {} relationships",
            summary.filename,
            summary.chunks,
            summary.fallback_chunks,
            summary.entities,
            summary.facts,
            summary.relationship_edges
        );
        summaries.push(summary);
    }
    info!("Ingested {} documents for {}", summaries.len(), args.client);

    if args.cluster {
        let report = service
            .cluster_client(&args.client)
            .await
            .context("Clustering failed")?;
        println!(
            "Clustered {} documents: {} -> {} entities ({} clusters, {:?})",
            report.documents, report.entities_before, report.entities_after, report.clusters, report.method
        );
    }
    Ok(summaries)
}

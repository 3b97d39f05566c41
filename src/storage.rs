//! Durable per-client snapshots.
//!
//! Layout under the storage root:
//!
//! ```text
//! <client>/
//!   documents/<doc-key>/{meta,chunks,merged,graph}.json
//!   clustered.json      clustered graph + clustering report
//!   embeddings.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::knowledge::{
    Chunk, ClusteringReport, EmbeddingStore, KnowledgeGraph, MergedGraphData, ID_NAMESPACE,
};

const DOCUMENTS_DIR: &str = "documents";
const CLUSTERED_FILE: &str = "clustered.json";
const EMBEDDINGS_FILE: &str = "embeddings.json";

/// Per-document bookkeeping stored next to the document's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetaRecord {
    pub filename: String,
    pub file_path: String,
    pub ingested_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub fallback_chunks: usize,
}

/// Everything one ingest pass produces for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub meta: DocumentMetaRecord,
    pub chunks: Vec<Chunk>,
    pub merged: MergedGraphData,
    pub graph: KnowledgeGraph,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteredSnapshot {
    pub graph: KnowledgeGraph,
    pub report: ClusteringReport,
}

/// File-backed storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct KnowledgeStorage {
    root: PathBuf,
}

impl KnowledgeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one client; rejects ids that could escape the root.
    pub fn client_dir(&self, client_id: &str) -> Result<PathBuf> {
        validate_client_id(client_id)?;
        Ok(self.root.join(client_id))
    }

    pub fn save_document(&self, client_id: &str, snapshot: &DocumentSnapshot) -> Result<()> {
        let dir = self
            .client_dir(client_id)?
            .join(DOCUMENTS_DIR)
            .join(document_key(&snapshot.meta.filename));
        std::fs::create_dir_all(&dir)?;

        write_json(&dir.join("meta.json"), &snapshot.meta)?;
        write_json(&dir.join("chunks.json"), &snapshot.chunks)?;
        write_json(&dir.join("merged.json"), &snapshot.merged)?;
        write_json(&dir.join("graph.json"), &snapshot.graph)?;
        debug!(
            "Saved document {} for client {} to {}",
            snapshot.meta.filename,
            client_id,
            dir.display()
        );
        Ok(())
    }

    /// All stored documents of a client, ordered by filename.
    pub fn load_documents(&self, client_id: &str) -> Result<Vec<DocumentSnapshot>> {
        let dir = self.client_dir(client_id)?.join(DOCUMENTS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut documents = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match load_document(&path) {
                Ok(snapshot) => documents.push(snapshot),
                Err(err) => warn!("Skipping unreadable document {}: {}", path.display(), err),
            }
        }
        documents.sort_by(|a, b| a.meta.filename.cmp(&b.meta.filename));
        Ok(documents)
    }

    pub fn save_clustered(&self, client_id: &str, snapshot: &ClusteredSnapshot) -> Result<()> {
        let dir = self.client_dir(client_id)?;
        std::fs::create_dir_all(&dir)?;
        write_json(&dir.join(CLUSTERED_FILE), snapshot)
    }

    pub fn load_clustered(&self, client_id: &str) -> Result<Option<ClusteredSnapshot>> {
        read_optional(&self.client_dir(client_id)?.join(CLUSTERED_FILE))
    }

    pub fn save_embeddings(&self, client_id: &str, store: &EmbeddingStore) -> Result<()> {
        let dir = self.client_dir(client_id)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(EMBEDDINGS_FILE);
        let tmp = path.with_extension("json.tmp");
        store.save(&tmp)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load_embeddings(&self, client_id: &str) -> Result<Option<EmbeddingStore>> {
        let path = self.client_dir(client_id)?.join(EMBEDDINGS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        EmbeddingStore::load(&path).map(Some)
    }

    /// Remove every snapshot of a client, keeping the directory (and its lock file).
    pub fn clear(&self, client_id: &str) -> Result<()> {
        let dir = self.client_dir(client_id)?;
        if !dir.exists() {
            return Ok(());
        }

        let documents = dir.join(DOCUMENTS_DIR);
        if documents.exists() {
            std::fs::remove_dir_all(&documents)?;
        }
        for file in [CLUSTERED_FILE, EMBEDDINGS_FILE] {
            let path = dir.join(file);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        info!("Cleared stored knowledge for client {}", client_id);
        Ok(())
    }

    /// Client ids with at least one stored document or clustered graph. Cleared
    /// clients keep their directory but are not listed.
    pub fn list_clients(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut clients: Vec<String> = std::fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let dir = entry.path();
                dir.join(DOCUMENTS_DIR).is_dir() || dir.join(CLUSTERED_FILE).is_file()
            })
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| validate_client_id(name).is_ok())
            .collect();
        clients.sort();
        Ok(clients)
    }
}

pub fn validate_client_id(client_id: &str) -> Result<()> {
    let valid = !client_id.is_empty()
        && client_id.len() <= 128
        && !client_id.starts_with('.')
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "client id must be 1-128 chars of [A-Za-z0-9._-] and not start with '.': {:?}",
            client_id
        )))
    }
}

/// Filesystem-safe, collision-free directory name for a document.
fn document_key(filename: &str) -> String {
    let slug: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    let hash = Uuid::new_v5(&ID_NAMESPACE, format!("document:{}", filename).as_bytes())
        .simple()
        .to_string();
    format!("{}-{}", slug.trim_start_matches('.'), &hash[..8])
}

fn load_document(dir: &Path) -> Result<DocumentSnapshot> {
    Ok(DocumentSnapshot {
        meta: read_json(&dir.join("meta.json"))?,
        chunks: read_json(&dir.join("chunks.json"))?,
        merged: read_json(&dir.join("merged.json"))?,
        graph: read_json(&dir.join("graph.json"))?,
    })
}

/// Write through a temp file so readers never see a half-written snapshot.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::StorageError(format!("Failed to read {}: {}", path.display(), e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

//! Per-client knowledge workflow: ingest documents, cluster, query, reset.
//!
//! Each client's state lives behind one `Arc<Mutex<ClientKnowledgeGraph>>`, so
//! operations on the same client are serialised in-process; writes also hold the
//! client's file lock against other processes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::integrations::{embedder_from_settings, language_model_from_settings, Embedder, LanguageModel};
use crate::knowledge::extractor::DocumentMeta;
use crate::knowledge::query::{QueryContext, QueryOutcome};
use crate::knowledge::{
    merge, Chunk, Chunker, ChunkingStrategy, ClusteringReport, Clusterer, DocumentGraphBuilder,
    EmbeddingStore, Extractor, GraphStats, QueryEngine, QueryOptions,
};
use crate::lock::ClientLock;
use crate::storage::{ClusteredSnapshot, DocumentMetaRecord, DocumentSnapshot, KnowledgeStorage};

/// Everything known about one client: per-document snapshots, the clustered graph
/// and its embeddings.
#[derive(Debug, Clone, Default)]
pub struct ClientKnowledgeGraph {
    pub client_id: String,
    /// Keyed by filename; re-ingesting a file replaces its snapshot
    pub documents: BTreeMap<String, DocumentSnapshot>,
    pub clustered: Option<ClusteredSnapshot>,
    pub embeddings: EmbeddingStore,
}

impl ClientKnowledgeGraph {
    fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }

    fn load(client_id: &str, storage: &KnowledgeStorage) -> Result<Self> {
        let documents = storage
            .load_documents(client_id)?
            .into_iter()
            .map(|doc| (doc.meta.filename.clone(), doc))
            .collect();
        Ok(Self {
            client_id: client_id.to_string(),
            documents,
            clustered: storage.load_clustered(client_id)?,
            embeddings: storage.load_embeddings(client_id)?.unwrap_or_default(),
        })
    }

    /// Stored chunks of every document.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.documents
            .values()
            .flat_map(|doc| doc.chunks.iter().cloned())
            .collect()
    }

    /// Documents ingested after the last clustering pass.
    pub fn pending_documents(&self) -> Vec<String> {
        let clustered_at = self.clustered.as_ref().map(|c| c.report.clustered_at);
        self.documents
            .values()
            .filter(|doc| clustered_at.map_or(true, |at| doc.meta.ingested_at > at))
            .map(|doc| doc.meta.filename.clone())
            .collect()
    }
}

/// Result of ingesting one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub client_id: String,
    pub filename: String,
    pub strategy: ChunkingStrategy,
    pub chunks: usize,
    pub fallback_chunks: usize,
    pub entities: usize,
    pub facts: usize,
    pub relationship_edges: usize,
    pub mention_edges: usize,
    pub dropped_relationships: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    pub client_id: String,
    pub documents: Vec<String>,
    pub pending_documents: Vec<String>,
    pub clustered: Option<GraphStats>,
    pub clustering: Option<ClusteringReport>,
    pub embeddings: usize,
    pub embedding_model: Option<String>,
    pub embedding_coverage: Option<f32>,
}

pub struct KnowledgeService {
    config: Config,
    storage: KnowledgeStorage,
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    extractor: Extractor,
    clusterer: Clusterer,
    engine: QueryEngine,
    clients: RwLock<HashMap<String, Arc<Mutex<ClientKnowledgeGraph>>>>,
}

impl KnowledgeService {
    /// Build providers from configuration.
    pub fn new(config: Config) -> Self {
        let model = language_model_from_settings(&config.llm);
        let embedder = embedder_from_settings(&config.embeddings);
        Self::with_providers(config, model, embedder)
    }

    pub fn with_providers(
        config: Config,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let chunker = Chunker::from_settings(&config.chunking);
        Self::with_chunker(config, model, embedder, chunker)
    }

    pub fn with_chunker(
        config: Config,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
    ) -> Self {
        info!(
            "Knowledge service: model {}, embeddings {}, {:?} chunking, storage {}",
            model.name(),
            embedder.name(),
            chunker.strategy(),
            config.storage_root.display()
        );
        Self {
            storage: KnowledgeStorage::new(config.storage_root.clone()),
            extractor: Extractor::new(model.clone(), config.extraction.clone()),
            clusterer: Clusterer::new(&config.clustering),
            engine: QueryEngine::new(model.clone(), Some(embedder.clone()), config.llm.timeout),
            chunker,
            model,
            embedder,
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &KnowledgeStorage {
        &self.storage
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// The owning handle of one client, loaded from storage on first use.
    async fn client(&self, client_id: &str) -> Result<Arc<Mutex<ClientKnowledgeGraph>>> {
        self.storage.client_dir(client_id)?;
        if let Some(handle) = self.clients.read().await.get(client_id) {
            return Ok(handle.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(handle) = clients.get(client_id) {
            return Ok(handle.clone());
        }
        let state = ClientKnowledgeGraph::load(client_id, &self.storage)?;
        debug!(
            "Loaded client {}: {} documents, clustered: {}",
            client_id,
            state.documents.len(),
            state.clustered.is_some()
        );
        let handle = Arc::new(Mutex::new(state));
        clients.insert(client_id.to_string(), handle.clone());
        Ok(handle)
    }

    fn lock(&self, client_id: &str) -> Result<ClientLock> {
        ClientLock::acquire(client_id, &self.storage.client_dir(client_id)?)
    }

    /// Chunk, extract, merge and build one document, then persist its snapshot.
    pub async fn ingest_document(
        &self,
        client_id: &str,
        filename: &str,
        file_path: &str,
        text: &str,
    ) -> Result<DocumentSummary> {
        let handle = self.client(client_id).await?;
        let mut state = handle.lock().await;
        let _lock = self.lock(client_id)?;

        let chunks = self.chunker.chunk(text, filename);
        if chunks.is_empty() {
            warn!("{} has no text, storing an empty document graph", filename);
        }
        let meta = DocumentMeta::new(filename, file_path);
        let records = self.extractor.extract_all(&chunks, &meta).await;
        let merged = merge(&records);
        let graph = DocumentGraphBuilder::new().build(&merged, filename, file_path);
        let stats = graph.stats();

        let snapshot = DocumentSnapshot {
            meta: DocumentMetaRecord {
                filename: filename.to_string(),
                file_path: file_path.to_string(),
                ingested_at: Utc::now(),
                chunk_count: chunks.len(),
                fallback_chunks: merged.metadata.fallback_chunks,
            },
            chunks,
            merged,
            graph,
        };
        self.storage.save_document(client_id, &snapshot)?;

        let summary = DocumentSummary {
            client_id: client_id.to_string(),
            filename: filename.to_string(),
            strategy: self.chunker.strategy(),
            chunks: snapshot.meta.chunk_count,
            fallback_chunks: snapshot.meta.fallback_chunks,
            entities: stats.entities,
            facts: stats.facts,
            relationship_edges: stats.relationship_edges,
            mention_edges: stats.mention_edges,
            dropped_relationships: snapshot.merged.metadata.dropped_relationships,
        };
        state.documents.insert(filename.to_string(), snapshot);
        info!(
            "Ingested {} for client {}: {} chunks ({} fallback), {} entities, {} facts",
            filename, client_id, summary.chunks, summary.fallback_chunks, summary.entities, summary.facts
        );
        Ok(summary)
    }

    /// Cluster every document graph of the client, embed the result, persist both.
    pub async fn cluster_client(&self, client_id: &str) -> Result<ClusteringReport> {
        let handle = self.client(client_id).await?;
        let mut state = handle.lock().await;
        let _lock = self.lock(client_id)?;

        let graphs: Vec<_> = state.documents.values().map(|d| d.graph.clone()).collect();
        let (graph, report) = self.clusterer.cluster(&graphs);

        let mut embeddings = EmbeddingStore::new();
        let generation = embeddings
            .generate(&graph, self.embedder.as_ref(), self.config.embeddings.batch_size)
            .await;
        if generation.failed > 0 {
            warn!(
                "{} of {} embeddings failed for client {}",
                generation.failed, generation.total, client_id
            );
        }

        let snapshot = ClusteredSnapshot { graph, report };
        self.storage.save_clustered(client_id, &snapshot)?;
        self.storage.save_embeddings(client_id, &embeddings)?;

        let report = snapshot.report.clone();
        state.clustered = Some(snapshot);
        state.embeddings = embeddings;
        info!(
            "Clustered client {}: {:?}, {} -> {} entities, {:.1}% embedding coverage",
            client_id, report.method, report.entities_before, report.entities_after, generation.coverage
        );
        Ok(report)
    }

    /// Query the clustered graph. `None` options use the configured defaults.
    pub async fn query(
        &self,
        client_id: &str,
        text: &str,
        top_k: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<QueryOutcome> {
        let handle = self.client(client_id).await?;
        let state = handle.lock().await;

        let Some(clustered) = state.clustered.as_ref() else {
            info!("Client {} has no clustered graph", client_id);
            return Ok(QueryOutcome::NoGraph);
        };

        let defaults = QueryOptions::from(&self.config.query);
        let options = QueryOptions {
            top_k: top_k.unwrap_or(defaults.top_k),
            threshold: threshold.unwrap_or(defaults.threshold),
        };
        let chunks = state.chunks();
        let ctx = QueryContext {
            graph: &clustered.graph,
            embeddings: &state.embeddings,
            chunks: &chunks,
        };
        Ok(self.engine.query(ctx, text, &options).await)
    }

    /// Forget everything about a client, in memory and on disk.
    pub async fn reset_client(&self, client_id: &str) -> Result<()> {
        let handle = self.client(client_id).await?;
        let mut state = handle.lock().await;
        let _lock = self.lock(client_id)?;

        self.storage.clear(client_id)?;
        *state = ClientKnowledgeGraph::new(client_id);
        info!("Reset client {}", client_id);
        Ok(())
    }

    pub async fn stats(&self, client_id: &str) -> Result<ClientStats> {
        let handle = self.client(client_id).await?;
        let state = handle.lock().await;

        Ok(ClientStats {
            client_id: client_id.to_string(),
            documents: state.documents.keys().cloned().collect(),
            pending_documents: state.pending_documents(),
            clustered: state.clustered.as_ref().map(|c| c.graph.stats()),
            clustering: state.clustered.as_ref().map(|c| c.report.clone()),
            embeddings: state.embeddings.len(),
            embedding_model: (!state.embeddings.model.is_empty())
                .then(|| state.embeddings.model.clone()),
            embedding_coverage: state
                .clustered
                .as_ref()
                .map(|c| state.embeddings.coverage(&c.graph)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::integrations::{HashingEmbedder, OfflineModel};
    use crate::knowledge::ClusteringMethod;
    use tempfile::tempdir;

    fn offline_service(root: &std::path::Path) -> KnowledgeService {
        let config = Config {
            storage_root: root.to_path_buf(),
            ..Config::default()
        };
        KnowledgeService::with_chunker(
            config,
            Arc::new(OfflineModel),
            Arc::new(HashingEmbedder::new(64)),
            Chunker::characters(200, 20),
        )
    }

    const TEXT: &str = "Acme Corp reported strong results. Revenue grew 12% in Q3. \
                        The board approved a new plan for the coming year.";

    #[tokio::test]
    async fn query_before_clustering_is_no_graph() {
        let dir = tempdir().unwrap();
        let service = offline_service(dir.path());
        service.ingest_document("acme", "a.txt", "/docs/a.txt", TEXT).await.unwrap();

        let outcome = service.query("acme", "revenue", None, None).await.unwrap();
        assert_eq!(outcome, QueryOutcome::NoGraph);
    }

    #[tokio::test]
    async fn offline_pipeline_completes() {
        let dir = tempdir().unwrap();
        let service = offline_service(dir.path());

        let summary = service
            .ingest_document("acme", "a.txt", "/docs/a.txt", TEXT)
            .await
            .unwrap();
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.fallback_chunks, 1);
        assert_eq!(summary.facts, 1);
        assert_eq!(summary.strategy, ChunkingStrategy::Characters);

        let report = service.cluster_client("acme").await.unwrap();
        assert_eq!(report.method, ClusteringMethod::SingleDocument);

        let outcome = service.query("acme", "Revenue growth", None, None).await.unwrap();
        let QueryOutcome::Results(response) = outcome else {
            panic!("expected results");
        };
        assert!(!response.insights.content_summary.is_empty());

        let stats = service.stats("acme").await.unwrap();
        assert_eq!(stats.documents, vec!["a.txt"]);
        assert!(stats.pending_documents.is_empty());
        assert_eq!(stats.clustered.unwrap().facts, 1);
        assert_eq!(stats.embeddings, 1);
    }

    #[tokio::test]
    async fn state_survives_a_new_service() {
        let dir = tempdir().unwrap();
        {
            let service = offline_service(dir.path());
            service.ingest_document("acme", "a.txt", "/docs/a.txt", TEXT).await.unwrap();
            service.cluster_client("acme").await.unwrap();
        }

        let service = offline_service(dir.path());
        let stats = service.stats("acme").await.unwrap();
        assert_eq!(stats.documents, vec!["a.txt"]);
        assert!(stats.clustering.is_some());
        assert_eq!(stats.embeddings, 1);
    }

    #[tokio::test]
    async fn reset_clears_memory_and_storage() {
        let dir = tempdir().unwrap();
        let service = offline_service(dir.path());
        service.ingest_document("acme", "a.txt", "/docs/a.txt", TEXT).await.unwrap();
        service.cluster_client("acme").await.unwrap();

        service.reset_client("acme").await.unwrap();
        let stats = service.stats("acme").await.unwrap();
        assert!(stats.documents.is_empty());
        assert!(stats.clustered.is_none());
        assert!(service.storage().load_clustered("acme").unwrap().is_none());

        let fresh = offline_service(dir.path());
        assert!(fresh.stats("acme").await.unwrap().documents.is_empty());
    }

    #[tokio::test]
    async fn ingest_with_token_windows() {
        let dir = tempdir().unwrap();
        let mut config = Config {
            storage_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.chunking.use_tokenizer = true;
        config.chunking.token_window = 12;
        config.chunking.token_overlap = 3;
        let service = KnowledgeService::with_providers(
            config,
            Arc::new(OfflineModel),
            Arc::new(HashingEmbedder::new(64)),
        );
        let text = [TEXT, TEXT, TEXT].join(" ");

        let summary = service
            .ingest_document("acme", "a.txt", "/docs/a.txt", &text)
            .await
            .unwrap();
        assert_eq!(summary.strategy, ChunkingStrategy::Tokens);
        assert!(summary.chunks > 3);
        assert_eq!(summary.fallback_chunks, summary.chunks);

        let stored = service.storage().load_documents("acme").unwrap();
        let chunks = &stored[0].chunks;
        assert_eq!(chunks.len(), summary.chunks);
        let mut covered = vec![false; text.len()];
        for chunk in chunks {
            assert_eq!(&text[chunk.char_range.clone()], chunk.text);
            covered[chunk.char_range.clone()].iter_mut().for_each(|c| *c = true);
        }
        assert!(text
            .char_indices()
            .all(|(i, c)| c.is_whitespace() || covered[i]));
    }

    #[tokio::test]
    async fn clients_are_isolated() {
        let dir = tempdir().unwrap();
        let service = offline_service(dir.path());
        service.ingest_document("acme", "a.txt", "/docs/a.txt", TEXT).await.unwrap();

        let other = service.stats("globex").await.unwrap();
        assert!(other.documents.is_empty());
    }

    #[tokio::test]
    async fn invalid_client_id_is_rejected() {
        let dir = tempdir().unwrap();
        let service = offline_service(dir.path());
        let err = service.stats("../escape").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn locked_client_rejects_writes() {
        let dir = tempdir().unwrap();
        let service = offline_service(dir.path());
        let _held = ClientLock::acquire("acme", &dir.path().join("acme")).unwrap();

        let err = service
            .ingest_document("acme", "a.txt", "/docs/a.txt", TEXT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientLocked(_)));
    }
}

//! Typed directed knowledge graph: entity and fact nodes, relationship and mention
//! edges, keyed by string ids.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::ID_NAMESPACE;

/// Weight of the fact -> entity edge created when a fact names an entity.
pub const MENTION_WEIGHT: f32 = 0.3;

/// Where something was observed: chunk `index` of `source_file`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRef {
    pub source_file: String,
    pub index: usize,
}

impl ChunkRef {
    pub fn new(source_file: impl Into<String>, index: usize) -> Self {
        Self {
            source_file: source_file.into(),
            index,
        }
    }
}

/// Id shared by every entity with this name (case-insensitive).
pub fn entity_id(name: &str) -> String {
    let key = format!("entity:{}", name.trim().to_lowercase());
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

/// Id shared by every fact with this text (case- and whitespace-insensitive).
pub fn fact_id(text: &str) -> String {
    Uuid::new_v5(&ID_NAMESPACE, format!("fact:{}", normalize_text(text)).as_bytes()).to_string()
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() && !list.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        list.push(value.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: String,
    pub name: String,
    pub primary_type: String,
    pub primary_description: String,
    pub all_types: Vec<String>,
    pub all_descriptions: Vec<String>,
    /// Every surface name folded into this entity, including `name`
    pub aliases: Vec<String>,
    pub frequency: u32,
    pub chunks: BTreeSet<ChunkRef>,
    pub source_files: BTreeSet<String>,
    pub confidence: f32,
    pub clustered: bool,
    pub cluster_size: usize,
    pub merged: bool,
    pub merge_count: usize,
}

impl EntityNode {
    pub fn new(name: &str, entity_type: &str, description: &str) -> Self {
        let mut node = Self {
            id: entity_id(name),
            name: name.trim().to_string(),
            primary_type: entity_type.trim().to_string(),
            primary_description: description.trim().to_string(),
            all_types: Vec::new(),
            all_descriptions: Vec::new(),
            aliases: Vec::new(),
            frequency: 0,
            chunks: BTreeSet::new(),
            source_files: BTreeSet::new(),
            confidence: 1.0,
            clustered: false,
            cluster_size: 1,
            merged: false,
            merge_count: 0,
        };
        push_unique(&mut node.all_types, entity_type);
        push_unique(&mut node.all_descriptions, description);
        push_unique(&mut node.aliases, name);
        node
    }

    pub fn chunk_indices(&self) -> Vec<usize> {
        let indices: BTreeSet<usize> = self.chunks.iter().map(|c| c.index).collect();
        indices.into_iter().collect()
    }

    /// Fold `other` into `self`: additive frequency, union of provenance, types,
    /// descriptions and aliases. Primary fields of `self` win.
    pub fn absorb(&mut self, other: &EntityNode) {
        self.frequency += other.frequency;
        self.chunks.extend(other.chunks.iter().cloned());
        self.source_files.extend(other.source_files.iter().cloned());
        for t in &other.all_types {
            push_unique(&mut self.all_types, t);
        }
        for d in &other.all_descriptions {
            push_unique(&mut self.all_descriptions, d);
        }
        for a in &other.aliases {
            push_unique(&mut self.aliases, a);
        }
        if self.primary_type.is_empty() {
            self.primary_type = other.primary_type.clone();
        }
        if self.primary_description.is_empty() {
            self.primary_description = other.primary_description.clone();
        }
        self.confidence = self.confidence.max(other.confidence);
    }

    /// Lowercased names this entity answers to.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .map(|n| n.to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactNode {
    pub id: String,
    pub content: String,
    pub chunks: BTreeSet<ChunkRef>,
    pub source_files: BTreeSet<String>,
    pub confidence: f32,
}

impl FactNode {
    pub fn new(content: &str) -> Self {
        Self {
            id: fact_id(content),
            content: content.trim().to_string(),
            chunks: BTreeSet::new(),
            source_files: BTreeSet::new(),
            confidence: 1.0,
        }
    }

    pub fn chunk_indices(&self) -> Vec<usize> {
        let indices: BTreeSet<usize> = self.chunks.iter().map(|c| c.index).collect();
        indices.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum Node {
    Entity(EntityNode),
    Fact(FactNode),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Entity(e) => &e.id,
            Node::Fact(f) => &f.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeKind {
    /// Extracted entity -> entity relationship
    Relationship { relationship_type: String },
    /// Fact -> entity it names
    Mention,
}

impl EdgeKind {
    pub fn label(&self) -> &str {
        match self {
            EdgeKind::Relationship { .. } => "relationship",
            EdgeKind::Mention => "mention",
        }
    }

    pub fn relationship_type(&self) -> Option<&str> {
        match self {
            EdgeKind::Relationship { relationship_type } => Some(relationship_type),
            EdgeKind::Mention => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    #[serde(default)]
    pub description: String,
    pub weight: f32,
    pub confidence: f32,
    pub chunks: BTreeSet<ChunkRef>,
    pub clustered: bool,
    pub merged: bool,
    /// Endpoints before clustering re-pointed this edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_target: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
            description: String::new(),
            weight: 1.0,
            confidence: 1.0,
            chunks: BTreeSet::new(),
            clustered: false,
            merged: false,
            original_source: None,
            original_target: None,
        }
    }

    pub fn mention(fact_id: &str, entity_id: &str) -> Self {
        let mut edge = Self::new(fact_id, entity_id, EdgeKind::Mention);
        edge.weight = MENTION_WEIGHT;
        edge
    }

    pub fn key(&self) -> String {
        edge_key(&self.source, &self.target, &self.kind)
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self.kind, EdgeKind::Relationship { .. })
    }
}

pub fn edge_key(source: &str, target: &str, kind: &EdgeKind) -> String {
    match kind {
        EdgeKind::Relationship { relationship_type } => format!(
            "{}|{}|rel:{}",
            source,
            target,
            relationship_type.to_lowercase()
        ),
        EdgeKind::Mention => format!("{}|{}|mention", source, target),
    }
}

/// Entity/fact/edge counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entities: usize,
    pub facts: usize,
    pub relationship_edges: usize,
    pub mention_edges: usize,
    pub clustered_entities: usize,
    pub documents: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub nodes: BTreeMap<String, Node>,
    pub edges: BTreeMap<String, Edge>,
    /// Source files that contributed to this graph
    #[serde(default)]
    pub documents: BTreeSet<String>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert an entity, folding it into an existing node with the same id.
    /// Returns true if the id was already present.
    pub fn upsert_entity(&mut self, entity: EntityNode) -> bool {
        match self.nodes.get_mut(&entity.id) {
            Some(Node::Entity(existing)) => {
                existing.absorb(&entity);
                existing.merged = true;
                existing.merge_count += 1;
                true
            }
            Some(Node::Fact(_)) => {
                warn!("Entity id {} collides with a fact, skipping", entity.id);
                true
            }
            None => {
                self.nodes.insert(entity.id.clone(), Node::Entity(entity));
                false
            }
        }
    }

    /// Insert a fact, unioning provenance with an existing fact of the same id.
    pub fn upsert_fact(&mut self, fact: FactNode) -> bool {
        match self.nodes.get_mut(&fact.id) {
            Some(Node::Fact(existing)) => {
                existing.chunks.extend(fact.chunks);
                existing.source_files.extend(fact.source_files);
                existing.confidence = existing.confidence.max(fact.confidence);
                true
            }
            Some(Node::Entity(_)) => {
                warn!("Fact id {} collides with an entity, skipping", fact.id);
                true
            }
            None => {
                self.nodes.insert(fact.id.clone(), Node::Fact(fact));
                false
            }
        }
    }

    /// Insert an edge. Edges with a missing endpoint are dropped (returns false);
    /// a repeated edge accumulates weight and provenance.
    pub fn upsert_edge(&mut self, edge: Edge) -> bool {
        if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
            warn!(
                "Dropping {} edge {} -> {}: missing endpoint",
                edge.kind.label(),
                edge.source,
                edge.target
            );
            return false;
        }

        let key = edge.key();
        match self.edges.get_mut(&key) {
            Some(existing) => {
                existing.weight += edge.weight;
                existing.confidence = existing.confidence.max(edge.confidence);
                existing.chunks.extend(edge.chunks);
                existing.merged = true;
                if existing.description.is_empty() {
                    existing.description = edge.description;
                }
            }
            None => {
                self.edges.insert(key, edge);
            }
        }
        true
    }

    pub fn entity(&self, id: &str) -> Option<&EntityNode> {
        match self.nodes.get(id) {
            Some(Node::Entity(e)) => Some(e),
            _ => None,
        }
    }

    pub fn entity_mut(&mut self, id: &str) -> Option<&mut EntityNode> {
        match self.nodes.get_mut(id) {
            Some(Node::Entity(e)) => Some(e),
            _ => None,
        }
    }

    pub fn fact(&self, id: &str) -> Option<&FactNode> {
        match self.nodes.get(id) {
            Some(Node::Fact(f)) => Some(f),
            _ => None,
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityNode> {
        self.nodes.values().filter_map(|n| match n {
            Node::Entity(e) => Some(e),
            Node::Fact(_) => None,
        })
    }

    pub fn facts(&self) -> impl Iterator<Item = &FactNode> {
        self.nodes.values().filter_map(|n| match n {
            Node::Fact(f) => Some(f),
            Node::Entity(_) => None,
        })
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities().count()
    }

    pub fn fact_count(&self) -> usize {
        self.facts().count()
    }

    /// Relationship degree (in + out) per entity id.
    pub fn relationship_degrees(&self) -> HashMap<&str, usize> {
        let mut degrees = HashMap::new();
        for edge in self.edges.values().filter(|e| e.is_relationship()) {
            *degrees.entry(edge.source.as_str()).or_insert(0) += 1;
            *degrees.entry(edge.target.as_str()).or_insert(0) += 1;
        }
        degrees
    }

    /// Number of facts mentioning each entity id.
    pub fn mention_counts(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for edge in self.edges.values() {
            if edge.kind == EdgeKind::Mention {
                *counts.entry(edge.target.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            documents: self.documents.len(),
            ..GraphStats::default()
        };
        for node in self.nodes.values() {
            match node {
                Node::Entity(e) => {
                    stats.entities += 1;
                    if e.clustered {
                        stats.clustered_entities += 1;
                    }
                }
                Node::Fact(_) => stats.facts += 1,
            }
        }
        for edge in self.edges.values() {
            match edge.kind {
                EdgeKind::Relationship { .. } => stats.relationship_edges += 1,
                EdgeKind::Mention => stats.mention_edges += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, file: &str, index: usize) -> EntityNode {
        let mut e = EntityNode::new(name, "Organization", "A company");
        e.frequency = 1;
        e.chunks.insert(ChunkRef::new(file, index));
        e.source_files.insert(file.to_string());
        e
    }

    #[test]
    fn entity_ids_are_case_insensitive() {
        assert_eq!(entity_id("Acme Corp"), entity_id("  acme corp "));
        assert_ne!(entity_id("Acme Corp"), entity_id("Acme Corporation"));
    }

    #[test]
    fn fact_ids_normalize_whitespace_and_case() {
        assert_eq!(
            fact_id("Revenue grew 12%  in Q3"),
            fact_id("revenue grew 12% in q3")
        );
    }

    #[test]
    fn upsert_entity_merges_same_id() {
        let mut graph = KnowledgeGraph::new();
        assert!(!graph.upsert_entity(entity("Acme Corp", "a.txt", 0)));
        assert!(graph.upsert_entity(entity("ACME CORP", "b.txt", 2)));

        let merged = graph.entity(&entity_id("acme corp")).unwrap();
        assert_eq!(merged.frequency, 2);
        assert_eq!(merged.chunks.len(), 2);
        assert!(merged.merged);
        assert_eq!(merged.merge_count, 1);
        assert_eq!(merged.name, "Acme Corp");
        assert_eq!(merged.aliases, vec!["Acme Corp"]);
    }

    #[test]
    fn edge_with_missing_endpoint_is_dropped() {
        let mut graph = KnowledgeGraph::new();
        let acme = entity("Acme", "a.txt", 0);
        let acme_id = acme.id.clone();
        graph.upsert_entity(acme);

        let edge = Edge::new(
            acme_id,
            "missing",
            EdgeKind::Relationship {
                relationship_type: "owns".to_string(),
            },
        );
        assert!(!graph.upsert_edge(edge));
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn repeated_edge_accumulates_weight() {
        let mut graph = KnowledgeGraph::new();
        let a = entity("Acme", "a.txt", 0);
        let b = entity("Q3", "a.txt", 0);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        graph.upsert_entity(a);
        graph.upsert_entity(b);

        let kind = EdgeKind::Relationship {
            relationship_type: "reported_in".to_string(),
        };
        graph.upsert_edge(Edge::new(&a_id, &b_id, kind.clone()));
        graph.upsert_edge(Edge::new(&a_id, &b_id, kind));

        assert_eq!(graph.edges.len(), 1);
        let edge = graph.edges.values().next().unwrap();
        assert!((edge.weight - 2.0).abs() < f32::EPSILON);
        assert!(edge.merged);
        assert_eq!(graph.relationship_degrees().get(a_id.as_str()), Some(&1));
    }

    #[test]
    fn stats_count_nodes_and_edges() {
        let mut graph = KnowledgeGraph::new();
        let acme = entity("Acme", "a.txt", 0);
        let acme_id = acme.id.clone();
        graph.upsert_entity(acme);
        let fact = FactNode::new("Acme grew");
        let fid = fact.id.clone();
        graph.upsert_fact(fact);
        graph.upsert_edge(Edge::mention(&fid, &acme_id));
        graph.documents.insert("a.txt".to_string());

        let stats = graph.stats();
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.facts, 1);
        assert_eq!(stats.mention_edges, 1);
        assert_eq!(stats.documents, 1);
        assert_eq!(graph.mention_counts().get(acme_id.as_str()), Some(&1));
    }

    #[test]
    fn graph_serde_preserves_typed_nodes() {
        let mut graph = KnowledgeGraph::new();
        graph.upsert_entity(entity("Acme", "a.txt", 0));
        graph.upsert_fact(FactNode::new("Acme grew"));

        let json = serde_json::to_string(&graph).unwrap();
        assert!(json.contains("\"node_type\":\"entity\""));
        let restored: KnowledgeGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, graph);
    }
}

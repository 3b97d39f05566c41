//! Query a client's knowledge graph

use anyhow::{Context, Result};

use crate::knowledge::query::{QueryOutcome, QueryResponse};
use crate::service::KnowledgeService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

pub struct QueryArgs {
    pub client: String,
    pub text: String,
    pub top_k: Option<usize>,
    pub threshold: Option<f32>,
    pub format: OutputFormat,
}

pub async fn run(service: &KnowledgeService, args: QueryArgs) -> Result<QueryOutcome> {
    let outcome = service
        .query(&args.client, &args.text, args.top_k, args.threshold)
        .await
        .with_context(|| format!("Query failed for {}", args.client))?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => match &outcome {
            QueryOutcome::NoGraph => println!(
                "No knowledge graph for {}. Ingest documents and run `cluster` first.",
                args.client
            ),
            QueryOutcome::Results(response) => println!("{}", render_text(response)),
        },
    }
    Ok(outcome)
}

/// Human-readable rendering of a query response.
pub fn render_text(response: &QueryResponse) -> String {
    let mut out = format!("Request: {}\n", response.slide_description);
    out.push_str(&format!(
        "Concepts: {} ({:?})\n",
        response.concept_analysis.key_concepts.join(", "),
        response.quality.concept_source
    ));

    out.push_str("\nEntities:\n");
    for entity in &response.results.entities {
        out.push_str(&format!(
            "  {:>6.2}  {} [{}]{} - {}\n",
            entity.relevance_score,
            entity.name,
            entity.entity_type,
            if entity.cluster_size > 1 {
                format!(" x{}", entity.cluster_size)
            } else {
                String::new()
            },
            entity.source_files.join(", ")
        ));
    }

    out.push_str("\nFacts:\n");
    for fact in &response.results.facts {
        out.push_str(&format!(
            "  {:>6.2}  {} - {}\n",
            fact.relevance_score,
            fact.content,
            fact.source_files.join(", ")
        ));
    }

    out.push_str("\nChunks:\n");
    for chunk in &response.results.chunks {
        let preview: String = chunk.text.chars().take(100).collect();
        out.push_str(&format!(
            "  {:>6.2}  {}#{}: {}\n",
            chunk.relevance_score, chunk.source_file, chunk.index, preview
        ));
    }

    out.push_str("\nRelationships:\n");
    for rel in &response.results.relationships {
        out.push_str(&format!(
            "  {:>6.2}  {} --{}--> {}\n",
            rel.relevance_score, rel.source_name, rel.relationship_type, rel.target_name
        ));
    }

    out.push_str(&format!(
        "\nSummary ({:?}): {}\n",
        response.quality.insight_source, response.insights.content_summary
    ));
    out.push_str(&format!(
        "Embedding coverage: {:.1}%{}",
        response.quality.embedding_coverage,
        if response.quality.query_embedding {
            ""
        } else {
            " (no query embedding)"
        }
    ));
    out
}

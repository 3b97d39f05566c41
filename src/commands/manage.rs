//! Client statistics and reset

use anyhow::{Context, Result};

use crate::service::{ClientStats, KnowledgeService};

pub async fn stats(service: &KnowledgeService, client: &str, json: bool) -> Result<ClientStats> {
    let stats = service
        .stats(client)
        .await
        .with_context(|| format!("Failed to load {}", client))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(stats);
    }

    println!("Client: {}", stats.client_id);
    println!("Documents: {}", stats.documents.len());
    for doc in &stats.documents {
        let pending = if stats.pending_documents.contains(doc) {
            " (not clustered yet)"
        } else {
            ""
        };
        println!("  {}{}", doc, pending);
    }
    match (&stats.clustered, &stats.clustering) {
        (Some(graph), Some(report)) => {
            println!(
                "Clustered graph: {} entities ({} clustered), {} facts, {} relationships, {} mentions",
                graph.entities,
                graph.clustered_entities,
                graph.facts,
                graph.relationship_edges,
                graph.mention_edges
            );
            println!(
                "Last clustering: {:?} at {}, {} clusters",
                report.method,
                report.clustered_at.to_rfc3339(),
                report.clusters
            );
            if let Some(reason) = &report.fallback_reason {
                println!("  fallback: {}", reason);
            }
        }
        _ => println!("Clustered graph: none"),
    }
    println!(
        "Embeddings: {} ({}){}",
        stats.embeddings,
        stats.embedding_model.as_deref().unwrap_or("none"),
        stats
            .embedding_coverage
            .map(|c| format!(", {:.1}% coverage", c))
            .unwrap_or_default()
    );
    Ok(stats)
}

/// Client ids with stored knowledge.
pub fn clients(service: &KnowledgeService, json: bool) -> Result<Vec<String>> {
    let clients = service
        .storage()
        .list_clients()
        .context("Failed to list clients")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&clients)?);
    } else if clients.is_empty() {
        println!("No clients under {}", service.storage().root().display());
    } else {
        for client in &clients {
            println!("{}", client);
        }
    }
    Ok(clients)
}

pub async fn reset(service: &KnowledgeService, client: &str) -> Result<()> {
    service
        .reset_client(client)
        .await
        .with_context(|| format!("Failed to reset {}", client))?;
    println!("Cleared knowledge for {}", client);
    Ok(())
}

//! Enrichment: drive LSP queries against indexed nodes to produce edges.
//!
//! Nodes are grouped by file, files by language. A language without a
//! running client is skipped entirely. For every definition the enricher
//! asks the language server for references (excluding the declaration) and
//! maps each referencing location back onto the innermost indexed symbol
//! containing it; that symbol becomes the source of a `references` edge,
//! plus a `calls` edge when the referenced definition is callable. For
//! interface-like definitions, `implementation` results produce
//! `implements` edges. References landing outside any indexed symbol are
//! dropped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::graph::{Edge, Node, Relation};
use crate::language::{self, Language, LanguageSpec};
use crate::lsp_client::LspClient;
use crate::lsp_fleet::LspFleet;
use crate::lsp_types::Location;
use crate::scanner::uri_to_path;
use crate::store::GraphStore;

/// Documents concurrently open per language; the client serializes actual
/// LSP writes, this bounds memory held by open documents.
const FILE_CONCURRENCY: usize = 2;

pub struct Enricher {
    fleet: Arc<LspFleet>,
}

impl Enricher {
    pub fn new(fleet: Arc<LspFleet>) -> Self {
        Self { fleet }
    }

    pub async fn enrich(&self, nodes: &[Node], store: &Arc<GraphStore>) -> Result<Vec<Edge>> {
        let mut by_language: HashMap<Language, HashMap<PathBuf, Vec<Node>>> = HashMap::new();
        for node in nodes {
            let path = PathBuf::from(&node.file_path);
            let Some(spec) = language::from_path(&path) else {
                continue;
            };
            by_language
                .entry(spec.language)
                .or_default()
                .entry(path)
                .or_default()
                .push(node.clone());
        }

        let collected: Arc<Mutex<Vec<Edge>>> = Arc::new(Mutex::new(Vec::new()));
        for (lang, files) in by_language {
            let client = match self.fleet.client(lang).await {
                Ok(client) => client,
                Err(e) => {
                    debug!("skipping {lang} enrichment: {e:#}");
                    continue;
                }
            };
            let spec = match language::spec_for(lang) {
                Some(spec) => spec,
                None => continue,
            };

            stream::iter(files)
                .for_each_concurrent(FILE_CONCURRENCY, |(path, file_nodes)| {
                    let client = client.clone();
                    let store = store.clone();
                    let collected = collected.clone();
                    async move {
                        match enrich_file(&client, spec, &store, &path, &file_nodes).await {
                            Ok(edges) => collected.lock().await.extend(edges),
                            Err(e) => warn!("enrichment failed for {}: {e:#}", path.display()),
                        }
                    }
                })
                .await;
        }

        let collected = Arc::try_unwrap(collected)
            .map(|m| m.into_inner())
            .unwrap_or_default();

        // Dedup on the full triple; the store collapses duplicates too, but
        // the pipeline reports edge counts from this list.
        let mut seen = HashSet::new();
        let mut edges = Vec::with_capacity(collected.len());
        for edge in collected {
            if seen.insert((
                edge.source_id.clone(),
                edge.target_id.clone(),
                edge.relation,
            )) {
                edges.push(edge);
            }
        }
        Ok(edges)
    }
}

async fn enrich_file(
    client: &LspClient,
    spec: &LanguageSpec,
    store: &GraphStore,
    path: &Path,
    nodes: &[Node],
) -> Result<Vec<Edge>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    client.did_open(path, spec.language_id, &text).await?;

    let mut edges = Vec::new();
    for node in nodes {
        if node.kind == "variable" {
            continue;
        }
        // Query at the definition's start; LSP positions are 0-based lines.
        let line = node.line_start.saturating_sub(1);
        let character = node.col_start;

        match client.references(path, line, character, false).await {
            Ok(locations) => {
                collect_reference_edges(store, node, &locations, &mut edges);
            }
            Err(e) => {
                warn!("references failed for {}: {e:#}", node.name);
                if client.is_closed() {
                    let _ = client.did_close(path).await;
                    return Err(e.context("language server died mid-file"));
                }
            }
        }

        if matches!(node.kind.as_str(), "interface" | "type" | "class") {
            match client.implementation(path, line, character).await {
                Ok(locations) => {
                    collect_implementation_edges(store, node, &locations, &mut edges);
                }
                Err(e) => debug!("implementation lookup failed for {}: {e:#}", node.name),
            }
        }
    }

    let _ = client.did_close(path).await;
    Ok(edges)
}

fn collect_reference_edges(
    store: &GraphStore,
    target: &Node,
    locations: &[Location],
    edges: &mut Vec<Edge>,
) {
    let callable = matches!(target.kind.as_str(), "function" | "method");
    for location in locations {
        let Some(source) = resolve_enclosing(store, location) else {
            continue;
        };
        if source.id == target.id {
            continue;
        }
        edges.push(Edge {
            source_id: source.id.clone(),
            target_id: target.id.clone(),
            relation: Relation::References,
        });
        if callable {
            edges.push(Edge {
                source_id: source.id,
                target_id: target.id.clone(),
                relation: Relation::Calls,
            });
        }
    }
}

fn collect_implementation_edges(
    store: &GraphStore,
    target: &Node,
    locations: &[Location],
    edges: &mut Vec<Edge>,
) {
    for location in locations {
        let Some(source) = resolve_enclosing(store, location) else {
            continue;
        };
        if source.id == target.id {
            continue;
        }
        edges.push(Edge {
            source_id: source.id,
            target_id: target.id.clone(),
            relation: Relation::Implements,
        });
    }
}

/// Map an LSP location back onto the innermost indexed symbol containing
/// it. Returns None when the location is inside code the scanner did not
/// index, in which case the reference is dropped.
fn resolve_enclosing(store: &GraphStore, location: &Location) -> Option<Node> {
    let path = uri_to_path(&location.uri);
    let line = location.range.start.line + 1;
    let col = location.range.start.character;
    match store.enclosing_symbol(&path.to_string_lossy(), line, col) {
        Ok(found) => found,
        Err(e) => {
            warn!("enclosing-symbol lookup failed for {}: {e:#}", location.uri);
            None
        }
    }
}

//! MCP server: tool dispatch, the index pipeline, and resources.
//!
//! Tools: `index`, `index_status`, `get_symbols_in_file`, `find_impact`,
//! `get_symbol`. Resources: `codemap://usage-guidelines` and
//! `codemap://schemas/<tool_name>` (argument schemas inferred from the
//! parameter structs).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use rmcp::handler::server::{tool::ToolRouter, wrapper::Parameters};
use rmcp::model::{
    Annotated, CallToolResult, Content, ListResourcesResult, PaginatedRequestParams, RawResource,
    ReadResourceRequestParams, ReadResourceResult, ResourceContents, ServerCapabilities,
    ServerInfo,
};
use rmcp::schemars::{self, JsonSchema};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::enrich::Enricher;
use crate::lsp_fleet::LspFleet;
use crate::scanner;
use crate::status::{IndexPhase, IndexTracker};
use crate::store::GraphStore;

const READINESS_WAIT: Duration = Duration::from_secs(30);

const USAGE_GUIDELINES: &str = "\
# CodeMap usage guidelines

CodeMap indexes the workspace into a symbol graph and answers structural
questions about it.

- Run `index` once at the start of a session. Queries wait briefly for an
  in-flight index, so there is no need to poll.
- `get_symbols_in_file` shows the structure of one file (absolute path).
- `find_impact` lists the symbols that transitively depend on a symbol —
  use it before changing a function or type to see the blast radius.
- `get_symbol` locates a symbol by name; pass `with_source: true` to get
  its source text.
- `index_status` reports idle / in-progress / ready / failed plus the last
  error and duration.

Re-run `index` after changing files; the graph reflects the workspace as of
the last successful run.
";

// ---------------------------------------------------------------------------
// Tool parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct IndexArgs {
    /// Force a full re-index even if no changes are detected
    #[serde(default)]
    #[schemars(description = "Force a full re-index even if no changes are detected")]
    pub force: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct IndexStatusArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSymbolsInFileArgs {
    #[schemars(description = "The absolute path to the file to analyze")]
    pub file_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FindImpactArgs {
    #[schemars(description = "The name of the symbol to analyze for impact")]
    pub symbol_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSymbolArgs {
    #[schemars(description = "The name of the symbol to locate")]
    pub symbol_name: String,
    /// If true, includes the source code of the symbol in the response
    #[serde(default)]
    #[schemars(description = "If true, includes the source code of the symbol in the response")]
    pub with_source: bool,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CodemapServer {
    store: Arc<GraphStore>,
    fleet: Arc<LspFleet>,
    workspace_root: PathBuf,
    tracker: Arc<IndexTracker>,
    tool_router: ToolRouter<Self>,
}

impl std::fmt::Debug for CodemapServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodemapServer")
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}

fn text_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text.into())])
}

fn error_result(text: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(text.into())])
}

fn json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

#[tool_router]
impl CodemapServer {
    pub fn new(
        store: Arc<GraphStore>,
        fleet: Arc<LspFleet>,
        workspace_root: PathBuf,
        tracker: Arc<IndexTracker>,
    ) -> Self {
        Self {
            store,
            fleet,
            workspace_root,
            tracker,
            tool_router: Self::tool_router(),
        }
    }

    /// scan → upsert nodes → prune → enrich → upsert edges. Returns the
    /// node and edge counts for the summary line.
    pub async fn run_pipeline(&self) -> Result<(usize, usize)> {
        let root = self.workspace_root.clone();
        let nodes = tokio::task::spawn_blocking(move || scanner::scan(&root))
            .await
            .context("scan task panicked")?
            .context("scan failed")?;
        info!("scan found {} symbols", nodes.len());

        let valid_files: HashSet<String> = nodes.iter().map(|n| n.file_path.clone()).collect();

        {
            let store = self.store.clone();
            let nodes = nodes.clone();
            tokio::task::spawn_blocking(move || store.bulk_upsert_nodes(&nodes))
                .await
                .context("node upsert task panicked")?
                .context("failed to store nodes")?;
        }

        // Prune is best-effort; a failure leaves stale rows but the run
        // continues.
        match self.store.prune_stale_files(&valid_files) {
            Ok(removed) if removed > 0 => info!("pruned {removed} stale symbol(s)"),
            Ok(_) => {}
            Err(e) => warn!("failed to prune stale files: {e:#}"),
        }

        let enricher = Enricher::new(self.fleet.clone());
        let edges = enricher
            .enrich(&nodes, &self.store)
            .await
            .context("enrichment failed")?;
        self.store
            .bulk_upsert_edges(&edges)
            .context("failed to store edges")?;

        Ok((nodes.len(), edges.len()))
    }

    /// One full index run with status/readiness bookkeeping. Shared by the
    /// `index` tool and tests.
    pub async fn run_index(&self) -> CallToolResult {
        let guard = match self.tracker.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return error_result("Indexing already in progress"),
        };
        self.tracker.begin();
        let started = Instant::now();
        let outcome = self.run_pipeline().await;
        let duration = started.elapsed();
        let result = match outcome {
            Ok((node_count, edge_count)) => {
                self.tracker.finish_ready(duration);
                text_result(format!(
                    "Indexed {} nodes and {} edges in {:.2}s",
                    node_count,
                    edge_count,
                    duration.as_secs_f64()
                ))
            }
            Err(e) => {
                warn!("index run failed: {e:#}");
                self.tracker.finish_failed(format!("{e:#}"), duration);
                error_result(format!("Indexing failed: {e:#}"))
            }
        };
        drop(guard);
        result
    }

    /// Block until the index is ready, or explain why it is not.
    async fn ensure_ready(&self) -> Result<(), CallToolResult> {
        if self.tracker.wait_ready(READINESS_WAIT).await {
            return Ok(());
        }
        let state = self.tracker.snapshot();
        Err(match state.phase {
            IndexPhase::InProgress => error_result("Indexing in progress, please try again"),
            IndexPhase::Failed => error_result(format!(
                "Indexing failed: {}",
                state.last_error.unwrap_or_else(|| "unknown error".into())
            )),
            _ => error_result("Index has not been built yet. Run the index tool first."),
        })
    }

    #[tool(
        name = "index",
        description = "Scans the workspace and updates the code graph"
    )]
    async fn index(
        &self,
        Parameters(args): Parameters<IndexArgs>,
    ) -> Result<CallToolResult, McpError> {
        // Every run is a full re-scan; `force` exists for callers that want
        // to re-index an already-ready workspace explicitly.
        let _ = args.force;
        Ok(self.run_index().await)
    }

    #[tool(
        name = "index_status",
        description = "Returns the current indexing status of the workspace"
    )]
    async fn index_status(
        &self,
        Parameters(_args): Parameters<IndexStatusArgs>,
    ) -> Result<CallToolResult, McpError> {
        let state = self.tracker.snapshot();
        let mut status = json!({ "status": state.phase.as_str() });
        if let Some(duration) = state.last_duration {
            status["duration_seconds"] = json!(duration.as_secs_f64());
        }
        if let Some(error) = state.last_error {
            status["error"] = json!(error);
        }
        Ok(text_result(json_text(&status)))
    }

    #[tool(
        name = "get_symbols_in_file",
        description = "Returns the structure of a file"
    )]
    async fn get_symbols_in_file(
        &self,
        Parameters(args): Parameters<GetSymbolsInFileArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(result) = self.ensure_ready().await {
            return Ok(result);
        }
        let nodes = match self.store.symbols_in_file(&args.file_path) {
            Ok(nodes) => nodes,
            Err(e) => return Ok(error_result(format!("Query failed: {e:#}"))),
        };
        let listing: Vec<_> = nodes
            .iter()
            .map(|n| {
                json!({
                    "name": n.name,
                    "kind": n.kind,
                    "range": format!(
                        "{}:{}-{}:{}",
                        n.line_start, n.col_start, n.line_end, n.col_end
                    ),
                })
            })
            .collect();
        Ok(text_result(json_text(&listing)))
    }

    #[tool(
        name = "find_impact",
        description = "Finds downstream dependents of a symbol"
    )]
    async fn find_impact(
        &self,
        Parameters(args): Parameters<FindImpactArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(result) = self.ensure_ready().await {
            return Ok(result);
        }
        let nodes = match self.store.find_impact(&args.symbol_name) {
            Ok(nodes) => nodes,
            Err(e) => return Ok(error_result(format!("Query failed: {e:#}"))),
        };
        if nodes.is_empty() {
            return Ok(text_result("No impacted symbols found."));
        }
        let impacted: Vec<_> = nodes
            .iter()
            .map(|n| json!({ "name": n.name, "file_path": n.file_path, "kind": n.kind }))
            .collect();
        Ok(text_result(json_text(&impacted)))
    }

    #[tool(
        name = "get_symbol",
        description = "Finds the location and optionally the source code of a symbol"
    )]
    async fn get_symbol(
        &self,
        Parameters(args): Parameters<GetSymbolArgs>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(result) = self.ensure_ready().await {
            return Ok(result);
        }
        let nodes = match self.store.symbol_locations(&args.symbol_name) {
            Ok(nodes) => nodes,
            Err(e) => return Ok(error_result(format!("Query failed: {e:#}"))),
        };
        if nodes.is_empty() {
            return Ok(text_result("Symbol not found."));
        }
        let mut records = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut record = serde_json::to_value(node).unwrap_or_else(|_| json!({}));
            if args.with_source {
                match read_source(&node.file_path, node.line_start, node.line_end) {
                    Ok(source) => {
                        record["source"] = json!(source);
                    }
                    Err(e) => warn!(
                        "failed to read source for {} in {}: {e:#}",
                        node.name, node.file_path
                    ),
                }
            }
            records.push(record);
        }
        Ok(text_result(json_text(&records)))
    }
}

/// The exact substring of the file from `line_start` to `line_end`
/// inclusive, internal newlines preserved, no trailing newline.
pub fn read_source(file_path: &str, line_start: u32, line_end: u32) -> Result<String> {
    let contents =
        std::fs::read_to_string(file_path).with_context(|| format!("open {file_path}"))?;
    let start = line_start.max(1) as usize;
    let end = line_end as usize;
    let lines: Vec<&str> = contents
        .lines()
        .skip(start - 1)
        .take(end.saturating_sub(start) + 1)
        .collect();
    Ok(lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

const GUIDELINES_URI: &str = "codemap://usage-guidelines";
const SCHEMA_URI_PREFIX: &str = "codemap://schemas/";

fn schema_map() -> HashMap<&'static str, String> {
    fn entry<T: JsonSchema>(map: &mut HashMap<&'static str, String>, name: &'static str) {
        let schema = schemars::schema_for!(T);
        map.insert(name, json_text(&schema));
    }
    let mut map = HashMap::new();
    entry::<IndexArgs>(&mut map, "index");
    entry::<IndexStatusArgs>(&mut map, "index_status");
    entry::<GetSymbolsInFileArgs>(&mut map, "get_symbols_in_file");
    entry::<FindImpactArgs>(&mut map, "find_impact");
    entry::<GetSymbolArgs>(&mut map, "get_symbol");
    map
}

fn resource(uri: &str, name: &str, description: &str, mime_type: &str) -> Annotated<RawResource> {
    Annotated::new(
        RawResource {
            uri: uri.into(),
            name: name.into(),
            title: None,
            description: Some(description.into()),
            mime_type: Some(mime_type.into()),
            size: None,
            icons: None,
            meta: None,
        },
        None,
    )
}

#[tool_handler]
impl ServerHandler for CodemapServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(USAGE_GUIDELINES.into()),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: rmcp::model::Implementation {
                name: "codemap".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let mut resources = vec![resource(
            GUIDELINES_URI,
            "Usage Guidelines",
            "System prompt and usage guidelines for the CodeMap MCP server",
            "text/markdown",
        )];
        // codemap://schemas/{tool_name}: one entry per registered tool.
        for tool_name in schema_map().keys() {
            resources.push(resource(
                &format!("{SCHEMA_URI_PREFIX}{tool_name}"),
                &format!("{tool_name} schema"),
                "JSON schema for the named tool's arguments",
                "application/schema+json",
            ));
        }
        resources.sort_by(|a, b| a.raw.uri.cmp(&b.raw.uri));
        Ok(ListResourcesResult {
            meta: None,
            next_cursor: None,
            resources,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = request.uri.as_str();
        if uri == GUIDELINES_URI {
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(USAGE_GUIDELINES, GUIDELINES_URI)],
            });
        }
        if let Some(tool_name) = uri.strip_prefix(SCHEMA_URI_PREFIX) {
            if let Some(schema) = schema_map().get(tool_name) {
                return Ok(ReadResourceResult {
                    contents: vec![ResourceContents::text(schema.clone(), uri)],
                });
            }
            return Err(McpError::resource_not_found(
                format!("unknown tool schema: {tool_name:?}"),
                None,
            ));
        }
        Err(McpError::resource_not_found(
            format!("Unknown resource: {uri}"),
            None,
        ))
    }
}

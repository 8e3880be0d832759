//! CodeMap: a code-intelligence MCP server.
//!
//! The workspace is scanned with tree-sitter into a persistent symbol
//! graph, which an LSP-driven enrichment phase decorates with
//! calls/implements/references edges; MCP tools query the result.

pub mod enrich;
pub mod graph;
pub mod language;
pub mod lsp_client;
pub mod lsp_fleet;
pub mod lsp_types;
pub mod scanner;
pub mod server;
pub mod status;
pub mod store;
pub mod toolchain;
pub mod transport;
pub mod workspace;

pub use server::CodemapServer;

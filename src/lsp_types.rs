//! Minimal LSP wire types used by the client: positions, locations, and
//! document symbols. Everything else rides through `serde_json::Value`.

use serde::{Deserialize, Serialize};

/// Zero-based line/character position, as on the LSP wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

/// Hierarchical symbol as returned by textDocument/documentSymbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSymbol {
    pub name: String,
    #[serde(default)]
    pub kind: u32,
    pub range: Range,
    #[serde(rename = "selectionRange")]
    pub selection_range: Range,
    #[serde(default)]
    pub children: Vec<DocumentSymbol>,
}

impl DocumentSymbol {
    /// Depth-first flattening, callers that want a flat list use this.
    pub fn flatten(symbols: Vec<DocumentSymbol>) -> Vec<DocumentSymbol> {
        let mut out = Vec::new();
        let mut stack: Vec<DocumentSymbol> = symbols.into_iter().rev().collect();
        while let Some(mut symbol) = stack.pop() {
            let children = std::mem::take(&mut symbol.children);
            out.push(symbol);
            for child in children.into_iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

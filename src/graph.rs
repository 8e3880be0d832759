//! Graph model: symbol nodes, relationship edges, and deterministic IDs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A symbol definition discovered by the scanner.
///
/// Lines are 1-based, columns 0-based (tree-sitter convention); the same
/// convention is used everywhere a position crosses a module boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub col_start: u32,
    pub col_end: u32,
    pub symbol_uri: String,
}

/// A directed relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source_id: String,
    pub target_id: String,
    pub relation: Relation,
}

/// The closed relation vocabulary. String form is used only at the storage
/// and wire boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Calls,
    Implements,
    References,
    Imports,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Calls => "calls",
            Relation::Implements => "implements",
            Relation::References => "references",
            Relation::Imports => "imports",
        }
    }
}

impl std::str::FromStr for Relation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calls" => Ok(Relation::Calls),
            "implements" => Ok(Relation::Implements),
            "references" => Ok(Relation::References),
            "imports" => Ok(Relation::Imports),
            other => Err(anyhow::anyhow!("unknown relation: {other}")),
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic node identifier: sha256 over `"<file_path>:<symbol_name>"`.
/// Re-scans of the same file always produce the same ID.
pub fn node_id(file_path: &str, symbol_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update(b":");
    hasher.update(symbol_name.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn node_id_is_deterministic() {
        let inputs = [
            ("/abs/a.go", "Foo"),
            ("/abs/a.go", "foo"),
            ("/abs/b.go", "Foo"),
            ("/weird/path with spaces/x.ts", "доброе-имя"),
            ("", ""),
        ];
        for (path, name) in inputs {
            assert_eq!(node_id(path, name), node_id(path, name));
        }
    }

    #[test]
    fn node_id_distinguishes_path_and_name() {
        assert_ne!(node_id("/a.go", "Foo"), node_id("/a.go", "Bar"));
        assert_ne!(node_id("/a.go", "Foo"), node_id("/b.go", "Foo"));
        // The separator keeps ("a:b", "c") and ("a", "b:c") from colliding
        // only when the full strings differ; identical concatenations with a
        // different split are accepted, matching the original scheme.
        assert_eq!(node_id("/a.go", "Foo").len(), 64);
    }

    #[test]
    fn relation_round_trips_through_strings() {
        for rel in [
            Relation::Calls,
            Relation::Implements,
            Relation::References,
            Relation::Imports,
        ] {
            assert_eq!(Relation::from_str(rel.as_str()).unwrap(), rel);
        }
        assert!(Relation::from_str("extends").is_err());
    }
}

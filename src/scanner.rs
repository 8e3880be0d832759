//! Workspace scanner: walk the tree, parse each source file with its
//! tree-sitter grammar, and emit symbol nodes from the per-language
//! definition query.
//!
//! The scanner is pure — no network, no LSP. File parsing is embarrassingly
//! parallel; files are extracted on the rayon pool (one worker per CPU by
//! default). A parse or read error on a single file is logged and the file
//! skipped; only an unreadable root aborts the scan.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ignore::WalkBuilder;
use rayon::prelude::*;
use tracing::{debug, warn};
use tree_sitter::{Parser, QueryCursor, StreamingIterator};
use url::Url;

use crate::graph::{self, Node};
use crate::language::{self, LanguageSpec};

/// Dependency and build-output directories skipped on top of the walker's
/// hidden-entry filtering (which already covers VCS metadata like `.git`).
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "target",
    "__pycache__",
    "dist",
    "build",
    "zig-out",
    "zig-cache",
];

/// Scan the workspace rooted at `root` and return every symbol definition
/// found by the per-language queries.
pub fn scan(root: &Path) -> Result<Vec<Node>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("workspace root {} is not readable", root.display()))?;
    if !root.is_dir() {
        return Err(anyhow!("workspace root {} is not a directory", root.display()));
    }

    let files = collect_files(&root);
    debug!("scanning {} source files under {}", files.len(), root.display());

    let nodes: Vec<Node> = files
        .into_par_iter()
        .map_init(Parser::new, |parser, (path, spec)| {
            match extract_file(parser, &path, spec) {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!("skipping {}: {e:#}", path.display());
                    Vec::new()
                }
            }
        })
        .flatten()
        .collect();

    Ok(nodes)
}

fn collect_files(root: &Path) -> Vec<(PathBuf, &'static LanguageSpec)> {
    let walker = WalkBuilder::new(root)
        .follow_links(false)
        .git_global(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_some_and(|t| t.is_dir()) && SKIP_DIRS.contains(&name.as_ref()))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("walk error: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if let Some(spec) = language::from_path(entry.path()) {
            files.push((entry.into_path(), spec));
        }
    }
    files
}

fn extract_file(parser: &mut Parser, path: &Path, spec: &LanguageSpec) -> Result<Vec<Node>> {
    let Some(query) = spec.definition_query() else {
        // Query failed to compile against the linked grammar; already logged.
        return Ok(Vec::new());
    };

    let source = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    parser
        .set_language(&spec.grammar())
        .with_context(|| format!("load {} grammar", spec.language))?;
    let tree = parser
        .parse(&source, None)
        .ok_or_else(|| anyhow!("tree-sitter could not parse {}", path.display()))?;

    let def_index = query
        .capture_index_for_name("def")
        .ok_or_else(|| anyhow!("{} query has no @def capture", spec.language))?;
    let name_index = query
        .capture_index_for_name("name")
        .ok_or_else(|| anyhow!("{} query has no @name capture", spec.language))?;

    let file_path = path.to_string_lossy().to_string();
    let symbol_uri = path_to_uri(path);
    let bytes = source.as_bytes();

    let mut nodes = Vec::new();
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(query, tree.root_node(), bytes);
    while let Some(m) = matches.next() {
        let mut def_node = None;
        let mut name = None;
        for capture in m.captures {
            if capture.index == def_index {
                def_node = Some(capture.node);
            } else if capture.index == name_index {
                name = capture.node.utf8_text(bytes).ok();
            }
        }
        let (Some(def), Some(name)) = (def_node, name) else {
            continue;
        };
        nodes.push(Node {
            id: graph::node_id(&file_path, name),
            name: name.to_string(),
            kind: kind_for(def.kind()).to_string(),
            file_path: file_path.clone(),
            line_start: def.start_position().row as u32 + 1,
            line_end: def.end_position().row as u32 + 1,
            col_start: def.start_position().column as u32,
            col_end: def.end_position().column as u32,
            symbol_uri: symbol_uri.clone(),
        });
    }
    Ok(nodes)
}

/// Kind inferred from the captured definition node's AST kind.
fn kind_for(ast_kind: &str) -> &str {
    match ast_kind {
        "function_declaration" | "function_definition" => "function",
        "method_declaration" | "method_definition" => "method",
        "class_declaration" | "class_definition" => "class",
        "type_declaration" | "type_alias_declaration" => "type",
        "interface_declaration" => "interface",
        "variable_declarator" | "variable_declaration" | "assignment_statement" => "variable",
        other => other,
    }
}

/// `file://` form of an absolute path.
pub fn path_to_uri(path: &Path) -> String {
    Url::from_file_path(path)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("file://{}", path.display()))
}

/// Inverse of [`path_to_uri`]; non-file URIs come back unchanged.
pub fn uri_to_path(uri: &str) -> PathBuf {
    if let Ok(url) = Url::parse(uri) {
        if let Ok(path) = url.to_file_path() {
            return path;
        }
    }
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    const GO_SRC: &str = "package main\n\nfunc Foo() int {\n\treturn 1\n}\n\ntype Bar struct{}\n\nfunc (b Bar) Baz() {}\n";

    #[test]
    fn scans_go_definitions() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.go", GO_SRC);

        let nodes = scan(dir.path()).unwrap();
        let mut found: Vec<(&str, &str)> = nodes
            .iter()
            .map(|n| (n.name.as_str(), n.kind.as_str()))
            .collect();
        found.sort();
        assert_eq!(
            found,
            [("Bar", "type"), ("Baz", "method"), ("Foo", "function")]
        );

        let foo = nodes.iter().find(|n| n.name == "Foo").unwrap();
        assert_eq!(foo.line_start, 3);
        assert_eq!(foo.line_end, 5);
        assert!(foo.symbol_uri.starts_with("file://"));
        assert!(Path::new(&foo.file_path).is_absolute());
    }

    #[test]
    fn scans_typescript_and_python() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "app.ts",
            "interface Shape { area(): number }\n\nclass Circle {\n  area(): number { return 0 }\n}\n\ntype Alias = string\n\nfunction draw() {}\n",
        );
        write(
            dir.path(),
            "util.py",
            "def helper():\n    pass\n\nclass Widget:\n    def render(self):\n        pass\n",
        );

        let nodes = scan(dir.path()).unwrap();
        let kind_of = |name: &str| {
            nodes
                .iter()
                .find(|n| n.name == name)
                .map(|n| n.kind.clone())
                .unwrap_or_else(|| panic!("missing node {name}"))
        };
        assert_eq!(kind_of("Shape"), "interface");
        assert_eq!(kind_of("Circle"), "class");
        assert_eq!(kind_of("Alias"), "type");
        assert_eq!(kind_of("draw"), "function");
        assert_eq!(kind_of("helper"), "function");
        assert_eq!(kind_of("Widget"), "class");
        assert_eq!(kind_of("render"), "function");
    }

    #[test]
    fn scan_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.go", GO_SRC);
        write(dir.path(), "b.py", "def one():\n    pass\n");

        let sort_key = |n: &Node| (n.id.clone(), n.line_start, n.col_start);
        let mut first = scan(dir.path()).unwrap();
        let mut second = scan(dir.path()).unwrap();
        first.sort_by_key(sort_key);
        second.sort_by_key(sort_key);
        assert_eq!(first, second);
    }

    #[test]
    fn skips_unknown_extensions_and_ignored_dirs() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "notes.txt", "not source");
        write(dir.path(), "data.xyz", "binaryish");
        write(dir.path(), "node_modules/dep/index.js", "function hidden() {}\n");
        write(dir.path(), ".hidden/secret.go", "package p\nfunc Hidden() {}\n");
        write(dir.path(), "ok.go", "package p\nfunc Visible() {}\n");

        let nodes = scan(dir.path()).unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["Visible"]);
    }

    #[test]
    fn empty_workspace_scans_clean() {
        let dir = TempDir::new().unwrap();
        assert!(scan(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_root_errors() {
        assert!(scan(Path::new("/definitely/not/a/real/root")).is_err());
    }

    #[test]
    fn malformed_file_does_not_abort_scan() {
        let dir = TempDir::new().unwrap();
        // Invalid UTF-8 forces a read error for that file only.
        fs::write(dir.path().join("bad.go"), [0xff, 0xfe, 0x00, 0x9f]).unwrap();
        write(dir.path(), "good.go", "package p\nfunc Fine() {}\n");

        let nodes = scan(dir.path()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "Fine");
    }

    #[test]
    fn uri_round_trip() {
        let path = Path::new("/some/dir/file.go");
        let uri = path_to_uri(path);
        assert_eq!(uri, "file:///some/dir/file.go");
        assert_eq!(uri_to_path(&uri), path);
    }
}

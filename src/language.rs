//! Per-language descriptor table.
//!
//! Everything language-specific lives in one row per language: file
//! extensions, the tree-sitter grammar and definition query, the LSP
//! executable and its arguments, and the LSP `languageId`. Adding a
//! language means adding a row.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;
use tree_sitter::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Go,
    TypeScript,
    JavaScript,
    Python,
    Lua,
    Zig,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Lua => "lua",
            Language::Zig => "zig",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct LanguageSpec {
    pub language: Language,
    pub extensions: &'static [&'static str],
    /// LSP `languageId` sent in textDocument/didOpen.
    pub language_id: &'static str,
    pub server_command: &'static str,
    pub server_args: &'static [&'static str],
    grammar: fn() -> tree_sitter::Language,
    query_source: &'static str,
}

impl LanguageSpec {
    pub fn grammar(&self) -> tree_sitter::Language {
        (self.grammar)()
    }

    /// The compiled definition query, or None if the query failed to
    /// compile against the linked grammar (logged once; the scanner then
    /// skips files of this language).
    pub fn definition_query(&self) -> Option<&'static Query> {
        COMPILED_QUERIES.get(&self.language).and_then(|q| q.as_ref())
    }
}

fn go_grammar() -> tree_sitter::Language {
    tree_sitter_go::LANGUAGE.into()
}

fn typescript_grammar() -> tree_sitter::Language {
    tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
}

fn javascript_grammar() -> tree_sitter::Language {
    tree_sitter_javascript::LANGUAGE.into()
}

fn python_grammar() -> tree_sitter::Language {
    tree_sitter_python::LANGUAGE.into()
}

fn lua_grammar() -> tree_sitter::Language {
    tree_sitter_lua::LANGUAGE.into()
}

fn zig_grammar() -> tree_sitter::Language {
    tree_sitter_zig::LANGUAGE.into()
}

/// The fixed definition queries. Each match captures the definition node as
/// `@def` and its name identifier as `@name`.
static LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        language: Language::Go,
        extensions: &["go"],
        language_id: "go",
        server_command: "gopls",
        server_args: &["serve", "-mode=stdio"],
        grammar: go_grammar,
        query_source: "
            (function_declaration name: (identifier) @name) @def
            (method_declaration name: (field_identifier) @name) @def
            (type_declaration (type_spec name: (type_identifier) @name)) @def
        ",
    },
    LanguageSpec {
        language: Language::TypeScript,
        extensions: &["ts", "tsx"],
        language_id: "typescript",
        server_command: "typescript-language-server",
        server_args: &["--stdio"],
        grammar: typescript_grammar,
        query_source: "
            (function_declaration name: (identifier) @name) @def
            (class_declaration name: (type_identifier) @name) @def
            (method_definition name: (property_identifier) @name) @def
            (interface_declaration name: (type_identifier) @name) @def
            (type_alias_declaration name: (type_identifier) @name) @def
        ",
    },
    LanguageSpec {
        language: Language::JavaScript,
        extensions: &["js", "jsx", "mjs", "cjs"],
        language_id: "javascript",
        server_command: "typescript-language-server",
        server_args: &["--stdio"],
        grammar: javascript_grammar,
        query_source: "
            (function_declaration name: (identifier) @name) @def
            (class_declaration name: (identifier) @name) @def
            (method_definition name: (property_identifier) @name) @def
            (variable_declarator name: (identifier) @name) @def
        ",
    },
    LanguageSpec {
        language: Language::Python,
        extensions: &["py", "pyi"],
        language_id: "python",
        server_command: "pylsp",
        server_args: &[],
        grammar: python_grammar,
        query_source: "
            (function_definition name: (identifier) @name) @def
            (class_definition name: (identifier) @name) @def
        ",
    },
    LanguageSpec {
        language: Language::Lua,
        extensions: &["lua"],
        language_id: "lua",
        server_command: "lua-language-server",
        server_args: &[],
        grammar: lua_grammar,
        query_source: "
            (function_declaration name: [
                (identifier)
                (dot_index_expression)
                (method_index_expression)
            ] @name) @def
        ",
    },
    LanguageSpec {
        language: Language::Zig,
        extensions: &["zig"],
        language_id: "zig",
        server_command: "zls",
        server_args: &[],
        grammar: zig_grammar,
        query_source: "
            (function_declaration (identifier) @name) @def
        ",
    },
];

static EXTENSION_MAP: Lazy<HashMap<&'static str, &'static LanguageSpec>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for spec in LANGUAGES {
        for ext in spec.extensions {
            map.insert(*ext, spec);
        }
    }
    map
});

static COMPILED_QUERIES: Lazy<HashMap<Language, Option<Query>>> = Lazy::new(|| {
    LANGUAGES
        .iter()
        .map(|spec| {
            let query = match Query::new(&spec.grammar(), spec.query_source) {
                Ok(q) => Some(q),
                Err(e) => {
                    warn!(
                        "definition query for {} failed to compile: {e}",
                        spec.language
                    );
                    None
                }
            };
            (spec.language, query)
        })
        .collect()
});

pub fn all_specs() -> &'static [LanguageSpec] {
    LANGUAGES
}

pub fn spec_for(language: Language) -> Option<&'static LanguageSpec> {
    LANGUAGES.iter().find(|s| s.language == language)
}

pub fn from_extension(ext: &str) -> Option<&'static LanguageSpec> {
    EXTENSION_MAP.get(ext).copied()
}

pub fn from_path(path: &Path) -> Option<&'static LanguageSpec> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(from_extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup() {
        assert_eq!(from_extension("go").unwrap().language, Language::Go);
        assert_eq!(
            from_extension("tsx").unwrap().language,
            Language::TypeScript
        );
        assert_eq!(
            from_extension("mjs").unwrap().language,
            Language::JavaScript
        );
        assert!(from_extension("rs").is_none());
        assert!(from_extension("txt").is_none());
    }

    #[test]
    fn path_lookup() {
        assert_eq!(
            from_path(Path::new("/work/src/app.py")).unwrap().language,
            Language::Python
        );
        assert!(from_path(Path::new("/work/Makefile")).is_none());
    }

    #[test]
    fn definition_queries_compile() {
        for lang in [
            Language::Go,
            Language::TypeScript,
            Language::JavaScript,
            Language::Python,
        ] {
            assert!(
                spec_for(lang).unwrap().definition_query().is_some(),
                "query for {lang} did not compile"
            );
        }
    }
}

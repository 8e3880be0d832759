//! Persistent graph store backed by SQLite.
//!
//! Two tables: `nodes` keyed by id and `edges` keyed by the full
//! (source, target, relation) triple, with secondary indices on node
//! `file_path` and `name`. Every bulk operation runs in a single
//! transaction, so concurrent readers see either the pre-call or the
//! post-call state, never a partial write.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

use crate::graph::{Edge, Node, Relation};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS nodes (
        id         TEXT PRIMARY KEY,
        name       TEXT NOT NULL,
        kind       TEXT NOT NULL,
        file_path  TEXT NOT NULL,
        line_start INTEGER NOT NULL,
        line_end   INTEGER NOT NULL,
        col_start  INTEGER NOT NULL,
        col_end    INTEGER NOT NULL,
        symbol_uri TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_file_path ON nodes(file_path);
    CREATE INDEX IF NOT EXISTS idx_nodes_name ON nodes(name);
    CREATE TABLE IF NOT EXISTS edges (
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        relation  TEXT NOT NULL,
        PRIMARY KEY (source_id, target_id, relation)
    );
    CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
";

pub struct GraphStore {
    conn: Mutex<Connection>,
}

impl GraphStore {
    /// Open (or create) the store inside `dir`. The directory is created if
    /// missing; the database file is `graph.db`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create store directory {}", dir.display()))?;
        let db_path = dir.join("graph.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("open sqlite db at {}", db_path.display()))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory sqlite db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA).context("apply graph schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace each node by its ID, atomically.
    pub fn bulk_upsert_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO nodes
                 (id, name, kind, file_path, line_start, line_end, col_start, col_end, symbol_uri)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for n in nodes {
                stmt.execute(params![
                    n.id,
                    n.name,
                    n.kind,
                    n.file_path,
                    n.line_start,
                    n.line_end,
                    n.col_start,
                    n.col_end,
                    n.symbol_uri,
                ])?;
            }
        }
        tx.commit().context("commit node upsert")
    }

    /// Insert edges; duplicate (source, target, relation) triples collapse
    /// silently onto the primary key.
    pub fn bulk_upsert_edges(&self, edges: &[Edge]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO edges (source_id, target_id, relation) VALUES (?1, ?2, ?3)",
            )?;
            for e in edges {
                stmt.execute(params![e.source_id, e.target_id, e.relation.as_str()])?;
            }
        }
        tx.commit().context("commit edge upsert")
    }

    /// Remove every node whose file path is outside `valid_files`, along
    /// with every edge touching a removed node. One transaction; the
    /// removed-id set is computed first.
    pub fn prune_stale_files(&self, valid_files: &HashSet<String>) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let removed: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id, file_path FROM nodes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut removed = Vec::new();
            for row in rows {
                let (id, file_path) = row?;
                if !valid_files.contains(&file_path) {
                    removed.push(id);
                }
            }
            removed
        };
        {
            let mut del_edges = tx
                .prepare_cached("DELETE FROM edges WHERE source_id = ?1 OR target_id = ?1")?;
            let mut del_node = tx.prepare_cached("DELETE FROM nodes WHERE id = ?1")?;
            for id in &removed {
                del_edges.execute(params![id])?;
                del_node.execute(params![id])?;
            }
        }
        tx.commit().context("commit prune")?;
        Ok(removed.len())
    }

    /// All nodes in a file, in document order.
    pub fn symbols_in_file(&self, file_path: &str) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, kind, file_path, line_start, line_end, col_start, col_end, symbol_uri
             FROM nodes WHERE file_path = ?1
             ORDER BY line_start, col_start",
        )?;
        let rows = stmt.query_map(params![file_path], node_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read symbols in file")
    }

    /// All nodes with the exact given name.
    pub fn symbol_locations(&self, symbol_name: &str) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, kind, file_path, line_start, line_end, col_start, col_end, symbol_uri
             FROM nodes WHERE name = ?1
             ORDER BY file_path, line_start",
        )?;
        let rows = stmt.query_map(params![symbol_name], node_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read symbol locations")
    }

    /// Reverse-reachable set from every node named `symbol_name`, walking
    /// edges backward through {calls, references, implements}. Cycles are
    /// tolerated via the visited set; output order is stable.
    pub fn find_impact(&self, symbol_name: &str) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let seeds: Vec<String> = {
            let mut stmt = conn.prepare_cached("SELECT id FROM nodes WHERE name = ?1")?;
            let rows = stmt.query_map(params![symbol_name], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut visited: HashSet<String> = seeds.iter().cloned().collect();
        let mut frontier = seeds;
        let mut impacted: Vec<String> = Vec::new();
        let mut stmt = conn.prepare_cached(
            "SELECT source_id FROM edges
             WHERE target_id = ?1 AND relation IN ('calls', 'references', 'implements')",
        )?;
        while let Some(target) = frontier.pop() {
            let sources = stmt
                .query_map(params![target], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            for source in sources {
                if visited.insert(source.clone()) {
                    impacted.push(source.clone());
                    frontier.push(source);
                }
            }
        }

        let mut nodes = Vec::with_capacity(impacted.len());
        let mut by_id = conn.prepare_cached(
            "SELECT id, name, kind, file_path, line_start, line_end, col_start, col_end, symbol_uri
             FROM nodes WHERE id = ?1",
        )?;
        for id in impacted {
            if let Some(node) = by_id
                .query_map(params![id], node_from_row)?
                .next()
                .transpose()?
            {
                nodes.push(node);
            }
        }
        nodes.sort_by(|a, b| {
            (&a.file_path, a.line_start, &a.id).cmp(&(&b.file_path, b.line_start, &b.id))
        });
        Ok(nodes)
    }

    /// The innermost node in `file_path` whose range contains the position
    /// (1-based line, 0-based column). Used by the enricher to map reference
    /// locations back onto indexed symbols.
    pub fn enclosing_symbol(&self, file_path: &str, line: u32, col: u32) -> Result<Option<Node>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, kind, file_path, line_start, line_end, col_start, col_end, symbol_uri
             FROM nodes
             WHERE file_path = ?1
               AND (line_start < ?2 OR (line_start = ?2 AND col_start <= ?3))
               AND (line_end > ?2 OR (line_end = ?2 AND col_end >= ?3))
             ORDER BY (line_end - line_start) ASC, (col_end - col_start) ASC
             LIMIT 1",
        )?;
        let node = stmt
            .query_map(params![file_path, line, col], node_from_row)?
            .next()
            .transpose()
            .context("read enclosing symbol")?;
        Ok(node)
    }

    pub fn node_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn edge_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// All edges, used by tests and the prune invariant checks.
    pub fn all_edges(&self) -> Result<Vec<Edge>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached("SELECT source_id, target_id, relation FROM edges")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut edges = Vec::new();
        for row in rows {
            let (source_id, target_id, relation) = row?;
            edges.push(Edge {
                source_id,
                target_id,
                relation: Relation::from_str(&relation)?,
            });
        }
        Ok(edges)
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        file_path: row.get(3)?,
        line_start: row.get(4)?,
        line_end: row.get(5)?,
        col_start: row.get(6)?,
        col_end: row.get(7)?,
        symbol_uri: row.get(8)?,
    })
}

//! Client for a single language-server subprocess.
//!
//! One spawned reader task reads framed messages off the server's stdout and
//! routes them: responses complete the matching waiter, server-initiated
//! requests are answered inline, notifications are dropped. Requests from
//! any number of concurrent callers are serialized on the write side by a
//! mutex around stdin and fanned back out through the per-ID waiter map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use url::Url;

use crate::language::{Language, LanguageSpec};
use crate::lsp_types::{DocumentSymbol, Location};
use crate::transport;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Waiters = Arc<DashMap<i64, oneshot::Sender<Result<Value>>>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct LspClient {
    language: Language,
    writer: SharedWriter,
    waiters: Waiters,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    initialized: Mutex<bool>,
    /// Open documents and their sync versions; double-open is a no-op.
    open_docs: Mutex<HashMap<PathBuf, i64>>,
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("language", &self.language)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LspClient {
    /// Spawn the language-server subprocess described by `spec` with its
    /// working directory at the workspace root, and start the dispatcher.
    pub fn spawn(spec: &LanguageSpec, command: &Path, workspace_root: &Path) -> Result<Self> {
        info!(
            "starting {} language server: {} {}",
            spec.language,
            command.display(),
            spec.server_args.join(" ")
        );
        let mut child = Command::new(command)
            .args(spec.server_args)
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", command.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin pipe for {}", spec.language))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout pipe for {}", spec.language))?;
        if let Some(stderr) = child.stderr.take() {
            let language = spec.language;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "lsp_stderr", "{language}: {line}");
                }
            });
        }

        Ok(Self::from_transport_inner(
            spec.language,
            stdout,
            stdin,
            Some(child),
        ))
    }

    /// Build a client over arbitrary streams. Used by tests to drive the
    /// dispatcher against an in-process fake server.
    pub fn from_transport<R, W>(language: Language, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_transport_inner(language, reader, writer, None)
    }

    fn from_transport_inner<R, W>(
        language: Language,
        reader: R,
        writer: W,
        child: Option<Child>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let waiters: Waiters = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(dispatch_loop(
            language,
            BufReader::new(Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>),
            writer.clone(),
            waiters.clone(),
            closed.clone(),
        ));

        Self {
            language,
            writer,
            waiters,
            next_id: AtomicI64::new(1),
            closed,
            child: Mutex::new(child),
            initialized: Mutex::new(false),
            open_docs: Mutex::new(HashMap::new()),
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Send `initialize` with minimal client capabilities, wait for the
    /// result, then send the `initialized` notification. Idempotent.
    pub async fn initialize(&self, root: &Path) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let root_uri = Url::from_file_path(&root)
            .map_err(|_| anyhow!("workspace root {} is not absolute", root.display()))?;
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri.to_string(),
            "workspaceFolders": [{
                "uri": root_uri.to_string(),
                "name": root.file_name().and_then(|n| n.to_str()).unwrap_or("workspace"),
            }],
            "capabilities": {
                "textDocument": {
                    "definition": { "dynamicRegistration": false },
                    "references": { "dynamicRegistration": false },
                    "implementation": { "dynamicRegistration": false },
                    "documentSymbol": { "dynamicRegistration": false },
                },
                "workspace": {
                    "workspaceFolders": true,
                },
            },
        });
        self.request("initialize", params).await?;
        self.notify("initialized", json!({})).await?;
        *initialized = true;
        info!("{} language server initialized at {}", self.language, root.display());
        Ok(())
    }

    pub async fn did_open(&self, path: &Path, language_id: &str, text: &str) -> Result<()> {
        let mut docs = self.open_docs.lock().await;
        if docs.contains_key(path) {
            return Ok(());
        }
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": file_uri(path)?,
                    "languageId": language_id,
                    "version": 1,
                    "text": text,
                }
            }),
        )
        .await?;
        docs.insert(path.to_path_buf(), 1);
        Ok(())
    }

    /// Full-document sync with a bumped version.
    pub async fn did_change(&self, path: &Path, new_text: &str) -> Result<()> {
        let mut docs = self.open_docs.lock().await;
        let version = docs
            .get(path)
            .copied()
            .ok_or_else(|| anyhow!("document {} is not open", path.display()))?
            + 1;
        self.notify(
            "textDocument/didChange",
            json!({
                "textDocument": { "uri": file_uri(path)?, "version": version },
                "contentChanges": [{ "text": new_text }],
            }),
        )
        .await?;
        docs.insert(path.to_path_buf(), version);
        Ok(())
    }

    pub async fn did_close(&self, path: &Path) -> Result<()> {
        let mut docs = self.open_docs.lock().await;
        if docs.remove(path).is_none() {
            return Ok(());
        }
        self.notify(
            "textDocument/didClose",
            json!({ "textDocument": { "uri": file_uri(path)? } }),
        )
        .await
    }

    pub async fn definition(&self, path: &Path, line: u32, character: u32) -> Result<Vec<Location>> {
        let result = self
            .request("textDocument/definition", position_params(path, line, character)?)
            .await?;
        Ok(parse_locations(result))
    }

    pub async fn references(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<Vec<Location>> {
        let mut params = position_params(path, line, character)?;
        params["context"] = json!({ "includeDeclaration": include_declaration });
        let result = self.request("textDocument/references", params).await?;
        Ok(parse_locations(result))
    }

    pub async fn implementation(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>> {
        let result = self
            .request(
                "textDocument/implementation",
                position_params(path, line, character)?,
            )
            .await?;
        Ok(parse_locations(result))
    }

    pub async fn document_symbol(&self, path: &Path) -> Result<Vec<DocumentSymbol>> {
        let result = self
            .request(
                "textDocument/documentSymbol",
                json!({ "textDocument": { "uri": file_uri(path)? } }),
            )
            .await?;
        Ok(parse_document_symbols(result))
    }

    /// Best-effort protocol shutdown, then subprocess termination with a
    /// bounded grace period before kill.
    pub async fn shutdown(&self) {
        if !self.is_closed() {
            let _ = timeout(Duration::from_secs(2), self.request("shutdown", Value::Null)).await;
            let _ = self.notify("exit", Value::Null).await;
        }
        self.closed.store(true, Ordering::Relaxed);
        fail_all_waiters(&self.waiters, "lsp client shut down");

        if let Some(mut child) = self.child.lock().await.take() {
            match timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("{} language server exited: {status}", self.language)
                }
                Ok(Err(e)) => warn!("{} language server wait failed: {e}", self.language),
                Err(_) => {
                    warn!(
                        "{} language server did not exit within {:?}, killing",
                        self.language, SHUTDOWN_GRACE
                    );
                    let _ = child.kill().await;
                }
            }
        }
    }

    /// Issue one request and wait for its correlated response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(anyhow!("{} lsp client is closed", self.language));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);

        let mut msg = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if !params.is_null() {
            msg["params"] = params;
        }
        if let Err(e) = self.write(&msg).await {
            self.waiters.remove(&id);
            return Err(e);
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: the dispatcher failed the waiter map wholesale.
            Ok(Err(_)) => Err(anyhow!("{} lsp client closed", self.language)),
            Err(_) => {
                // On timeout the waiter is removed so a late arrival is dropped.
                self.waiters.remove(&id);
                Err(anyhow!("timed out waiting for {method} response"))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("{} lsp client is closed", self.language));
        }
        let mut msg = json!({ "jsonrpc": "2.0", "method": method });
        if !params.is_null() {
            msg["params"] = params;
        }
        self.write(&msg).await
    }

    async fn write(&self, msg: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Err(e) = transport::write_message(&mut *writer, msg).await {
            // A broken pipe means the subprocess is gone.
            self.closed.store(true, Ordering::Relaxed);
            fail_all_waiters(&self.waiters, "lsp server pipe closed");
            return Err(e.context(format!("write to {} lsp server", self.language)));
        }
        Ok(())
    }
}

async fn dispatch_loop(
    language: Language,
    mut reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: SharedWriter,
    waiters: Waiters,
    closed: Arc<AtomicBool>,
) {
    loop {
        let body = match transport::read_message(&mut reader).await {
            Ok(body) => body,
            Err(e) => {
                if !closed.load(Ordering::Relaxed) {
                    debug!("{language} lsp stream ended: {e:#}");
                }
                break;
            }
        };
        let msg: Value = match serde_json::from_slice(&body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{language} lsp sent invalid JSON: {e}");
                continue;
            }
        };

        let id = msg.get("id").and_then(Value::as_i64);
        let method = msg.get("method").and_then(Value::as_str);
        match (id, method) {
            // Response to one of our requests.
            (Some(id), None) => {
                if let Some((_, tx)) = waiters.remove(&id) {
                    let outcome = if let Some(err) = msg.get("error") {
                        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                        let message = err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error");
                        Err(anyhow!("lsp error {code}: {message}"))
                    } else {
                        Ok(msg.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = tx.send(outcome);
                }
                // No waiter: the caller timed out; drop the late arrival.
            }
            // Server-initiated request; answer so the server does not stall.
            (Some(_), Some(request_method)) => {
                let response = server_request_response(&msg, request_method);
                let mut w = writer.lock().await;
                if let Err(e) = transport::write_message(&mut *w, &response).await {
                    warn!("{language}: failed to answer {request_method}: {e:#}");
                }
            }
            // Notification; the core needs no notification handlers.
            (None, _) => {}
        }
    }

    closed.store(true, Ordering::Relaxed);
    fail_all_waiters(&waiters, "lsp server closed the stream");
}

/// Canned responses for requests language servers commonly send back at the
/// client; everything else gets an empty result.
fn server_request_response(msg: &Value, method: &str) -> Value {
    let id = msg.get("id").cloned().unwrap_or(Value::Null);
    let result = match method {
        "workspace/configuration" => {
            let count = msg
                .pointer("/params/items")
                .and_then(Value::as_array)
                .map(|items| items.len())
                .unwrap_or(1);
            Value::Array(vec![json!({}); count])
        }
        _ => Value::Null,
    };
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn fail_all_waiters(waiters: &Waiters, reason: &str) {
    let ids: Vec<i64> = waiters.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = waiters.remove(&id) {
            let _ = tx.send(Err(anyhow!("{reason}")));
        }
    }
}

fn file_uri(path: &Path) -> Result<String> {
    Url::from_file_path(path)
        .map(|u| u.to_string())
        .map_err(|_| anyhow!("path {} cannot become a file URI", path.display()))
}

fn position_params(path: &Path, line: u32, character: u32) -> Result<Value> {
    Ok(json!({
        "textDocument": { "uri": file_uri(path)? },
        "position": { "line": line, "character": character },
    }))
}

/// Normalize the definition/references/implementation result shapes: null,
/// a single Location, a list of Locations, or a list of LocationLinks.
fn parse_locations(result: Value) -> Vec<Location> {
    let items = match result {
        Value::Null => return Vec::new(),
        Value::Array(items) => items,
        single => vec![single],
    };
    items.into_iter().filter_map(location_from_value).collect()
}

fn location_from_value(value: Value) -> Option<Location> {
    if value.get("targetUri").is_some() {
        let uri = value.get("targetUri")?.as_str()?.to_string();
        let range = value
            .get("targetSelectionRange")
            .or_else(|| value.get("targetRange"))?
            .clone();
        return Some(Location {
            uri,
            range: serde_json::from_value(range).ok()?,
        });
    }
    serde_json::from_value(value).ok()
}

/// documentSymbol responses are either hierarchical `DocumentSymbol`s or
/// flat `SymbolInformation`s; the flat form is lifted into the hierarchy
/// type with empty children.
fn parse_document_symbols(result: Value) -> Vec<DocumentSymbol> {
    let Value::Array(items) = result else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| {
            if let Some(location) = item.get("location") {
                let range = serde_json::from_value(location.get("range")?.clone()).ok()?;
                Some(DocumentSymbol {
                    name: item.get("name")?.as_str()?.to_string(),
                    kind: item.get("kind").and_then(Value::as_u64).unwrap_or(0) as u32,
                    range,
                    selection_range: range,
                    children: Vec::new(),
                })
            } else {
                serde_json::from_value(item).ok()
            }
        })
        .collect()
}

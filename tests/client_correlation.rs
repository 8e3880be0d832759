//! Request/response correlation tests against an in-process fake language
//! server driven over duplex streams.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use codemap::language::Language;
use codemap::lsp_client::LspClient;
use codemap::transport;

/// A scripted server end: reads framed messages, forwards them to the test
/// through a channel, and writes whatever the test tells it to.
struct FakeServer {
    incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Value>,
}

fn start_fake_server() -> (LspClient, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let client = LspClient::from_transport(Language::Go, client_read, client_write);

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(read_loop(server_read, in_tx));
    tokio::spawn(async move {
        let mut writer = server_write;
        while let Some(msg) = out_rx.recv().await {
            if transport::write_message(&mut writer, &msg).await.is_err() {
                break;
            }
        }
    });

    (
        client,
        FakeServer {
            incoming: in_rx,
            outgoing: out_tx,
        },
    )
}

async fn read_loop<R>(reader: R, tx: mpsc::UnboundedSender<Value>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    while let Ok(body) = transport::read_message(&mut reader).await {
        if let Ok(msg) = serde_json::from_slice(&body) {
            if tx.send(msg).is_err() {
                break;
            }
        }
    }
}

impl FakeServer {
    async fn recv(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.incoming.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("client closed the stream")
    }

    fn send(&self, msg: Value) {
        self.outgoing.send(msg).expect("server writer gone");
    }

    fn respond(&self, id: i64, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }
}

#[tokio::test]
async fn concurrent_requests_receive_their_own_responses() -> Result<()> {
    let (client, mut server) = start_fake_server();
    let client = Arc::new(client);

    const K: usize = 16;
    let mut handles = Vec::new();
    for i in 0..K {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client
                .request("test/echo", json!({ "value": i }))
                .await
                .map(|result| (i, result))
        }));
    }

    // Collect all requests, then answer in reverse order, echoing params.
    let mut requests = Vec::new();
    for _ in 0..K {
        requests.push(server.recv().await);
    }
    requests.reverse();
    for request in &requests {
        let id = request["id"].as_i64().unwrap();
        server.respond(id, request["params"].clone());
    }

    for handle in handles {
        let (i, result) = handle.await.unwrap()?;
        assert_eq!(result["value"], i as u64, "caller {i} got a foreign response");
    }
    Ok(())
}

#[tokio::test]
async fn error_responses_complete_only_their_waiter() -> Result<()> {
    let (client, mut server) = start_fake_server();
    let client = Arc::new(client);

    let ok_call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("test/a", json!({})).await })
    };
    let failing_call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("test/b", json!({})).await })
    };

    let first = server.recv().await;
    let second = server.recv().await;
    let (a, b) = if first["method"] == "test/a" {
        (first, second)
    } else {
        (second, first)
    };

    server.send(json!({
        "jsonrpc": "2.0",
        "id": b["id"],
        "error": { "code": -32601, "message": "method not found" }
    }));
    server.respond(a["id"].as_i64().unwrap(), json!({ "ok": true }));

    let err = failing_call.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("method not found"));
    assert_eq!(ok_call.await.unwrap()?["ok"], true);
    assert!(!client.is_closed());
    Ok(())
}

#[tokio::test]
async fn notifications_from_server_are_discarded() -> Result<()> {
    let (client, mut server) = start_fake_server();

    let call = {
        let client = Arc::new(client);
        let c = client.clone();
        tokio::spawn(async move { c.request("test/echo", json!({ "n": 1 })).await })
    };

    let request = server.recv().await;
    // Noise before the real response: progress notifications must not
    // disturb correlation.
    server.send(json!({ "jsonrpc": "2.0", "method": "$/progress", "params": { "token": "x" } }));
    server.send(json!({ "jsonrpc": "2.0", "method": "window/logMessage", "params": { "message": "hi" } }));
    server.respond(request["id"].as_i64().unwrap(), json!({ "n": 1 }));

    assert_eq!(call.await.unwrap()?["n"], 1);
    Ok(())
}

#[tokio::test]
async fn server_initiated_configuration_request_is_answered() {
    let (_client, mut server) = start_fake_server();

    server.send(json!({
        "jsonrpc": "2.0",
        "id": 99,
        "method": "workspace/configuration",
        "params": { "items": [{ "section": "gopls" }, { "section": "other" }] }
    }));

    let response = server.recv().await;
    assert_eq!(response["id"], 99);
    assert_eq!(response["result"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn stream_close_fails_outstanding_and_future_requests() {
    let (client, server) = start_fake_server();
    let client = Arc::new(client);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("test/slow", json!({})).await })
    };
    // Give the request time to hit the wire, then hang up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);

    let err = timeout(Duration::from_secs(5), pending)
        .await
        .expect("waiter never completed")
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().contains("closed"), "got: {err:#}");

    // The client is now closed; new requests fail fast.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(client.is_closed());
    let err = client.request("test/after", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("closed"));
}

#[tokio::test]
async fn initialize_handshake_and_document_sync() -> Result<()> {
    let (client, mut server) = start_fake_server();
    let client = Arc::new(client);
    let root = std::env::temp_dir();

    let init = {
        let client = client.clone();
        let root = root.clone();
        tokio::spawn(async move { client.initialize(&root).await })
    };

    let request = server.recv().await;
    assert_eq!(request["method"], "initialize");
    assert!(request["params"]["rootUri"]
        .as_str()
        .unwrap()
        .starts_with("file://"));
    server.respond(request["id"].as_i64().unwrap(), json!({ "capabilities": {} }));

    let initialized = server.recv().await;
    assert_eq!(initialized["method"], "initialized");
    init.await.unwrap()?;

    // Second initialize is a no-op: no new message reaches the server.
    client.initialize(&root).await?;

    let doc = root.join("main.go");
    client.did_open(&doc, "go", "package main\n").await?;
    let open = server.recv().await;
    assert_eq!(open["method"], "textDocument/didOpen");
    assert_eq!(open["params"]["textDocument"]["version"], 1);
    assert_eq!(open["params"]["textDocument"]["languageId"], "go");

    // Double open is a no-op.
    client.did_open(&doc, "go", "package main\n").await?;

    client.did_change(&doc, "package main\n\nfunc F() {}\n").await?;
    let change = server.recv().await;
    assert_eq!(change["method"], "textDocument/didChange");
    assert_eq!(change["params"]["textDocument"]["version"], 2);

    client.did_close(&doc).await?;
    let close = server.recv().await;
    assert_eq!(close["method"], "textDocument/didClose");

    // Closing an unopened document sends nothing; re-opening works again.
    client.did_close(&doc).await?;
    client.did_open(&doc, "go", "package main\n").await?;
    let reopen = server.recv().await;
    assert_eq!(reopen["method"], "textDocument/didOpen");
    Ok(())
}

#[tokio::test]
async fn capability_queries_normalize_location_shapes() -> Result<()> {
    let (client, mut server) = start_fake_server();
    let client = Arc::new(client);
    let doc = std::env::temp_dir().join("x.go");

    // definition returning a single bare location object.
    let call = {
        let client = client.clone();
        let doc = doc.clone();
        tokio::spawn(async move { client.definition(&doc, 3, 4).await })
    };
    let request = server.recv().await;
    assert_eq!(request["method"], "textDocument/definition");
    assert_eq!(request["params"]["position"]["line"], 3);
    server.respond(
        request["id"].as_i64().unwrap(),
        json!({
            "uri": "file:///w/def.go",
            "range": { "start": { "line": 1, "character": 0 }, "end": { "line": 2, "character": 1 } }
        }),
    );
    let locations = call.await.unwrap()?;
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].uri, "file:///w/def.go");

    // references returning null.
    let call = {
        let client = client.clone();
        let doc = doc.clone();
        tokio::spawn(async move { client.references(&doc, 0, 0, false).await })
    };
    let request = server.recv().await;
    assert_eq!(request["method"], "textDocument/references");
    assert_eq!(request["params"]["context"]["includeDeclaration"], false);
    server.respond(request["id"].as_i64().unwrap(), Value::Null);
    assert!(call.await.unwrap()?.is_empty());

    Ok(())
}

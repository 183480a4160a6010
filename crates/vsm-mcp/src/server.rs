//! Exposes a capsule's tools to a remote peer over the stdio transport.
//!
//! Each `tools/call` becomes a `tool_call` on the bus whose corr id is the
//! request id; the matching `tool_result` is handed back through a one-shot
//! keyed by session and corr id. Requests run concurrently and every
//! response goes through one writer task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use vsm_core::{Message, MessageKind, Meta, SessionId};
use vsm_runtime::{Capsule, Port, RuntimeError};
use vsm_settings::Framing;

use crate::codec::{Frame, RpcCodec};
use crate::jsonrpc::{
    id_key, Incoming, Request, Response, RpcError, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};

/// Session every remote call runs under.
pub const SERVER_SESSION: &str = "mcp:stdio";

/// `(session_id, corr_id)` of an outstanding call.
type WaiterKey = (String, String);
type Waiters = Arc<Mutex<HashMap<WaiterKey, oneshot::Sender<Message>>>>;
type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct McpServer {
    codec: RpcCodec,
    io: Mutex<Option<(Reader, Writer)>>,
    waiters: Waiters,
}

impl McpServer {
    pub fn new<R, W>(reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            codec: RpcCodec::new(framing),
            io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serve on the process's own stdin/stdout.
    pub fn stdio(framing: Framing) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), framing)
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.codec = self.codec.with_debug(debug);
        self
    }

    pub fn pending_calls(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[async_trait]
impl Port for McpServer {
    fn name(&self) -> &str {
        "mcp-server"
    }

    fn should_render(&self, message: &Message) -> bool {
        message.kind == MessageKind::ToolResult
    }

    /// Resolves the waiting `tools/call`, if this result answers one.
    fn render_out(&self, message: &Message) {
        let (Some(session), Some(corr)) = (message.session_id(), &message.corr_id) else {
            return;
        };
        let key = (session.as_str().to_string(), corr.clone());
        if let Some(tx) = self.waiters.lock().remove(&key) {
            let _ = tx.send(message.clone());
        }
    }

    fn lossless(&self) -> bool {
        true
    }

    async fn run(&self, capsule: Arc<Capsule>) -> Result<(), RuntimeError> {
        let Some((reader, writer)) = self.io.lock().take() else {
            return Err(RuntimeError::Port {
                name: self.name().into(),
                message: "already running".into(),
            });
        };

        let (out_tx, mut out_rx) = mpsc::channel::<Value>(256);
        let mut sink = FramedWrite::new(writer, self.codec.clone());
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "rpc write failed");
                    break;
                }
            }
        });

        info!(capsule = %capsule.name(), "rpc server listening");
        let mut frames = FramedRead::new(reader, self.codec.clone());
        let mut inflight = JoinSet::new();
        let mut outcome = Ok(());
        while let Some(frame) = frames.next().await {
            let value = match frame {
                Ok(Frame::Message(value)) => value,
                Ok(Frame::Malformed(e)) => {
                    let error = RpcError::new(PARSE_ERROR, format!("Parse error: {e}"));
                    let _ = out_tx.send(Response::err(Value::Null, error).to_value()).await;
                    continue;
                }
                Err(e) => {
                    outcome = Err(RuntimeError::Port {
                        name: self.name().into(),
                        message: e.to_string(),
                    });
                    break;
                }
            };
            let request = match Incoming::classify(value) {
                Some(Incoming::Request(request)) => request,
                Some(Incoming::Response(_)) => {
                    debug!("ignoring response sent to server");
                    continue;
                }
                Some(Incoming::Malformed { id }) => {
                    let error = RpcError::new(INVALID_REQUEST, "Invalid Request");
                    let _ = out_tx.send(Response::err(id, error).to_value()).await;
                    continue;
                }
                None => {
                    let error = RpcError::new(INVALID_REQUEST, "Invalid Request");
                    let _ = out_tx.send(Response::err(Value::Null, error).to_value()).await;
                    continue;
                }
            };
            if request.is_notification() {
                debug!(method = %request.method, "notification");
                continue;
            }

            let capsule = Arc::clone(&capsule);
            let waiters = Arc::clone(&self.waiters);
            let out_tx = out_tx.clone();
            inflight.spawn(async move {
                let response = handle_request(&capsule, &waiters, request).await;
                let _ = out_tx.send(response.to_value()).await;
            });
        }

        while inflight.join_next().await.is_some() {}
        drop(out_tx);
        let _ = writer_task.await;
        info!("rpc server input closed");
        outcome
    }
}

async fn handle_request(capsule: &Capsule, waiters: &Waiters, request: Request) -> Response {
    let id = request.id.unwrap_or(Value::Null);
    match request.method.as_str() {
        "initialize" => {
            let version = request
                .params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION);
            Response::ok(
                id,
                json!({
                    "protocolVersion": version,
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {"name": capsule.name(), "version": env!("CARGO_PKG_VERSION")},
                }),
            )
        }
        "ping" => Response::ok(id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = capsule
                .bus()
                .context()
                .tool_descriptors()
                .iter()
                .map(|d| d.to_mcp_tool())
                .collect();
            Response::ok(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if name.is_empty() {
                return Response::err(id, RpcError::new(INVALID_PARAMS, "missing tool name"));
            }
            let args = request
                .params
                .get("arguments")
                .cloned()
                .filter(|a| !a.is_null())
                .unwrap_or_else(|| json!({}));
            let text = call_local_tool(capsule, waiters, &id, name, args).await;
            let is_error = text.starts_with("ERROR:");
            Response::ok(
                id,
                json!({"content": [{"type": "text", "text": text}], "isError": is_error}),
            )
        }
        other => Response::err(
            id,
            RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {other}")),
        ),
    }
}

async fn call_local_tool(
    capsule: &Capsule,
    waiters: &Waiters,
    id: &Value,
    name: &str,
    args: Value,
) -> String {
    let corr = id_key(id);
    let key = waiter_key(&corr);
    let (tx, rx) = oneshot::channel();
    waiters.lock().insert(key.clone(), tx);

    let meta = Meta::for_session(SessionId::from_raw(SERVER_SESSION));
    let call = Message::tool_call(name, args, corr.clone(), meta).with_path(vec![
        "mcp".into(),
        "server".into(),
        name.into(),
    ]);
    capsule.bus().emit(call);

    match rx.await {
        Ok(result) => result.payload_text(),
        Err(_) => {
            waiters.lock().remove(&key);
            format!("ERROR: Remote: no result for call {corr}")
        }
    }
}

fn waiter_key(corr: &str) -> WaiterKey {
    (SERVER_SESSION.to_string(), corr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
    use vsm_core::{Tool, ToolDescriptor, ToolError};
    use vsm_runtime::{CapsuleBuilder, Runtime, RuntimeHandle};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                "echo",
                "Echo text back",
                json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            )
        }
        async fn run(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args["text"].clone())
        }
    }

    /// Blocks until a later call opens it.
    struct Gate {
        opened: tokio::sync::Notify,
    }

    #[async_trait]
    impl Tool for Gate {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("gate", "Wait or open", json!({}))
        }
        async fn run(&self, args: Value) -> Result<Value, ToolError> {
            if args["open"].as_bool().unwrap_or(false) {
                self.opened.notify_one();
                Ok(json!("opened"))
            } else {
                self.opened.notified().await;
                Ok(json!("passed"))
            }
        }
    }

    struct Client {
        lines: Lines<BufReader<DuplexStream>>,
        out: DuplexStream,
    }

    impl Client {
        async fn send_raw(&mut self, raw: &str) {
            self.out.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn send(&mut self, value: Value) {
            self.send_raw(&format!("{value}\n")).await;
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn serve() -> (RuntimeHandle, Client) {
        serve_with(CapsuleBuilder::new("served"))
    }

    fn serve_with(builder: CapsuleBuilder) -> (RuntimeHandle, Client) {
        let (client_write, server_read) = duplex(64 * 1024);
        let (server_write, client_read) = duplex(64 * 1024);
        let capsule = builder
            .tool(Arc::new(Echo))
            .tool(Arc::new(Gate {
                opened: tokio::sync::Notify::new(),
            }))
            .build();
        let server = Arc::new(McpServer::new(server_read, server_write, Framing::Ndjson));
        let handle = Runtime::start(capsule, vec![server as Arc<dyn Port>]);
        let client = Client {
            lines: BufReader::new(client_read).lines(),
            out: client_write,
        };
        (handle, client)
    }

    // ── lifecycle ──

    #[tokio::test]
    async fn initialize_ping_and_notifications() {
        let (_handle, mut client) = serve();
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                         "params": {"protocolVersion": "2025-03-26"}}))
            .await;
        let init = client.recv().await;
        assert_eq!(init["id"], 1);
        assert_eq!(init["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(init["result"]["serverInfo"]["name"], "served");
        assert!(init["result"]["capabilities"]["tools"].is_object());

        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        client.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await;
        let pong = client.recv().await;
        assert_eq!(pong["id"], 2);
        assert_eq!(pong["result"], json!({}));
    }

    #[tokio::test]
    async fn errors_for_bad_input() {
        let (_handle, mut client) = serve();
        client.send_raw("{not json\n").await;
        let parse = client.recv().await;
        assert_eq!(parse["error"]["code"], PARSE_ERROR);
        assert!(parse["id"].is_null());

        client.send(json!({"jsonrpc": "2.0", "id": 4})).await;
        let shapeless = client.recv().await;
        assert_eq!(shapeless["id"], 4);
        assert_eq!(shapeless["error"]["code"], INVALID_REQUEST);

        client.send(json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"})).await;
        let missing = client.recv().await;
        assert_eq!(missing["id"], 5);
        assert_eq!(missing["error"]["code"], METHOD_NOT_FOUND);

        client
            .send(json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call", "params": {}}))
            .await;
        let params = client.recv().await;
        assert_eq!(params["error"]["code"], INVALID_PARAMS);
    }

    // ── tools ──

    #[tokio::test]
    async fn lists_tools_with_both_schema_keys() {
        let (_handle, mut client) = serve();
        client.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})).await;
        let list = client.recv().await;
        let tools = list["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[0]["inputSchema"], tools[0]["input_schema"]);
    }

    #[tokio::test]
    async fn call_routes_through_the_bus() {
        let (handle, mut client) = serve();
        let (_, mut rx) = handle.capsule().bus().subscribe_channel();
        client
            .send(json!({"jsonrpc": "2.0", "id": "a1", "method": "tools/call",
                         "params": {"name": "echo", "arguments": {"text": "hi"}}}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["id"], "a1");
        assert_eq!(reply["result"]["content"][0]["text"], "hi");
        assert_eq!(reply["result"]["isError"], false);

        let call = rx.recv().await.unwrap();
        assert_eq!(call.kind, MessageKind::ToolCall);
        assert_eq!(call.corr_id.as_deref(), Some("a1"));
        assert_eq!(call.session_id().map(|s| s.as_str()), Some(SERVER_SESSION));
        assert_eq!(call.path, vec!["mcp", "server", "echo"]);
    }

    #[tokio::test]
    async fn unknown_tool_is_flagged_as_error() {
        let (handle, mut client) = serve();
        client
            .send(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                         "params": {"name": "nope"}}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["result"]["isError"], true);
        let text = reply["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("ERROR: UnknownTool"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn calls_are_served_concurrently() {
        let (_handle, mut client) = serve();
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                         "params": {"name": "gate", "arguments": {}}}))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                         "params": {"name": "gate", "arguments": {"open": true}}}))
            .await;
        let first = client.recv().await;
        let second = client.recv().await;
        assert_eq!(first["id"], 2);
        assert_eq!(first["result"]["content"][0]["text"], "opened");
        assert_eq!(second["id"], 1);
        assert_eq!(second["result"]["content"][0]["text"], "passed");
    }

    #[tokio::test]
    async fn burst_of_calls_survives_a_tiny_subscriber_queue() {
        let (_handle, mut client) = serve_with(CapsuleBuilder::new("tiny").subscriber_capacity(1));
        for i in 0..25 {
            client
                .send(json!({"jsonrpc": "2.0", "id": i, "method": "tools/call",
                             "params": {"name": "echo", "arguments": {"text": format!("m{i}")}}}))
                .await;
        }
        let mut ids = Vec::new();
        for _ in 0..25 {
            let reply = client.recv().await;
            let id = reply["id"].as_i64().unwrap();
            assert_eq!(reply["result"]["content"][0]["text"], format!("m{id}"));
            ids.push(id);
        }
        ids.sort_unstable();
        assert_eq!(ids, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn results_resolve_only_their_own_session() {
        let server = McpServer::new(tokio::io::empty(), tokio::io::sink(), Framing::Ndjson);
        assert!(server.lossless());
        let (tx, mut rx) = oneshot::channel();
        server.waiters.lock().insert(waiter_key("7"), tx);

        let foreign = Message::tool_result(
            json!("theirs"),
            Some("7".into()),
            Meta::for_session(SessionId::from_raw("chat")),
        );
        server.render_out(&foreign);
        assert_eq!(server.pending_calls(), 1);

        let ours = Message::tool_result(
            json!("ours"),
            Some("7".into()),
            Meta::for_session(SessionId::from_raw(SERVER_SESSION)),
        );
        server.render_out(&ours);
        assert_eq!(server.pending_calls(), 0);
        assert_eq!(rx.try_recv().unwrap().payload, json!("ours"));
    }

    #[tokio::test]
    async fn eof_ends_the_port_cleanly() {
        let (handle, client) = serve();
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn content_length_framing_is_mirrored() {
        let (client_write, server_read) = duplex(4096);
        let (server_write, mut client_read) = duplex(4096);
        let capsule = CapsuleBuilder::new("lsp").build();
        let server = Arc::new(McpServer::new(server_read, server_write, Framing::ContentLength));
        let _handle = Runtime::start(capsule, vec![server as Arc<dyn Port>]);

        let mut client_write = client_write;
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        client_write
            .write_all(format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_bytes())
            .await
            .unwrap();

        let mut frames = FramedRead::new(&mut client_read, RpcCodec::new(Framing::ContentLength));
        let frame = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::Message(json!({"jsonrpc": "2.0", "id": 1, "result": {}})));
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let capsule = CapsuleBuilder::new("once").build();
        let server = McpServer::new(tokio::io::empty(), tokio::io::sink(), Framing::Ndjson);
        server.run(Arc::clone(&capsule)).await.unwrap();
        let err = server.run(capsule).await.unwrap_err();
        assert_eq!(err.kind(), "port");
    }
}

//! Client side of the stdio transport: spawn a tool server, list its tools
//! and call them.
//!
//! One reader task resolves pending requests by id, so responses may arrive
//! in any order. One writer task owns the sink.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};
use vsm_core::ToolDescriptor;
use vsm_settings::{Framing, McpServerSettings, McpSettings};

use crate::codec::{Frame, RpcCodec};
use crate::error::McpError;
use crate::jsonrpc::{id_key, Incoming, Request, Response, PROTOCOL_VERSION};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, McpError>>>>>;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub framing: Framing,
    pub debug: bool,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_settings(&McpSettings::default())
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &McpSettings) -> Self {
        Self {
            framing: settings.framing,
            debug: settings.debug,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
        }
    }
}

pub struct McpClient {
    name: String,
    write_tx: mpsc::Sender<Value>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
}

impl McpClient {
    /// Speak the protocol over an arbitrary byte stream pair.
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W, options: ClientOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let codec = RpcCodec::new(options.framing).with_debug(options.debug);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let (write_tx, mut write_rx) = mpsc::channel::<Value>(256);
        let mut sink = FramedWrite::new(writer, codec.clone());
        let writer_closed = Arc::clone(&closed);
        let writer_name = name.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(server = %writer_name, error = %e, "rpc write failed");
                    writer_closed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });

        let mut frames = FramedRead::new(reader, codec);
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let reader_name = name.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(Frame::Message(value)) => match Incoming::classify(value) {
                        Some(Incoming::Response(response)) => {
                            resolve(&reader_pending, response);
                        }
                        Some(Incoming::Request(request)) => {
                            debug!(server = %reader_name, method = %request.method, "ignoring server-initiated message");
                        }
                        Some(Incoming::Malformed { id }) => {
                            warn!(server = %reader_name, id = %id, "response without result or error");
                            fail_one(
                                &reader_pending,
                                &id,
                                McpError::Protocol("response carries neither result nor error".into()),
                            );
                        }
                        None => warn!(server = %reader_name, "unrecognized rpc frame"),
                    },
                    Ok(Frame::Malformed(e)) => {
                        warn!(server = %reader_name, error = %e, "malformed rpc frame");
                    }
                    Err(e) => {
                        warn!(server = %reader_name, error = %e, "rpc read failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            fail_pending(&reader_pending);
            debug!(server = %reader_name, "rpc stream closed");
        });

        Self {
            name,
            write_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            timeout: options.request_timeout,
            tasks: vec![writer_task, reader_task],
            child: Mutex::new(None),
        }
    }

    /// Spawn the configured server process and connect to its stdio.
    #[instrument(skip_all, fields(server = %server.name))]
    pub fn spawn(server: &McpServerSettings, options: ClientOptions) -> Result<Self, McpError> {
        let (program, args) = command_line(server)?;
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &server.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            command: program.clone(),
            message: e.to_string(),
        })?;
        let missing = |stream: &str| McpError::Spawn {
            command: program.clone(),
            message: format!("no {stream} pipe"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let name = if server.name.is_empty() {
            program.clone()
        } else {
            server.name.clone()
        };
        let mut client = Self::connect(name.clone(), stdout, stdin, options);

        // Drained so a chatty server never blocks on a full pipe.
        client.tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %name, "stderr: {line}");
            }
        }));
        *client.child.lock() = Some(child);
        info!(command = %program, "tool server spawned");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a request and wait for the response with the same id.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = id.to_string();
        let rx = self.register(&key)?;

        let frame = Request::new(id, method, params).to_value();
        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().remove(&key);
            return Err(McpError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                self.pending.lock().remove(&key);
                warn!(server = %self.name, method, "rpc request timed out");
                Err(McpError::Timeout(self.timeout))
            }
        }
    }

    /// The closed flag is read under the pending lock, so an entry is never
    /// inserted after the reader has drained the map.
    fn register(&self, key: &str) -> Result<oneshot::Receiver<Result<Value, McpError>>, McpError> {
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key.to_string(), tx);
        Ok(rx)
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        self.write_tx
            .send(Request::notification(method, params).to_value())
            .await
            .map_err(|_| McpError::Closed)
    }

    /// Handshake. Returns the server's `serverInfo`, if any.
    #[instrument(skip(self), fields(server = %self.name))]
    pub async fn initialize(&self) -> Result<Value, McpError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "vsm", "version": env!("CARGO_PKG_VERSION")},
                }),
            )
            .await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(result.get("serverInfo").cloned().unwrap_or(Value::Null))
    }

    #[instrument(skip(self), fields(server = %self.name))]
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| tools.iter().filter_map(descriptor_from_mcp).collect())
            .unwrap_or_default();
        Ok(tools)
    }

    /// First text content of the result. `isError` results come back as
    /// [`McpError::ToolReported`].
    #[instrument(skip(self, arguments), fields(server = %self.name))]
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let text = result_text(&result);
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(McpError::ToolReported(text));
        }
        Ok(text)
    }

    /// Close the pipes and kill the server. Pending calls fail with
    /// [`McpError::Closed`].
    pub fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        fail_pending(&self.pending);
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.start_kill() {
                debug!(server = %self.name, error = %e, "kill failed");
            }
        }
        info!(server = %self.name, "tool server stopped");
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn resolve(pending: &Pending, response: Response) {
    let key = id_key(&response.id);
    let Some(tx) = pending.lock().remove(&key) else {
        debug!(id = %key, "response for unknown request");
        return;
    };
    let outcome = response.outcome.map_err(|e| McpError::Rpc {
        code: e.code,
        message: e.message,
    });
    let _ = tx.send(outcome);
}

fn fail_one(pending: &Pending, id: &Value, error: McpError) {
    let key = id_key(id);
    match pending.lock().remove(&key) {
        Some(tx) => {
            let _ = tx.send(Err(error));
        }
        None => debug!(id = %key, "malformed response for unknown request"),
    }
}

fn fail_pending(pending: &Pending) {
    let drained: Vec<_> = pending.lock().drain().map(|(_, tx)| tx).collect();
    for tx in drained {
        let _ = tx.send(Err(McpError::Closed));
    }
}

fn command_line(server: &McpServerSettings) -> Result<(String, Vec<String>), McpError> {
    if !server.args.is_empty() {
        return Ok((server.command.clone(), server.args.clone()));
    }
    let mut parts = server.command.split_whitespace().map(str::to_string);
    let program = parts.next().ok_or_else(|| McpError::Spawn {
        command: server.command.clone(),
        message: "empty command".into(),
    })?;
    Ok((program, parts.collect()))
}

/// Accepts either `input_schema` or `inputSchema`.
pub fn descriptor_from_mcp(tool: &Value) -> Option<ToolDescriptor> {
    let name = tool.get("name")?.as_str()?;
    let description = tool.get("description").and_then(Value::as_str).unwrap_or_default();
    let schema = tool
        .get("inputSchema")
        .or_else(|| tool.get("input_schema"))
        .cloned()
        .unwrap_or_else(|| json!({}));
    Some(ToolDescriptor::new(name, description, schema))
}

fn result_text(result: &Value) -> String {
    let content = result.get("content").and_then(Value::as_array);
    let item = content.and_then(|items| {
        items
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some("text"))
            .or_else(|| items.first())
    });
    match item {
        Some(item) => match item.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => item.to_string(),
        },
        None => result.to_string(),
    }
}

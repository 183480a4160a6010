//! Mount a remote server's tools into a capsule under local names.

use std::sync::Arc;

use tracing::{info, instrument};
use vsm_core::{ToolDescriptor, ToolSource};
use vsm_runtime::CapsuleBuilder;
use vsm_settings::McpServerSettings;

use crate::client::{ClientOptions, McpClient};
use crate::error::McpError;
use crate::remote_tool::RemoteTool;

/// Which remote tools to mount, and under what names.
#[derive(Clone, Debug, Default)]
pub struct ToolFilter {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub prefix: Option<String>,
}

impl ToolFilter {
    pub fn from_settings(server: &McpServerSettings) -> Self {
        Self {
            include: server.include.clone(),
            exclude: server.exclude.clone(),
            prefix: server.prefix.clone(),
        }
    }

    pub fn admits(&self, remote_name: &str) -> bool {
        let listed = |names: &Option<Vec<String>>| {
            names.as_ref().map(|n| n.iter().any(|x| x == remote_name))
        };
        listed(&self.include).unwrap_or(true) && !listed(&self.exclude).unwrap_or(false)
    }

    pub fn local_name(&self, remote_name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{remote_name}"),
            None => remote_name.to_string(),
        }
    }
}

/// List the server's tools and wrap the admitted ones.
pub async fn reflect_tools(
    client: &Arc<McpClient>,
    filter: &ToolFilter,
) -> Result<Vec<RemoteTool>, McpError> {
    let tools = client
        .list_tools()
        .await?
        .into_iter()
        .filter(|t| filter.admits(&t.name))
        .map(|t| {
            let local = ToolDescriptor::new(filter.local_name(&t.name), t.description, t.schema);
            RemoteTool::new(Arc::clone(client), t.name, local)
        })
        .collect();
    Ok(tools)
}

/// Register the admitted tools of an already connected server.
pub async fn mount_client(
    mut builder: CapsuleBuilder,
    client: Arc<McpClient>,
    filter: &ToolFilter,
) -> Result<CapsuleBuilder, McpError> {
    let tools = reflect_tools(&client, filter).await?;
    info!(server = %client.name(), tools = tools.len(), "remote tools mounted");
    for tool in tools {
        builder = builder.tool_with_source(Arc::new(tool), ToolSource::Mcp(client.name().to_string()));
    }
    Ok(builder)
}

/// Spawn the configured server, optionally handshake, and mount its tools.
#[instrument(skip_all, fields(server = %server.name))]
pub async fn mount_mcp_server(
    builder: CapsuleBuilder,
    server: &McpServerSettings,
    options: ClientOptions,
) -> Result<CapsuleBuilder, McpError> {
    let client = Arc::new(McpClient::spawn(server, options)?);
    if server.handshake {
        client.initialize().await?;
    }
    mount_client(builder, client, &ToolFilter::from_settings(server)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::duplex;
    use vsm_core::{Message, MessageKind, Meta, SessionId, Tool, ToolError};
    use vsm_runtime::{Port, Runtime, RuntimeHandle};
    use vsm_settings::Framing;

    use crate::server::McpServer;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                self.0,
                format!("{} tool", self.0),
                json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            )
        }
        async fn run(&self, args: Value) -> Result<Value, ToolError> {
            match args["text"].as_str() {
                Some("fail") => Err(ToolError::ExecutionFailed("remote refused".into())),
                Some(text) => Ok(json!(format!("{}:{text}", self.0))),
                None => Ok(json!(self.0)),
            }
        }
    }

    /// A capsule serving `search`, `read` and `write` on one end of a pipe,
    /// and a client connected to the other end.
    fn remote() -> (RuntimeHandle, Arc<McpClient>) {
        let (client_write, server_read) = duplex(64 * 1024);
        let (server_write, client_read) = duplex(64 * 1024);
        let capsule = CapsuleBuilder::new("smith")
            .tool(Arc::new(Named("search")))
            .tool(Arc::new(Named("read")))
            .tool(Arc::new(Named("write")))
            .build();
        let server = Arc::new(McpServer::new(server_read, server_write, Framing::Ndjson));
        let handle = Runtime::start(capsule, vec![server as Arc<dyn Port>]);
        let options = ClientOptions {
            request_timeout: Duration::from_secs(5),
            ..ClientOptions::default()
        };
        let client = Arc::new(McpClient::connect("smith", client_read, client_write, options));
        (handle, client)
    }

    // ── filter ──

    #[test]
    fn include_exclude_and_prefix() {
        let filter = ToolFilter {
            include: Some(vec!["search".into(), "read".into()]),
            exclude: Some(vec!["read".into()]),
            prefix: Some("smith_".into()),
        };
        assert!(filter.admits("search"));
        assert!(!filter.admits("read"));
        assert!(!filter.admits("write"));
        assert_eq!(filter.local_name("search"), "smith_search");

        let open = ToolFilter::default();
        assert!(open.admits("anything"));
        assert_eq!(open.local_name("anything"), "anything");
    }

    // ── mounting ──

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mounted_tools_carry_local_names_and_source() {
        let (_remote, client) = remote();
        client.initialize().await.unwrap();
        let filter = ToolFilter {
            exclude: Some(vec!["write".into()]),
            prefix: Some("smith_".into()),
            ..ToolFilter::default()
        };
        let capsule = mount_client(CapsuleBuilder::new("local"), client, &filter)
            .await
            .unwrap()
            .build();

        assert_eq!(capsule.tool_names(), vec!["smith_read", "smith_search"]);
        let descriptors = capsule.bus().context().tool_descriptors();
        assert_eq!(descriptors[1].name, "smith_search");
        assert_eq!(descriptors[1].description, "search tool");
        let registry = capsule.bus().context().operations_children();
        assert_eq!(
            registry.lock().source("smith_read"),
            Some(&ToolSource::Mcp("smith".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_call_round_trip_with_progress() {
        let (_remote, client) = remote();
        let filter = ToolFilter {
            prefix: Some("smith_".into()),
            ..ToolFilter::default()
        };
        let capsule = mount_client(CapsuleBuilder::new("local"), client, &filter)
            .await
            .unwrap()
            .build();
        let (_, mut rx) = capsule.bus().subscribe_channel();
        let _local = Runtime::start(Arc::clone(&capsule), Vec::new());

        let meta = Meta::for_session(SessionId::from_raw("s"));
        capsule.bus().emit(Message::tool_call(
            "smith_search",
            json!({"text": "rust"}),
            "c1",
            meta.clone(),
        ));
        capsule.bus().emit(Message::tool_call(
            "smith_read",
            json!({"text": "fail"}),
            "c2",
            meta,
        ));

        let mut progress = Vec::new();
        let mut results = std::collections::HashMap::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while results.len() < 2 {
                let m = rx.recv().await.unwrap();
                match m.kind {
                    MessageKind::Progress => progress.push(m),
                    MessageKind::ToolResult => {
                        results.insert(m.corr_id.clone().unwrap(), m.payload_text());
                    }
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(results["c1"], "search:rust");
        assert!(results["c2"].starts_with("ERROR: Remote: ERROR: ExecutionFailed: remote refused"));
        assert_eq!(progress.len(), 4);
        let search: Vec<_> = progress
            .iter()
            .filter(|m| m.path.last().map(String::as_str) == Some("search"))
            .collect();
        assert_eq!(search[0].path, vec!["mcp", "client", "smith", "search"]);
        assert_eq!(search[0].payload_text(), "mcp call smith.search");
        assert_eq!(search[1].payload_text(), "mcp result smith.search");
    }

    #[tokio::test]
    async fn mount_fails_when_server_cannot_spawn() {
        let server = McpServerSettings {
            name: "ghost".into(),
            command: "definitely-not-a-real-binary-vsm".into(),
            ..McpServerSettings::default()
        };
        let err = mount_mcp_server(CapsuleBuilder::new("x"), &server, ClientOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "spawn");
    }
}

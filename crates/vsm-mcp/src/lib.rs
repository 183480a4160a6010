//! JSON-RPC tool transport over stdio: a client that mounts a remote
//! server's tools into a capsule, and a server port that exposes a
//! capsule's tools to a remote peer.

pub mod client;
pub mod codec;
pub mod error;
pub mod jsonrpc;
pub mod reflect;
pub mod remote_tool;
pub mod server;

pub use client::{ClientOptions, McpClient};
pub use codec::{Frame, RpcCodec};
pub use error::McpError;
pub use reflect::{mount_client, mount_mcp_server, reflect_tools, ToolFilter};
pub use remote_tool::RemoteTool;
pub use server::{McpServer, SERVER_SESSION};

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VsmSettings {
    pub provider: ProviderSettings,
    pub runtime: RuntimeSettings,
    pub homeostat: HomeostatLimits,
    pub mcp: McpSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// `openai`, `anthropic` or `gemini`.
    pub family: String,
    pub model: String,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            family: "openai".into(),
            model: "gpt-4o-mini".into(),
            base_url: None,
            api_key_env: None,
            max_tokens: None,
            system_prompt: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Concurrent isolated tool runs.
    pub isolated_workers: usize,
    /// Per-subscriber bus queue bound.
    pub subscriber_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            isolated_workers: 4,
            subscriber_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeostatLimits {
    pub tokens: u64,
    pub time_ms: u64,
    pub bytes: u64,
}

impl Default for HomeostatLimits {
    fn default() -> Self {
        Self {
            tokens: 8_000,
            time_ms: 15_000,
            bytes: 2_000_000,
        }
    }
}

/// Wire framing of the stdio RPC transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON object per line.
    #[default]
    Ndjson,
    /// `Content-Length: N\r\n\r\n` header followed by the body.
    ContentLength,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    pub framing: Framing,
    /// Log every frame sent and received.
    pub debug: bool,
    pub request_timeout_ms: u64,
    pub servers: Vec<McpServerSettings>,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            framing: Framing::Ndjson,
            debug: false,
            request_timeout_ms: 60_000,
            servers: Vec::new(),
        }
    }
}

/// A remote tool server to spawn and reflect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerSettings {
    pub name: String,
    /// Program to spawn. Split on whitespace when `args` is empty.
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub prefix: Option<String>,
    /// Send `initialize` before listing tools.
    pub handshake: bool,
}

impl Default for McpServerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            include: None,
            exclude: None,
            prefix: None,
            handshake: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module overrides, e.g. `vsm_mcp = "debug"`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}

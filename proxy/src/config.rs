//! The YAML configuration document.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;
use strand_media::{FilterOptions, SourceOptions};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub streams: Vec<StreamConfig>,
    /// Ingest worker cadence in Hz, default 20.
    pub stream_get_frequency: Option<u32>,
    /// On-screen preview toggle of the original player builds; accepted but
    /// unsupported here.
    pub stream_ui_enable: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// env_logger filter spec, e.g. "info" or "strand_proxy=debug".
    /// `RUST_LOG` wins when set.
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    pub port: u16,
    /// Worker threads of the network front end.
    pub threads: usize,
    pub http: HttpConfig,
    pub cors: CorsConfig,
    pub stream: StreamEndpointConfig,
    pub signal_exit_enable: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            addr: "0.0.0.0".into(),
            port: 8080,
            threads: 3,
            http: HttpConfig::default(),
            cors: CorsConfig::default(),
            stream: StreamEndpointConfig::default(),
            signal_exit_enable: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enable: bool,
    /// Static file root; empty denies filesystem access.
    pub doc_root: String,
    pub ssl_crt: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_dh: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> HttpConfig {
        HttpConfig {
            enable: true,
            doc_root: ".".into(),
            ssl_crt: None,
            ssl_key: None,
            ssl_dh: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allowed_credentials: bool,
    /// Preflight cache lifetime in seconds.
    pub max_age: Option<u64>,
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamEndpointConfig {
    /// Path of the JSON stream index.
    pub http_target: String,
    /// WebSocket path prefix; the stream id follows it.
    pub ws_target_prefix: String,
    /// Per-subscriber outbound queue bound.
    pub send_queue_max_size: usize,
}

impl Default for StreamEndpointConfig {
    fn default() -> StreamEndpointConfig {
        StreamEndpointConfig {
            http_target: "/streams".into(),
            ws_target_prefix: "/stream/".into(),
            send_queue_max_size: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    #[serde(flatten)]
    pub source: SourceOptions,
    #[serde(default)]
    pub filters: Vec<FilterOptions>,
    #[serde(default = "default_true")]
    pub loop_on_eof: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("can't read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("can't parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.streams.is_empty() {
            bail!("streams is empty");
        }
        let mut ids = HashSet::new();
        for s in &self.streams {
            if s.id.is_empty() {
                bail!("stream id must not be empty");
            }
            if !ids.insert(&s.id) {
                bail!("duplicate stream id: {}", s.id);
            }
        }
        if self.stream_get_frequency == Some(0) {
            bail!("stream_get_frequency must be positive");
        }
        Ok(())
    }

    /// Worker cadence, defaulted to 20 Hz.
    pub fn stream_frequency(&self) -> u32 {
        self.stream_get_frequency.unwrap_or(20)
    }
}

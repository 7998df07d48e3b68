//! Server configuration
//!
//! Read from a properties file (`server.conf` by default):
//!
//! ```text
//! # which database and which partitions this process serves
//! name=default
//! partitions=1,2,3
//! backend=list
//! stop_on_exit=true
//! port=7707
//! ```
//!
//! `class` is accepted as an alias for `backend`. Every key can be
//! overridden from the environment as `FLATDB_<KEY>` (upper case), see
//! [`flatdb_core::env`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use flatdb_core::env::{env_get_opt, env_key, env_override, env_override_bool, parse_bool};
use flatdb_core::protocol::{DEFAULT_PORT, REQUEST_HEADER_LEN};
use flatdb_core::PartitionId;
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "server.conf";

/// Configuration for a data server process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Database name passed to every backend `open`
    pub name: String,

    /// Partitions served by this process; sorted, no duplicates
    pub partitions: Vec<PartitionId>,

    /// Backend selector resolved through the registry
    pub backend: String,

    /// Close backends when the process is asked to exit
    pub stop_on_exit: bool,

    /// TCP port (0 = ephemeral)
    pub port: u16,

    /// Capacity of each pooled read buffer
    pub buffer_size: usize,

    /// Largest accepted request frame, size prefix excluded
    pub max_frame_len: usize,

    /// Idle pooled buffers kept for reuse
    pub max_idle_buffers: usize,

    /// Execution context threads (0 = one per partition)
    pub context_threads: usize,

    /// Upper bound on one reactor wait
    pub poll_timeout_ms: u16,

    /// Listen backlog
    pub backlog: i32,

    /// Failure responses carry the full error chain
    pub verbose_errors: bool,

    /// Unsent response bytes per connection before it stops being read
    pub max_outbound_bytes: usize,

    /// Outstanding requests per connection before it stops being read
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            partitions: Vec::new(),
            backend: String::new(),
            stop_on_exit: true,
            port: DEFAULT_PORT,
            buffer_size: 1024,
            max_frame_len: 16 * 1024 * 1024,
            max_idle_buffers: 1024,
            context_threads: 0,
            poll_timeout_ms: 100,
            backlog: 4096,
            verbose_errors: false,
            max_outbound_bytes: 4 * 1024 * 1024,
            max_in_flight: 1024,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn partitions<I>(mut self, partitions: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PartitionId>,
    {
        self.partitions = partitions.into_iter().map(Into::into).collect();
        self.partitions.sort();
        self.partitions.dedup();
        self
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn stop_on_exit(mut self, enable: bool) -> Self {
        self.stop_on_exit = enable;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    pub fn context_threads(mut self, n: usize) -> Self {
        self.context_threads = n;
        self
    }

    pub fn verbose_errors(mut self, enable: bool) -> Self {
        self.verbose_errors = enable;
        self
    }

    /// Read `path`, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_properties(&text)?.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse properties text. Does not validate and ignores the
    /// environment.
    pub fn from_properties(text: &str) -> Result<Self, ConfigError> {
        let props = parse_properties(text)?;
        let mut config = Self::default();
        for (key, value) in &props {
            config.set(key, value)?;
        }
        Ok(config)
    }

    /// Apply `FLATDB_*` overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        for key in ["NAME", "BACKEND"] {
            if let Some(value) = env_get_opt::<String>(&env_key(key)) {
                self.set(&key.to_lowercase(), &value)?;
            }
        }
        if let Some(value) = env_get_opt::<String>(&env_key("PARTITIONS")) {
            self.partitions = parse_partitions(&value)?;
        }
        self.stop_on_exit = env_override_bool("STOP_ON_EXIT", self.stop_on_exit);
        self.port = env_override("PORT", self.port);
        self.buffer_size = env_override("BUFFER_SIZE", self.buffer_size);
        self.max_frame_len = env_override("MAX_FRAME_LEN", self.max_frame_len);
        self.max_idle_buffers = env_override("MAX_IDLE_BUFFERS", self.max_idle_buffers);
        self.context_threads = env_override("CONTEXT_THREADS", self.context_threads);
        self.poll_timeout_ms = env_override("POLL_TIMEOUT_MS", self.poll_timeout_ms);
        self.backlog = env_override("BACKLOG", self.backlog);
        self.verbose_errors = env_override_bool("VERBOSE_ERRORS", self.verbose_errors);
        self.max_outbound_bytes = env_override("MAX_OUTBOUND_BYTES", self.max_outbound_bytes);
        self.max_in_flight = env_override("MAX_IN_FLIGHT", self.max_in_flight);
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions.is_empty() {
            return Err(ConfigError::NoPartitions);
        }
        if self.backend.trim().is_empty() {
            return Err(ConfigError::MissingBackend);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("buffer_size", "0", "must be at least 1"));
        }
        if self.max_frame_len < REQUEST_HEADER_LEN {
            return Err(ConfigError::invalid(
                "max_frame_len",
                &self.max_frame_len.to_string(),
                "must hold the 9-byte request header",
            ));
        }
        for (key, value) in [
            ("max_outbound_bytes", self.max_outbound_bytes),
            ("max_in_flight", self.max_in_flight),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "0", "must be at least 1"));
            }
        }
        if self.backlog <= 0 {
            return Err(ConfigError::invalid(
                "backlog",
                &self.backlog.to_string(),
                "must be positive",
            ));
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "name" => self.name = value.to_string(),
            "partitions" => self.partitions = parse_partitions(value)?,
            "backend" | "class" => self.backend = value.to_string(),
            "stop_on_exit" => self.stop_on_exit = parse_flag(key, value)?,
            "port" => self.port = parse_num(key, value)?,
            "buffer_size" => self.buffer_size = parse_num(key, value)?,
            "max_frame_len" => self.max_frame_len = parse_num(key, value)?,
            "max_idle_buffers" => self.max_idle_buffers = parse_num(key, value)?,
            "context_threads" => self.context_threads = parse_num(key, value)?,
            "poll_timeout_ms" => self.poll_timeout_ms = parse_num(key, value)?,
            "backlog" => self.backlog = parse_num(key, value)?,
            "verbose_errors" => self.verbose_errors = parse_flag(key, value)?,
            "max_outbound_bytes" => self.max_outbound_bytes = parse_num(key, value)?,
            "max_in_flight" => self.max_in_flight = parse_num(key, value)?,
            _ => warn!(key, "ignoring unknown config key"),
        }
        Ok(())
    }
}

/// Comma-separated partition ids. Blank entries are skipped and
/// duplicates collapse.
pub fn parse_partitions(value: &str) -> Result<Vec<PartitionId>, ConfigError> {
    let mut out = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let id: i32 = item
            .parse()
            .map_err(|e| ConfigError::invalid("partitions", item, e))?;
        out.push(PartitionId(id));
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn parse_num<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::invalid(key, value, e))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::invalid(key, value, "expected true or false"))
}

/// Minimal properties reader: `key=value`, `key: value` or
/// `key value`; `#` and `!` start comment lines. Later keys win.
fn parse_properties(text: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut props = BTreeMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line
            .find(|c: char| c == '=' || c == ':' || c.is_whitespace())
            .ok_or_else(|| ConfigError::Syntax {
                line: idx + 1,
                message: format!("expected `key=value`, found {line:?}"),
            })?;
        let key = line[..split].trim();
        let rest = line[split..].trim_start();
        let value = rest
            .strip_prefix('=')
            .or_else(|| rest.strip_prefix(':'))
            .unwrap_or(rest)
            .trim();
        if key.is_empty() {
            return Err(ConfigError::Syntax {
                line: idx + 1,
                message: "empty key".to_string(),
            });
        }
        props.insert(key.to_string(), value.to_string());
    }
    Ok(props)
}

//! Deployment configuration.
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables. Every field has a default so an empty `{}` is a valid config.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Container engine settings.
    #[serde(default)]
    pub docker: DockerSettings,

    /// Foreground execution limits.
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Session lifecycle timings.
    #[serde(default)]
    pub session: SessionSettings,

    /// Debug bring-up settings.
    #[serde(default)]
    pub debug: DebugSettings,

    /// Image overrides keyed by language identifier.
    #[serde(default)]
    pub images: HashMap<String, String>,

    /// Runtime images eligible for the legacy orphan sweep.
    #[serde(default = "default_orphan_images")]
    pub orphan_images: Vec<String>,
}

/// Container engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerSettings {
    /// Engine socket. Falls back to the platform default when unset.
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Network session containers are attached to.
    #[serde(default = "default_network")]
    pub network: String,

    /// Named volume shared by all session containers.
    #[serde(default = "default_sessions_volume")]
    pub sessions_volume: String,

    /// Mount point of the sessions volume inside each container.
    #[serde(default = "default_sessions_mount")]
    pub sessions_mount: String,

    /// Memory limit per container in megabytes.
    #[serde(default = "default_memory")]
    pub memory_mb: u64,

    /// CPU quota per container, in cores.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,

    /// Value of the `app` label stamped on every session container.
    #[serde(default = "default_app_label")]
    pub app_label: String,
}

/// Foreground execution limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSettings {
    /// Wall-clock limit for one execution, in milliseconds.
    #[serde(default = "default_execution_timeout")]
    pub timeout_ms: u64,

    /// Largest accepted source payload.
    #[serde(default = "default_max_code_size")]
    pub max_code_size_bytes: usize,
}

/// Session lifecycle timings (seconds).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Idle time before the reaper stops a session.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Maximum session lifetime, regardless of activity.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_seconds: u64,

    /// Delay between an owner disconnecting and its session being torn down.
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_seconds: u64,

    /// Interval between reaper sweeps.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
}

/// Debug bring-up settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DebugSettings {
    /// Connection attempts against the in-container debug server.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts, in milliseconds.
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_ms: u64,

    /// Overrides the per-language debug port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Thread targeted by stepping commands.
    #[serde(default = "default_thread_id")]
    pub thread_id: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker: DockerSettings::default(),
            execution: ExecutionSettings::default(),
            session: SessionSettings::default(),
            debug: DebugSettings::default(),
            images: HashMap::new(),
            orphan_images: default_orphan_images(),
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            network: default_network(),
            sessions_volume: default_sessions_volume(),
            sessions_mount: default_sessions_mount(),
            memory_mb: default_memory(),
            cpu_cores: default_cpu_cores(),
            app_label: default_app_label(),
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_execution_timeout(),
            max_code_size_bytes: default_max_code_size(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            max_lifetime_seconds: default_max_lifetime(),
            disconnect_grace_seconds: default_disconnect_grace(),
            reaper_interval_seconds: default_reaper_interval(),
        }
    }
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff(),
            port: None,
            thread_id: default_thread_id(),
        }
    }
}

impl Config {
    /// Load configuration from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config: Self = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                info!(path = %path.display(), "Loaded configuration file");
                config
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup("DOCKER_SOCKET_PATH") {
            self.docker.socket_path = Some(socket);
        }
        if let Some(network) = lookup("DOCKER_NETWORK") {
            self.docker.network = network;
        }
        if let Some(volume) = lookup("SESSION_VOLUME") {
            self.docker.sessions_volume = volume;
        }
        if let Some(v) = parse_var(&lookup, "EXECUTION_TIMEOUT_MS") {
            self.execution.timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MAX_CODE_SIZE_BYTES") {
            self.execution.max_code_size_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "SESSION_IDLE_TIMEOUT") {
            self.session.idle_timeout_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "SESSION_DISCONNECT_GRACE") {
            self.session.disconnect_grace_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "DEBUG_PORT") {
            self.debug.port = Some(v);
        }
    }

    /// Image for a language, honoring configured overrides.
    pub fn image_for<'a>(&'a self, language: &str, default_image: &'a str) -> &'a str {
        self.images
            .get(language)
            .map_or(default_image, String::as_str)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => {
            debug!(key, value = %raw, "Environment override");
            Some(v)
        }
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn default_network() -> String {
    "bridge".into()
}

fn default_sessions_volume() -> String {
    "sandbox_sessions".into()
}

fn default_sessions_mount() -> String {
    "/sessions".into()
}

const fn default_memory() -> u64 {
    512
}

const fn default_cpu_cores() -> f64 {
    1.0
}

fn default_app_label() -> String {
    "code-sandbox".into()
}

const fn default_execution_timeout() -> u64 {
    30_000
}

const fn default_max_code_size() -> usize {
    10 * 1024 * 1024
}

const fn default_idle_timeout() -> u64 {
    1800
}

const fn default_max_lifetime() -> u64 {
    4 * 3600
}

const fn default_disconnect_grace() -> u64 {
    30
}

const fn default_reaper_interval() -> u64 {
    60
}

const fn default_connect_attempts() -> u32 {
    120
}

const fn default_connect_backoff() -> u64 {
    1000
}

const fn default_thread_id() -> i64 {
    1
}

fn default_orphan_images() -> Vec<String> {
    [
        "sandbox-python:latest",
        "node:20-alpine",
        "golang:1.21-alpine",
        "python:3.10-alpine",
        "python:3.12-alpine",
        "node:18-alpine",
        "eclipse-temurin:17-alpine",
        "gcc:latest",
        "rust:1.70-alpine",
        "ruby:3.2-alpine",
        "php:8.2-alpine",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

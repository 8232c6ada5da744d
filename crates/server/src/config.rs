// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Invalid values fall back to the default instead of failing
// startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_SAVE_QUIET_MS: u64 = 2_000;
pub const DEFAULT_SAVE_MAX_WAIT_MS: u64 = 5_000;
/// Roughly 7 MB of text once encoded.
pub const DEFAULT_MAX_DOC_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_HEARTBEAT_MS: u64 = 30_000;
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Where documents are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite(PathBuf),
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Per-session tuning shared by every document session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after the last mutation before a save fires.
    pub save_quiet: Duration,
    /// Upper bound on how long a save can be deferred from the first
    /// mutation of a batch.
    pub save_max_wait: Duration,
    /// Encoded states larger than this are not persisted.
    pub max_doc_bytes: usize,
    /// Ping interval; a connection missing one pong is closed.
    pub heartbeat_interval: Duration,
    /// Whether deleted content is garbage collected inside documents.
    pub gc_enabled: bool,
    /// Frames a connection may queue while its document is loading.
    pub max_pending_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_quiet: Duration::from_millis(DEFAULT_SAVE_QUIET_MS),
            save_max_wait: Duration::from_millis(DEFAULT_SAVE_MAX_WAIT_MS),
            max_doc_bytes: DEFAULT_MAX_DOC_BYTES,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            gc_enabled: true,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    pub storage: StorageBackend,
    /// Log filter directive (e.g. `info`, `docsync_server=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Shared secret for auxiliary HTTP endpoints.
    pub security_key: Option<String>,
    /// When false the security key is not checked (local development).
    pub require_security_key: bool,
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DOCSYNC_HOST` | `127.0.0.1` |
    /// | `DOCSYNC_PORT` | `1234` |
    /// | `DOCSYNC_STORAGE` | `sqlite` (or `memory`) |
    /// | `DOCSYNC_DB_PATH` | `docsync.db` |
    /// | `DOCSYNC_LOG_FILTER` | `info` |
    /// | `DOCSYNC_LOG_FORMAT` | `text` (or `json`) |
    /// | `DOCSYNC_SECURITY_KEY` | *(none)* |
    /// | `DOCSYNC_REQUIRE_SECURITY_KEY` | `false` |
    /// | `DOCSYNC_SAVE_QUIET_MS` | `2000` |
    /// | `DOCSYNC_SAVE_MAX_WAIT_MS` | `5000` |
    /// | `DOCSYNC_MAX_DOC_BYTES` | `10485760` |
    /// | `DOCSYNC_HEARTBEAT_MS` | `30000` |
    /// | `DOCSYNC_GC` | `true` |
    /// | `DOCSYNC_MAX_PENDING_FRAMES` | `1024` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("DOCSYNC_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let port: u16 = parse_or(&env, "DOCSYNC_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)));

        let storage = match env("DOCSYNC_STORAGE").as_deref() {
            Ok("memory") => StorageBackend::Memory,
            _ => StorageBackend::Sqlite(
                env("DOCSYNC_DB_PATH").map(PathBuf::from).unwrap_or_else(|_| "docsync.db".into()),
            ),
        };

        let log_filter = env("DOCSYNC_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("DOCSYNC_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let security_key = env("DOCSYNC_SECURITY_KEY").ok().filter(|key| !key.is_empty());
        let require_security_key = flag(&env, "DOCSYNC_REQUIRE_SECURITY_KEY", false);

        let session = SessionConfig {
            save_quiet: Duration::from_millis(parse_or(
                &env,
                "DOCSYNC_SAVE_QUIET_MS",
                DEFAULT_SAVE_QUIET_MS,
            )),
            save_max_wait: Duration::from_millis(parse_or(
                &env,
                "DOCSYNC_SAVE_MAX_WAIT_MS",
                DEFAULT_SAVE_MAX_WAIT_MS,
            )),
            max_doc_bytes: parse_or(&env, "DOCSYNC_MAX_DOC_BYTES", DEFAULT_MAX_DOC_BYTES),
            heartbeat_interval: Duration::from_millis(
                parse_or(&env, "DOCSYNC_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS).max(1),
            ),
            gc_enabled: flag(&env, "DOCSYNC_GC", true),
            max_pending_frames: parse_or(
                &env,
                "DOCSYNC_MAX_PENDING_FRAMES",
                DEFAULT_MAX_PENDING_FRAMES,
            ),
        };

        Self {
            listen_addr,
            storage,
            log_filter,
            log_format,
            security_key,
            require_security_key,
            session,
        }
    }

    /// Whether `candidate` satisfies the security key policy.
    pub fn security_key_accepts(&self, candidate: Option<&str>) -> bool {
        if !self.require_security_key {
            return true;
        }
        match (&self.security_key, candidate) {
            (Some(expected), Some(candidate)) => expected == candidate,
            _ => false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag<F>(env: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match env(key).as_deref().map(str::trim) {
        Ok("false") | Ok("0") => false,
        Ok("true") | Ok("1") => true,
        _ => default,
    }
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    cors::allow_any_origin,
    crypto::{self, Cipher, EncryptionKey},
    handlers::{create_secret, get_secret, get_secret_without_id, health},
    lifecycle::{
        Engine, Reaper, DEFAULT_MAX_SECRET_BYTES, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL,
    },
    store::{Store, DEFAULT_TABLE},
    AppState,
};

const DB_FILE: &str = "oncelink.db";
const KEY_FILE: &str = "oncelink.key";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Name of the redb table holding secrets ($ONCELINK_TABLE).
    pub table: String,
    /// Hex-encoded 256-bit key ($ONCELINK_KEY).
    pub key_hex: Option<String>,
    /// File holding the hex-encoded key ($ONCELINK_KEY_FILE). Wins over `key_hex`.
    pub key_file: Option<PathBuf>,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Prepended to `/secret/<id>` in create responses ($ONCELINK_PUBLIC_URL).
    pub public_url: Option<String>,
    pub max_secret_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("ONCELINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("ONCELINK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("ONCELINK_DATA_DIR").ok().map(PathBuf::from),
            table: std::env::var("ONCELINK_TABLE").unwrap_or_else(|_| DEFAULT_TABLE.into()),
            key_hex: std::env::var("ONCELINK_KEY").ok(),
            key_file: std::env::var("ONCELINK_KEY_FILE").ok().map(PathBuf::from),
            ttl: env_secs("ONCELINK_TTL_SECS").unwrap_or(DEFAULT_TTL),
            sweep_interval: env_secs("ONCELINK_SWEEP_INTERVAL_SECS")
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            public_url: std::env::var("ONCELINK_PUBLIC_URL").ok(),
            max_secret_bytes: std::env::var("ONCELINK_MAX_SECRET_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_SECRET_BYTES),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Read a hex key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the encryption key: `key_file` first, then `key_hex`, then the
/// key persisted in `data_dir` (generated on first start).
pub fn resolve_key(cfg: &ServerConfig, data_dir: &Path) -> Result<EncryptionKey> {
    if let Some(path) = &cfg.key_file {
        if cfg.key_hex.is_some() {
            warn!("both ONCELINK_KEY and ONCELINK_KEY_FILE are set; using file");
        }
        let hex = read_key_file(path)?;
        return EncryptionKey::from_hex(&hex)
            .with_context(|| format!("parse key file: {}", path.display()));
    }
    if let Some(hex) = &cfg.key_hex {
        return EncryptionKey::from_hex(hex).context("parse ONCELINK_KEY");
    }
    load_or_create_key(data_dir)
}

/// The configured data directory, else the platform one
/// (`~/.local/share/oncelink/` and its equivalents). Created if missing.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "oncelink")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_path_buf(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir: {}", path.display()))?;
    Ok(path)
}

/// Build the HTTP surface around `state`.
pub fn router(state: AppState) -> Router {
    // Leave room for JSON framing and escapes around the largest accepted secret.
    let body_limit = state
        .engine
        .max_secret_bytes()
        .saturating_mul(2)
        .saturating_add(4096);

    Router::new()
        .route("/health", get(health))
        .route("/secret", post(create_secret))
        .route("/secret/", get(get_secret_without_id))
        .route("/secret/{*id}", get(get_secret))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(allow_any_origin))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    if cfg.table.trim().is_empty() {
        anyhow::bail!("ONCELINK_TABLE must not be empty");
    }

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let key = resolve_key(&cfg, &data_dir)?;

    let store = Store::open(&data_dir.join(DB_FILE), &cfg.table).context("open store")?;
    let engine = Engine::new(Cipher::new(key), store.clone())
        .with_ttl(cfg.ttl)
        .with_max_secret_bytes(cfg.max_secret_bytes);

    let reaper = Reaper::spawn(store, cfg.sweep_interval);
    info!(
        interval_secs = cfg.sweep_interval.as_secs(),
        ttl_secs = cfg.ttl.as_secs(),
        "reaper started"
    );

    let state = AppState {
        engine,
        public_url: cfg
            .public_url
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_owned(),
    };
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "oncelink server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    reaper.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn load_or_create_key(data_dir: &Path) -> Result<EncryptionKey> {
    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read oncelink.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "oncelink.key is corrupt (expected {} bytes, got {})",
                crypto::KEY_LEN,
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        write_private(&key_path, key.as_bytes()).context("write oncelink.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?
        .write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

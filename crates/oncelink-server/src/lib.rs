pub mod clock;
pub mod cors;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: lifecycle::Engine,
    /// Prefix for returned URLs, without a trailing slash. Empty means path-only.
    pub public_url: String,
}

pub use error::{Error, Result};
pub use server::{read_key_file, resolve_data_dir, resolve_key, router, run, ServerConfig};

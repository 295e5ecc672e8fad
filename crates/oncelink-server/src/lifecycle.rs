//! Create, reveal-once and reap: the orchestration between [`Cipher`] and [`Store`].

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::store::Store;

/// How long a freshly created secret stays readable.
pub const DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// How often the reaper sweeps consumed and expired records.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Largest accepted secret, in bytes.
pub const DEFAULT_MAX_SECRET_BYTES: usize = 1_048_576;

/// Stateless orchestration over a cipher and a store.
#[derive(Clone)]
pub struct Engine {
    cipher: Cipher,
    store: Store,
    ttl: Duration,
    max_secret_bytes: usize,
}

impl Engine {
    pub fn new(cipher: Cipher, store: Store) -> Self {
        Self {
            cipher,
            store,
            ttl: DEFAULT_TTL,
            max_secret_bytes: DEFAULT_MAX_SECRET_BYTES,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_secret_bytes(mut self, max: usize) -> Self {
        self.max_secret_bytes = max;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn max_secret_bytes(&self) -> usize {
        self.max_secret_bytes
    }

    /// Encrypt `plaintext` and persist it. The empty string is a legal secret.
    pub fn create(&self, plaintext: &str) -> Result<Uuid> {
        if plaintext.len() > self.max_secret_bytes {
            return Err(Error::BadRequest(format!(
                "secret exceeds {} byte limit",
                self.max_secret_bytes
            )));
        }

        let (ciphertext, nonce) = self.cipher.encrypt(plaintext.as_bytes())?;
        let id = self.store.create(ciphertext, nonce, self.ttl)?;
        info!(%id, ttl_secs = self.ttl.as_secs(), "secret created");
        Ok(id)
    }

    /// Parse `raw_id`, consume the secret and return its plaintext.
    ///
    /// A malformed id fails before storage is touched. Once the record has been
    /// claimed it stays consumed even if decryption fails afterwards.
    pub fn reveal(&self, raw_id: &str) -> Result<Vec<u8>> {
        let id = parse_id(raw_id)?;
        let record = self.store.fetch_if_live(id)?;

        // An empty secret encrypts to an empty ciphertext, which the cipher
        // refuses to decrypt.
        if record.ciphertext.is_empty() {
            info!(%id, "secret revealed");
            return Ok(Vec::new());
        }

        let plaintext = self
            .cipher
            .decrypt(&record.ciphertext, &record.nonce)
            .inspect_err(|e| warn!(%id, error = %e, "decrypt failed after consume"))?;
        info!(%id, "secret revealed");
        Ok(plaintext)
    }
}

/// Parse a textual UUID (hyphenated, simple, braced or urn form).
pub fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::try_parse(raw).map_err(|_| Error::BadRequest("invalid secret id".into()))
}

/// URL path under which a created secret can be revealed.
pub fn secret_path(id: Uuid) -> String {
    format!("/secret/{id}")
}

/// Something the reaper can sweep on every tick.
pub trait Sweep: Send + Sync + 'static {
    /// Remove whatever is reapable. Returns how many rows went.
    fn sweep(&self) -> Result<usize>;
}

impl Sweep for Store {
    fn sweep(&self) -> Result<usize> {
        Store::sweep(self)
    }
}

/// Handle to the background sweep task.
///
/// Dropping the handle also stops the task, but without waiting for it.
pub struct Reaper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Spawn a task that sweeps `target` every `interval`.
    /// The first sweep happens one full interval after spawning. A failed
    /// sweep is logged and the next tick runs as usual.
    pub fn spawn<S: Sweep>(target: S, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match target.sweep() {
                            Ok(removed) => debug!(removed, "sweep tick"),
                            Err(e) => warn!(error = %e, "background sweep error"),
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            info!("reaper stopped");
        });

        Self { stop, task }
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "reaper task did not exit cleanly");
        }
    }
}

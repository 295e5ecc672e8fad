use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::SecretRecord;
use crate::clock::{Clock, SystemClock};
use crate::crypto::NONCE_LEN;
use crate::error::{Error, Result};

pub const DEFAULT_TABLE: &str = "secrets";

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    table: Arc<str>,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (or create) the database at `path`, keeping secrets in `table`.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        Self::open_with_clock(path, table, Arc::new(SystemClock))
    }

    /// Like [`Store::open`], but lifecycle decisions read time from `clock`.
    pub fn open_with_clock(path: &Path, table: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let db = Database::create(path)?;
        let store = Self {
            db: Arc::new(db),
            table: Arc::from(table),
            clock,
        };

        let write_txn = store.db.begin_write()?;
        write_txn.open_table(store.secrets())?;
        write_txn.commit()?;

        Ok(store)
    }

    fn secrets(&self) -> TableDefinition<'_, u128, &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Persist a new unconsumed record that expires `ttl` from now. Returns its id.
    pub fn create(&self, ciphertext: Vec<u8>, nonce: [u8; NONCE_LEN], ttl: Duration) -> Result<Uuid> {
        let now = self.now();
        let record = SecretRecord {
            ciphertext,
            nonce,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_secs() as i64),
            consumed: false,
        };
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        let id = {
            let mut table = write_txn.open_table(self.secrets())?;
            let mut id = Uuid::new_v4();
            while table.get(id.as_u128())?.is_some() {
                id = Uuid::new_v4();
            }
            table.insert(id.as_u128(), bytes.as_slice())?;
            id
        };
        write_txn.commit()?;

        debug!(%id, expires_at = record.expires_at, "stored secret");
        Ok(id)
    }

    /// Return the record for `id` and mark it consumed, if it is still live.
    ///
    /// Absent, consumed and expired ids all yield `Error::NotFound`.
    pub fn fetch_if_live(&self, id: Uuid) -> Result<SecretRecord> {
        let now = self.now();

        // The liveness check and the consumed flip share one write transaction.
        // redb admits a single writer at a time, so two reveals of the same id
        // are serialized and the second one sees consumed == true.
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut table = write_txn.open_table(self.secrets())?;

            // Copy the bytes out so the AccessGuard borrow on `table` ends
            // before the insert below.
            let raw_bytes: Option<Vec<u8>> =
                table.get(id.as_u128())?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    if record.is_live(now) {
                        record.consumed = true;
                        table.insert(id.as_u128(), encode(&record)?.as_slice())?;
                        Some(record)
                    } else {
                        None
                    }
                }
            }
        };

        match claimed {
            Some(record) => {
                write_txn.commit()?;
                debug!(%id, "secret consumed");
                Ok(record)
            }
            None => {
                write_txn.abort()?;
                Err(Error::NotFound)
            }
        }
    }

    /// Delete every consumed or expired record. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let now = self.now();

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(self.secrets())?;

            let mut doomed = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                match decode(v.value()) {
                    Ok(record) if !record.is_reapable(now) => {}
                    Ok(_) => doomed.push(k.value()),
                    Err(e) => {
                        // Unreadable rows can never be revealed; drop them too.
                        warn!(id = %Uuid::from_u128(k.value()), error = %e, "dropping undecodable record");
                        doomed.push(k.value());
                    }
                }
            }

            for id in &doomed {
                table.remove(*id)?;
            }
            doomed.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "swept consumed and expired secrets");
        }
        Ok(removed)
    }

    /// Whether a row exists for `id`, live or not. Never consumes.
    pub fn contains(&self, id: Uuid) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.secrets())?;
        Ok(table.get(id.as_u128())?.is_some())
    }

    /// Number of rows currently stored, including ones awaiting the sweep.
    pub fn len(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.secrets())?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(record, bincode::config::standard())?)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(12 * 60 * 60);

    fn make_store() -> (Store, Arc<ManualClock>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store =
            Store::open_with_clock(&dir.path().join("test.db"), DEFAULT_TABLE, clock.clone())
                .unwrap();
        (store, clock, dir)
    }

    fn put(s: &Store, ttl: Duration) -> Uuid {
        s.create(vec![1, 2, 3], [7; NONCE_LEN], ttl).unwrap()
    }

    #[test]
    fn create_then_fetch_consumes() {
        let (s, _clock, _dir) = make_store();
        let id = put(&s, TTL);

        let record = s.fetch_if_live(id).unwrap();
        assert_eq!(record.ciphertext, vec![1, 2, 3]);
        assert_eq!(record.nonce, [7; NONCE_LEN]);
        assert_eq!(record.expires_at - record.created_at, TTL.as_secs() as i64);

        assert!(matches!(s.fetch_if_live(id), Err(Error::NotFound)));
        // Still physically present until the sweep runs.
        assert!(s.contains(id).unwrap());
    }

    #[test]
    fn unknown_id_not_found() {
        let (s, _clock, _dir) = make_store();
        assert!(matches!(
            s.fetch_if_live(Uuid::new_v4()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn expires_exactly_at_deadline() {
        let (s, clock, _dir) = make_store();
        let id = put(&s, Duration::from_secs(60));
        clock.advance(Duration::from_secs(60));
        assert!(matches!(s.fetch_if_live(id), Err(Error::NotFound)));

        let id = put(&s, Duration::from_secs(60));
        clock.advance(Duration::from_secs(59));
        assert!(s.fetch_if_live(id).is_ok());
    }

    #[test]
    fn expired_fetch_does_not_consume_or_delete() {
        let (s, clock, _dir) = make_store();
        let id = put(&s, Duration::from_secs(10));
        clock.advance(Duration::from_secs(10));
        assert!(matches!(s.fetch_if_live(id), Err(Error::NotFound)));
        assert!(s.contains(id).unwrap());
    }

    #[test]
    fn sweep_removes_consumed_and_expired_once() {
        let (s, clock, _dir) = make_store();
        let consumed = put(&s, TTL);
        s.fetch_if_live(consumed).unwrap();
        let expired = put(&s, Duration::from_secs(5));
        let live = put(&s, TTL);

        clock.advance(Duration::from_secs(6));
        assert_eq!(s.sweep().unwrap(), 2);
        assert_eq!(s.sweep().unwrap(), 0);

        assert!(!s.contains(consumed).unwrap());
        assert!(!s.contains(expired).unwrap());
        assert!(s.contains(live).unwrap());
        assert_eq!(s.len().unwrap(), 1);
    }

    #[test]
    fn sweep_waits_until_strictly_past_deadline() {
        let (s, clock, _dir) = make_store();
        let id = put(&s, Duration::from_secs(5));
        clock.advance(Duration::from_secs(5));
        // Unreadable already, reaped on the next tick.
        assert_eq!(s.sweep().unwrap(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(s.sweep().unwrap(), 1);
        assert!(!s.contains(id).unwrap());
    }

    #[test]
    fn sweep_on_empty_store() {
        let (s, _clock, _dir) = make_store();
        assert_eq!(s.sweep().unwrap(), 0);
        assert!(s.is_empty().unwrap());
    }

    #[test]
    fn ids_are_unique() {
        let (s, _clock, _dir) = make_store();
        let mut ids: Vec<Uuid> = (0..200).map(|_| put(&s, TTL)).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert!(ids.iter().all(|id| id.get_version_num() == 4));
    }

    #[test]
    fn concurrent_fetch_has_one_winner() {
        let (s, _clock, _dir) = make_store();
        let id = put(&s, TTL);

        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| s.fetch_if_live(id).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
    }

    #[test]
    fn records_survive_reopen_in_named_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");

        let id = {
            let s = Store::open(&path, "vault").unwrap();
            put(&s, TTL)
        };

        let other = Store::open(&path, DEFAULT_TABLE).unwrap();
        assert!(!other.contains(id).unwrap());
        drop(other);

        let s = Store::open(&path, "vault").unwrap();
        assert!(s.fetch_if_live(id).is_ok());
    }
}

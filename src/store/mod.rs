//! Persistent keyed bucket store.
//!
//! Everything the client must remember across runs lives here: server
//! entries, dial parameters, affinity state, cached ETags, persistent stat
//! records awaiting report, SLOKs, tactics, and speed-test samples.
//!
//! The store is an explicit [`Datastore`] value threaded through
//! constructors; there is no process-wide singleton, so open/close ordering
//! is the caller's to see and the only fatal condition after startup is a
//! failed open. Writes are transactional; reads see a consistent snapshot.
//! A corrupt individual record is a non-event for readers: it is logged and
//! skipped, never fatal.

pub mod dial_params;
pub mod entries;
pub mod iterator;

pub use dial_params::DialParameters;
pub use entries::{ServerEntry, ServerEntryFilter, StoreOutcome};
pub use iterator::ServerEntryIterator;

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::warn;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid server entry: {0}")]
    InvalidServerEntry(String),

    #[error("invalid persistent stat kind: {0}")]
    InvalidStatKind(String),
}

pub(crate) const BUCKET_SERVER_ENTRIES: &str = "serverEntries";
pub(crate) const BUCKET_DIAL_PARAMETERS: &str = "dialParameters";
pub(crate) const BUCKET_SPLIT_TUNNEL_ROUTE_ETAGS: &str = "splitTunnelRouteETags";
pub(crate) const BUCKET_SPLIT_TUNNEL_ROUTE_DATA: &str = "splitTunnelRouteData";
pub(crate) const BUCKET_URL_ETAGS: &str = "urlETags";
pub(crate) const BUCKET_KEY_VALUES: &str = "keyValues";
pub(crate) const BUCKET_REMOTE_SERVER_LIST_STATS: &str = "remoteServerListStats";
pub(crate) const BUCKET_FAILED_TUNNEL_STATS: &str = "failedTunnelStats";
pub(crate) const BUCKET_SLOKS: &str = "SLOKs";
pub(crate) const BUCKET_TACTICS: &str = "tactics";
pub(crate) const BUCKET_SPEED_TEST_SAMPLES: &str = "speedTestSamples";

/// Key-value bucket key holding the affinity server entry id.
pub(crate) const KEY_AFFINITY_SERVER_ENTRY_ID: &str = "affinityServerEntryId";
/// Key-value bucket key holding the filter fingerprint recorded at promote.
pub(crate) const KEY_LAST_SERVER_ENTRY_FILTER: &str = "lastServerEntryFilter";

const STAT_STATE_UNREPORTED: &[u8] = b"0";
const STAT_STATE_REPORTING: &[u8] = b"1";

/// Kinds of persistent stat records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistentStatKind {
    RemoteServerList,
    FailedTunnel,
}

impl PersistentStatKind {
    pub const ALL: [PersistentStatKind; 2] = [
        PersistentStatKind::RemoteServerList,
        PersistentStatKind::FailedTunnel,
    ];

    fn bucket(self) -> &'static str {
        match self {
            PersistentStatKind::RemoteServerList => BUCKET_REMOTE_SERVER_LIST_STATS,
            PersistentStatKind::FailedTunnel => BUCKET_FAILED_TUNNEL_STATS,
        }
    }
}

/// The persistent store handle.
pub struct Datastore {
    conn: Mutex<Connection>,
}

impl Datastore {
    /// Open (creating if necessary) the store in `directory`.
    ///
    /// All persistent stat records left in the reporting state by a previous
    /// process are reverted to unreported: the previous process cannot attest
    /// that the report succeeded.
    pub fn open(directory: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(directory)?;
        let conn = Connection::open(directory.join("mirage.db"))?;
        let store = Datastore::initialize(conn)?;
        store.reset_all_persistent_stats_to_unreported()?;
        Ok(store)
    }

    /// An in-memory store, for tests and ephemeral clients.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Datastore::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        // WAL keeps readers unblocked by the single writer. The pragma
        // reports the resulting mode ("memory" for in-memory stores).
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                bucket TEXT NOT NULL,
                key    BLOB NOT NULL,
                value  BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            );",
        )?;
        Ok(Datastore {
            conn: Mutex::new(conn),
        })
    }

    // Bucket primitives. Submodules build their record semantics on these.

    pub(crate) fn get_value(
        &self,
        bucket: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT value FROM buckets WHERE bucket = ?1 AND key = ?2")?;
        let mut rows = stmt.query(params![bucket, key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn set_value(
        &self,
        bucket: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
            params![bucket, key, value],
        )?;
        Ok(())
    }

    pub(crate) fn delete_value(&self, bucket: &str, key: &[u8]) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM buckets WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        Ok(())
    }

    /// All `(key, value)` pairs in a bucket, in key order, as one snapshot.
    pub(crate) fn bucket_items(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT key, value FROM buckets WHERE bucket = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![bucket], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// All keys in a bucket, in key order.
    pub(crate) fn bucket_keys(&self, bucket: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT key FROM buckets WHERE bucket = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![bucket], |row| row.get::<_, Vec<u8>>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    pub(crate) fn clear_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM buckets WHERE bucket = ?1", params![bucket])?;
        Ok(())
    }

    /// Run `body` inside one transaction; all writes commit or none do.
    pub(crate) fn with_transaction<T>(
        &self,
        body: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = body(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // Key/value pairs.

    pub fn set_key_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_value(BUCKET_KEY_VALUES, key.as_bytes(), value.as_bytes())
    }

    pub fn get_key_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_value(BUCKET_KEY_VALUES, key.as_bytes())?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    // Split-tunnel routes and ETags.

    /// Update the cached routes data for a region, along with the ETag used
    /// for efficient refresh requests.
    pub fn set_split_tunnel_routes(
        &self,
        region: &str,
        etag: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
                params![BUCKET_SPLIT_TUNNEL_ROUTE_ETAGS, region.as_bytes(), etag.as_bytes()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
                params![BUCKET_SPLIT_TUNNEL_ROUTE_DATA, region.as_bytes(), data],
            )?;
            Ok(())
        })
    }

    pub fn get_split_tunnel_routes_etag(&self, region: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_value(BUCKET_SPLIT_TUNNEL_ROUTE_ETAGS, region.as_bytes())?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    pub fn get_split_tunnel_routes_data(&self, region: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_value(BUCKET_SPLIT_TUNNEL_ROUTE_DATA, region.as_bytes())
    }

    /// Store an ETag for a URL. The URL is treated as an opaque string; no
    /// canonicalization.
    pub fn set_url_etag(&self, url: &str, etag: &str) -> Result<(), StoreError> {
        self.set_value(BUCKET_URL_ETAGS, url.as_bytes(), etag.as_bytes())
    }

    pub fn get_url_etag(&self, url: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_value(BUCKET_URL_ETAGS, url.as_bytes())?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    // Persistent stats.
    //
    // Records in the unreported state are available for take-out. Taken-out
    // records are marked reporting and are pending either deletion (report
    // succeeded) or a put-back to unreported (report failed).

    /// Add a stat record in the unreported state. The record itself is the
    /// key; once `max_store_records` is reached new records are silently
    /// discarded.
    pub fn store_persistent_stat(
        &self,
        kind: PersistentStatKind,
        stat: &[u8],
        max_store_records: usize,
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            let count: usize = tx.query_row(
                "SELECT COUNT(*) FROM buckets WHERE bucket = ?1",
                params![kind.bucket()],
                |row| row.get(0),
            )?;
            if count >= max_store_records {
                return Ok(());
            }
            tx.execute(
                "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
                params![kind.bucket(), stat, STAT_STATE_UNREPORTED],
            )?;
            Ok(())
        })
    }

    pub fn count_unreported_persistent_stats(&self) -> usize {
        let mut unreported = 0;
        for kind in PersistentStatKind::ALL {
            match self.bucket_items(kind.bucket()) {
                Ok(items) => {
                    unreported += items
                        .iter()
                        .filter(|(_, state)| state == STAT_STATE_UNREPORTED)
                        .count();
                }
                Err(err) => {
                    warn!(error = %err, "count_unreported_persistent_stats failed");
                    return 0;
                }
            }
        }
        unreported
    }

    /// Take out unreported stat records, marking them reporting. At least one
    /// record per kind (when present) is returned, then more up to
    /// `max_send_bytes` in total.
    pub fn take_out_unreported_persistent_stats(
        &self,
        max_send_bytes: usize,
    ) -> Result<HashMap<PersistentStatKind, Vec<Vec<u8>>>, StoreError> {
        self.with_transaction(|tx| {
            let mut stats: HashMap<PersistentStatKind, Vec<Vec<u8>>> = HashMap::new();
            let mut send_bytes = 0;

            for kind in PersistentStatKind::ALL {
                let mut stmt = tx.prepare(
                    "SELECT key, value FROM buckets WHERE bucket = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![kind.bucket()], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;

                let mut taken = Vec::new();
                for row in rows {
                    let (key, state) = row?;
                    // A record that does not parse as JSON is corrupt; drop
                    // it and move on.
                    if serde_json::from_slice::<serde_json::Value>(&key).is_err() {
                        warn!("deleting corrupt persistent stat record");
                        tx.execute(
                            "DELETE FROM buckets WHERE bucket = ?1 AND key = ?2",
                            params![kind.bucket(), key],
                        )?;
                        continue;
                    }
                    if state == STAT_STATE_UNREPORTED {
                        send_bytes += key.len();
                        taken.push(key);
                        if send_bytes >= max_send_bytes {
                            break;
                        }
                    }
                }
                drop(stmt);

                for key in &taken {
                    tx.execute(
                        "UPDATE buckets SET value = ?3 WHERE bucket = ?1 AND key = ?2",
                        params![kind.bucket(), key, STAT_STATE_REPORTING],
                    )?;
                }
                if !taken.is_empty() {
                    stats.insert(kind, taken);
                }
            }
            Ok(stats)
        })
    }

    /// Restore taken-out records to the unreported state after a failed
    /// report.
    pub fn put_back_unreported_persistent_stats(
        &self,
        stats: &HashMap<PersistentStatKind, Vec<Vec<u8>>>,
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            for (kind, records) in stats {
                for key in records {
                    tx.execute(
                        "UPDATE buckets SET value = ?3 WHERE bucket = ?1 AND key = ?2",
                        params![kind.bucket(), key, STAT_STATE_UNREPORTED],
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Delete records that were successfully reported.
    pub fn clear_reported_persistent_stats(
        &self,
        stats: &HashMap<PersistentStatKind, Vec<Vec<u8>>>,
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            for (kind, records) in stats {
                for key in records {
                    tx.execute(
                        "DELETE FROM buckets WHERE bucket = ?1 AND key = ?2",
                        params![kind.bucket(), key],
                    )?;
                }
            }
            Ok(())
        })
    }

    fn reset_all_persistent_stats_to_unreported(&self) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            for kind in PersistentStatKind::ALL {
                tx.execute(
                    "UPDATE buckets SET value = ?2 WHERE bucket = ?1",
                    params![kind.bucket(), STAT_STATE_UNREPORTED],
                )?;
            }
            Ok(())
        })
    }

    // SLOKs: opaque per-server keys accumulated as proof of use. Stored,
    // never interpreted here.

    /// Store a SLOK key by id. Returns whether the id was already present.
    pub fn set_slok(&self, id: &[u8], key: &[u8]) -> Result<bool, StoreError> {
        self.with_transaction(|tx| {
            let duplicate: bool = tx
                .query_row(
                    "SELECT COUNT(*) FROM buckets WHERE bucket = ?1 AND key = ?2",
                    params![BUCKET_SLOKS, id],
                    |row| row.get::<_, usize>(0),
                )
                .map(|count| count > 0)?;
            tx.execute(
                "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
                params![BUCKET_SLOKS, id, key],
            )?;
            Ok(duplicate)
        })
    }

    pub fn get_slok(&self, id: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_value(BUCKET_SLOKS, id)
    }

    pub fn count_sloks(&self) -> usize {
        self.bucket_keys(BUCKET_SLOKS)
            .map(|keys| keys.len())
            .unwrap_or_else(|err| {
                warn!(error = %err, "count_sloks failed");
                0
            })
    }

    pub fn delete_sloks(&self) -> Result<(), StoreError> {
        self.clear_bucket(BUCKET_SLOKS)
    }

    // Tactics and speed-test samples, both keyed by network id.

    pub fn set_tactics_record(&self, network_id: &str, record: &[u8]) -> Result<(), StoreError> {
        self.set_value(BUCKET_TACTICS, network_id.as_bytes(), record)
    }

    pub fn get_tactics_record(&self, network_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_value(BUCKET_TACTICS, network_id.as_bytes())
    }

    pub fn set_speed_test_samples(
        &self,
        network_id: &str,
        record: &[u8],
    ) -> Result<(), StoreError> {
        self.set_value(BUCKET_SPEED_TEST_SAMPLES, network_id.as_bytes(), record)
    }

    pub fn get_speed_test_samples(&self, network_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_value(BUCKET_SPEED_TEST_SAMPLES, network_id.as_bytes())
    }
}

//! Server entry records.
//!
//! A server entry describes one remote endpoint: its identity (the IP
//! address), region, the transport profiles it supports and the ports they
//! dial, the inner-channel host key, the obfuscation keyword, and optional
//! front-hop addresses. Entries arrive from server lists as hex-encoded
//! blobs and are kept durably in the [`Datastore`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    Datastore, StoreError, BUCKET_DIAL_PARAMETERS, BUCKET_KEY_VALUES, BUCKET_SERVER_ENTRIES,
    KEY_AFFINITY_SERVER_ENTRY_ID, KEY_LAST_SERVER_ENTRY_FILTER,
};

/// Transport profiles that carry tactics requests; these use a lighter
/// handshake and are dialable before a full tunnel exists.
pub const TACTICS_CAPABLE_PROFILES: [&str; 2] = ["obfuscated-tls", "fronted-tls"];

/// One remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerEntry {
    /// Stable identifier.
    pub ip_address: String,
    pub region: String,
    /// Monotonically increasing; replacement requires a strictly greater
    /// version unless explicitly forced.
    pub configuration_version: i64,
    /// Names of supported transport profiles.
    pub capabilities: Vec<String>,
    /// Dial port per supported profile.
    pub dial_ports: HashMap<String, u16>,
    /// Public host key of the inner channel.
    pub host_public_key: String,
    /// Keyword keying the obfuscator.
    pub obfuscation_keyword: String,
    /// Optional front-hop addresses for fronted profiles.
    pub fronting_addresses: Vec<String>,
    pub web_server_port: u16,
    pub web_server_secret: String,
    pub web_server_certificate: String,
}

impl Default for ServerEntry {
    fn default() -> Self {
        ServerEntry {
            ip_address: String::new(),
            region: String::new(),
            configuration_version: 0,
            capabilities: Vec::new(),
            dial_ports: HashMap::new(),
            host_public_key: String::new(),
            obfuscation_keyword: String::new(),
            fronting_addresses: Vec::new(),
            web_server_port: 0,
            web_server_secret: String::new(),
            web_server_certificate: String::new(),
        }
    }
}

impl ServerEntry {
    /// Check required fields. Entries with an empty identity or no usable
    /// transport are rejected at ingestion.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.ip_address.is_empty() {
            return Err(StoreError::InvalidServerEntry(
                "missing ipAddress".to_string(),
            ));
        }
        if self.capabilities.is_empty() {
            return Err(StoreError::InvalidServerEntry(
                "missing capabilities".to_string(),
            ));
        }
        for capability in &self.capabilities {
            if !self.dial_ports.contains_key(capability) {
                return Err(StoreError::InvalidServerEntry(format!(
                    "missing dial port for capability {capability}"
                )));
            }
        }
        Ok(())
    }

    /// The subset of capabilities usable for tactics requests.
    pub fn supported_tactics_profiles(&self) -> Vec<&str> {
        self.capabilities
            .iter()
            .map(String::as_str)
            .filter(|capability| TACTICS_CAPABLE_PROFILES.contains(capability))
            .collect()
    }

    /// Capabilities remaining after applying a protocol whitelist; an empty
    /// whitelist means no constraint.
    pub fn supported_profiles(&self, limit_protocols: &[String]) -> Vec<&str> {
        self.capabilities
            .iter()
            .map(String::as_str)
            .filter(|capability| {
                limit_protocols.is_empty()
                    || limit_protocols.iter().any(|limit| limit == capability)
            })
            .collect()
    }

    pub fn dial_port(&self, capability: &str) -> Option<u16> {
        self.dial_ports.get(capability).copied()
    }
}

/// Decode one server list line: the hex encoding of
/// `ipAddress SP webPort SP secret SP pemBody SP jsonBody`.
pub fn decode_server_entry(encoded: &str) -> Result<ServerEntry, StoreError> {
    let decoded = hex::decode(encoded.trim())
        .map_err(|err| StoreError::InvalidServerEntry(format!("hex decode: {err}")))?;
    let text = String::from_utf8(decoded)
        .map_err(|err| StoreError::InvalidServerEntry(format!("utf-8 decode: {err}")))?;

    let mut fields = text.splitn(5, ' ');
    let ip_address = fields
        .next()
        .ok_or_else(|| StoreError::InvalidServerEntry("missing ipAddress field".to_string()))?;
    let web_port = fields
        .next()
        .ok_or_else(|| StoreError::InvalidServerEntry("missing webPort field".to_string()))?;
    let secret = fields
        .next()
        .ok_or_else(|| StoreError::InvalidServerEntry("missing secret field".to_string()))?;
    let pem_body = fields
        .next()
        .ok_or_else(|| StoreError::InvalidServerEntry("missing pemBody field".to_string()))?;
    let json_body = fields
        .next()
        .ok_or_else(|| StoreError::InvalidServerEntry("missing jsonBody field".to_string()))?;

    let mut entry: ServerEntry = serde_json::from_str(json_body)
        .map_err(|err| StoreError::InvalidServerEntry(format!("json decode: {err}")))?;

    // The positional fields are authoritative for the legacy web server
    // parameters; the JSON body carries everything else.
    entry.ip_address = ip_address.to_string();
    entry.web_server_port = web_port
        .parse()
        .map_err(|_| StoreError::InvalidServerEntry("invalid webPort field".to_string()))?;
    entry.web_server_secret = secret.to_string();
    entry.web_server_certificate = pem_body.to_string();

    entry.validate()?;
    Ok(entry)
}

/// Outcome of a server entry store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Skipped,
}

/// The region/protocol constraints in effect for candidate selection.
///
/// Its byte fingerprint is persisted when an entry is promoted; if the
/// fingerprint no longer matches at iteration time, the promoted entry was
/// ranked under different constraints and affinity is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEntryFilter {
    pub egress_region: String,
    pub limit_tunnel_protocols: Vec<String>,
}

impl ServerEntryFilter {
    pub fn fingerprint(&self) -> Vec<u8> {
        let mut fingerprint = self.egress_region.as_bytes().to_vec();
        fingerprint.push(0);
        fingerprint.extend_from_slice(self.limit_tunnel_protocols.join(",").as_bytes());
        fingerprint
    }
}

impl Datastore {
    /// Add a server entry.
    ///
    /// When an entry already exists for the IP address it is replaced only if
    /// `replace_if_exists` is set or the incoming configuration version is
    /// strictly greater than the stored one. Stored data that no longer
    /// parses is treated as replaceable.
    pub fn store_server_entry(
        &self,
        entry: &ServerEntry,
        replace_if_exists: bool,
    ) -> Result<StoreOutcome, StoreError> {
        entry.validate()?;

        let data = serde_json::to_vec(entry)
            .map_err(|err| StoreError::InvalidServerEntry(err.to_string()))?;

        self.with_transaction(|tx| {
            let existing: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT value FROM buckets WHERE bucket = ?1 AND key = ?2",
                    rusqlite::params![BUCKET_SERVER_ENTRIES, entry.ip_address.as_bytes()],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    err => Err(err),
                })?;

            let existing_version = existing
                .as_deref()
                .and_then(|data| serde_json::from_slice::<ServerEntry>(data).ok())
                .map(|existing| existing.configuration_version);

            let update = match existing_version {
                None => true,
                Some(version) => replace_if_exists || entry.configuration_version > version,
            };

            if !update {
                return Ok(StoreOutcome::Skipped);
            }

            tx.execute(
                "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![BUCKET_SERVER_ENTRIES, entry.ip_address.as_bytes(), data],
            )?;
            info!(server = entry.ip_address.as_str(), "updated server entry");
            Ok(StoreOutcome::Stored)
        })
    }

    /// Store a batch of decoded server list lines. Each line commits
    /// independently; malformed lines are logged and skipped.
    pub fn store_server_list(
        &self,
        encoded_entries: impl IntoIterator<Item = String>,
        replace_if_exists: bool,
    ) -> Result<usize, StoreError> {
        let mut stored = 0;
        for encoded in encoded_entries {
            if encoded.trim().is_empty() {
                continue;
            }
            match decode_server_entry(&encoded) {
                Ok(entry) => {
                    if self.store_server_entry(&entry, replace_if_exists)? == StoreOutcome::Stored
                    {
                        stored += 1;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "rejected malformed server list entry");
                }
            }
        }
        Ok(stored)
    }

    /// Fetch one entry by IP address. A stored record that fails to parse is
    /// treated as absent.
    pub fn get_server_entry(&self, ip_address: &str) -> Result<Option<ServerEntry>, StoreError> {
        let Some(data) = self.get_value(BUCKET_SERVER_ENTRIES, ip_address.as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice(&data) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                warn!(server = ip_address, error = %err, "corrupt server entry");
                Ok(None)
            }
        }
    }

    /// Visit every stored entry in one snapshot. Corrupt records are logged
    /// and skipped.
    pub fn scan_server_entries(
        &self,
        mut visitor: impl FnMut(&ServerEntry),
    ) -> Result<(), StoreError> {
        for (key, value) in self.bucket_items(BUCKET_SERVER_ENTRIES)? {
            match serde_json::from_slice::<ServerEntry>(&value) {
                Ok(entry) => visitor(&entry),
                Err(err) => {
                    warn!(
                        server = %String::from_utf8_lossy(&key),
                        error = %err,
                        "skipping corrupt server entry"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn count_server_entries(&self) -> usize {
        let mut count = 0;
        if let Err(err) = self.scan_server_entries(|_| count += 1) {
            warn!(error = %err, "count_server_entries failed");
            return 0;
        }
        count
    }

    /// Count entries matching the filter's region and protocol constraints.
    pub fn count_server_entries_with_constraints(&self, filter: &ServerEntryFilter) -> usize {
        let mut count = 0;
        let result = self.scan_server_entries(|entry| {
            let region_ok =
                filter.egress_region.is_empty() || entry.region == filter.egress_region;
            if region_ok && !entry.supported_profiles(&filter.limit_tunnel_protocols).is_empty() {
                count += 1;
            }
        });
        if let Err(err) = result {
            warn!(error = %err, "count_server_entries_with_constraints failed");
            return 0;
        }
        count
    }

    /// The distinct regions with at least one candidate under the protocol
    /// constraints.
    pub fn available_regions(&self, limit_tunnel_protocols: &[String]) -> Vec<String> {
        let mut regions = std::collections::BTreeSet::new();
        let result = self.scan_server_entries(|entry| {
            if !entry.region.is_empty()
                && !entry.supported_profiles(limit_tunnel_protocols).is_empty()
            {
                regions.insert(entry.region.clone());
            }
        });
        if let Err(err) = result {
            warn!(error = %err, "available_regions failed");
            return Vec::new();
        }
        regions.into_iter().collect()
    }

    /// Record the server to favor on the next establishment round, together
    /// with the filter fingerprint in effect now. Unknown ids are ignored.
    pub fn promote_server_entry(
        &self,
        ip_address: &str,
        filter: &ServerEntryFilter,
    ) -> Result<(), StoreError> {
        let fingerprint = filter.fingerprint();
        self.with_transaction(|tx| {
            let exists: bool = tx
                .query_row(
                    "SELECT COUNT(*) FROM buckets WHERE bucket = ?1 AND key = ?2",
                    rusqlite::params![BUCKET_SERVER_ENTRIES, ip_address.as_bytes()],
                    |row| row.get::<_, usize>(0),
                )
                .map(|count| count > 0)?;
            if !exists {
                warn!(server = ip_address, "promote: ignoring unknown server entry");
                return Ok(());
            }
            tx.execute(
                "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    BUCKET_KEY_VALUES,
                    KEY_AFFINITY_SERVER_ENTRY_ID.as_bytes(),
                    ip_address.as_bytes()
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    BUCKET_KEY_VALUES,
                    KEY_LAST_SERVER_ENTRY_FILTER.as_bytes(),
                    fingerprint
                ],
            )?;
            Ok(())
        })
    }

    /// The affinity entry id, verified to still exist in the store. A stale
    /// id is ignored, not an error.
    pub fn affinity_server_entry_id(&self) -> Result<Option<String>, StoreError> {
        let Some(id) = self.get_value(BUCKET_KEY_VALUES, KEY_AFFINITY_SERVER_ENTRY_ID.as_bytes())?
        else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&id).into_owned();
        if self.get_value(BUCKET_SERVER_ENTRIES, id.as_bytes())?.is_none() {
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Whether the persisted filter fingerprint differs from the current
    /// filter. Absence of a persisted fingerprint counts as changed, even
    /// against an empty current fingerprint.
    pub fn has_server_entry_filter_changed(
        &self,
        filter: &ServerEntryFilter,
    ) -> Result<bool, StoreError> {
        let previous = self.get_value(BUCKET_KEY_VALUES, KEY_LAST_SERVER_ENTRY_FILTER.as_bytes())?;
        Ok(match previous {
            None => true,
            Some(previous) => previous != filter.fingerprint(),
        })
    }

    /// Remove every server entry and any dial parameters that reference
    /// them. Explicit reset only.
    pub fn delete_all_server_entries(&self) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            for bucket in [BUCKET_SERVER_ENTRIES, BUCKET_DIAL_PARAMETERS] {
                tx.execute(
                    "DELETE FROM buckets WHERE bucket = ?1",
                    rusqlite::params![bucket],
                )?;
            }
            tx.execute(
                "DELETE FROM buckets WHERE bucket = ?1 AND key = ?2",
                rusqlite::params![BUCKET_KEY_VALUES, KEY_AFFINITY_SERVER_ENTRY_ID.as_bytes()],
            )?;
            Ok(())
        })
    }
}

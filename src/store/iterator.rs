//! Candidate iteration in rank order.
//!
//! Each establishment round iterates server entries in this order: the
//! affinity entry (when the persisted filter fingerprint still matches),
//! then, in the first round, entries that have a dial parameters record
//! for the current network, then the uniformly shuffled remainder. Filters
//! for region and tactics capability apply as entries are yielded, so a
//! stale or corrupt record costs one skip, never the round.

use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};

use super::entries::{ServerEntry, ServerEntryFilter};
use super::{Datastore, StoreError, BUCKET_SERVER_ENTRIES};
use crate::params::{Parameters, REPLAY_CANDIDATE_COUNT};

/// Iterates stored server entries in rank order.
///
/// Not designed for concurrent use: the related store operations are not
/// performed in a single transaction, so confine an iterator to one task.
pub struct ServerEntryIterator {
    store: Arc<Datastore>,
    params: Arc<Parameters>,
    filter: ServerEntryFilter,
    network_id: String,
    apply_affinity: bool,
    is_tactics: bool,
    entry_ids: Vec<Vec<u8>>,
    entry_index: usize,
    target: Option<TargetState>,
}

struct TargetState {
    entry: ServerEntry,
    has_next: bool,
}

impl ServerEntryIterator {
    /// Create an iterator for tunnel establishment.
    ///
    /// The boolean result reports whether the first candidate(s) should be
    /// treated as affinity servers: true only when an entry was previously
    /// promoted *and* the persisted filter fingerprint byte-equals the
    /// current one. When the filter changed (say, from a specific region to
    /// any region) the old top entry is arbitrary and gets no preference.
    pub fn new(
        store: Arc<Datastore>,
        params: Arc<Parameters>,
        filter: ServerEntryFilter,
        network_id: impl Into<String>,
    ) -> Result<(bool, Self), StoreError> {
        let apply_affinity = !store.has_server_entry_filter_changed(&filter)?;
        let mut iterator = ServerEntryIterator {
            store,
            params,
            filter,
            network_id: network_id.into(),
            apply_affinity,
            is_tactics: false,
            entry_ids: Vec::new(),
            entry_index: 0,
            target: None,
        };
        iterator.reset_internal(true)?;
        Ok((apply_affinity, iterator))
    }

    /// Create an iterator for tactics requests. Tactics iteration ignores
    /// region and affinity; it only needs a server speaking a
    /// tactics-capable profile.
    pub fn new_tactics(
        store: Arc<Datastore>,
        params: Arc<Parameters>,
        network_id: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let mut iterator = ServerEntryIterator {
            store,
            params,
            filter: ServerEntryFilter::default(),
            network_id: network_id.into(),
            apply_affinity: false,
            is_tactics: true,
            entry_ids: Vec::new(),
            entry_index: 0,
            target: None,
        };
        iterator.reset_internal(true)?;
        Ok(iterator)
    }

    /// Create an iterator that yields exactly one inlined entry, bypassing
    /// the store. Used when configuration pins a single target server.
    pub fn new_target(
        store: Arc<Datastore>,
        params: Arc<Parameters>,
        filter: ServerEntryFilter,
        network_id: impl Into<String>,
        entry: ServerEntry,
        is_tactics: bool,
    ) -> Result<(bool, Self), StoreError> {
        if is_tactics {
            if entry.supported_tactics_profiles().is_empty() {
                return Err(StoreError::InvalidServerEntry(
                    "target server entry supports no tactics profiles".to_string(),
                ));
            }
        } else {
            if !filter.egress_region.is_empty() && entry.region != filter.egress_region {
                return Err(StoreError::InvalidServerEntry(
                    "target server entry does not match egress region".to_string(),
                ));
            }
            if entry.supported_profiles(&filter.limit_tunnel_protocols).is_empty() {
                return Err(StoreError::InvalidServerEntry(
                    "target server entry supports no permitted protocols".to_string(),
                ));
            }
        }

        info!(server = entry.ip_address.as_str(), "using target server entry");

        Ok((
            false,
            ServerEntryIterator {
                store,
                params,
                filter,
                network_id: network_id.into(),
                apply_affinity: false,
                is_tactics,
                entry_ids: Vec::new(),
                entry_index: 0,
                target: Some(TargetState {
                    entry,
                    has_next: true,
                }),
            },
        ))
    }

    /// Restart the cycle. The next call to [`next`](Self::next) returns the
    /// first entry of a fresh ordering; affinity and replay partitioning
    /// apply only to the initial round.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.reset_internal(false)
    }

    fn reset_internal(&mut self, initial_round: bool) -> Result<(), StoreError> {
        self.entry_ids.clear();
        self.entry_index = 0;

        if let Some(target) = &mut self.target {
            target.has_next = true;
            return Ok(());
        }

        let mut entry_ids: Vec<Vec<u8>> = Vec::new();
        let mut shuffle_head = 0;
        let mut affinity_id: Option<Vec<u8>> = None;

        // In the first round only, the affinity candidate takes slot 0.
        if initial_round && self.apply_affinity {
            if let Some(id) = self.store.affinity_server_entry_id()? {
                let id = id.into_bytes();
                entry_ids.push(id.clone());
                affinity_id = Some(id);
                shuffle_head = 1;
            }
        }

        for key in self.store.bucket_keys(BUCKET_SERVER_ENTRIES)? {
            if affinity_id.as_deref() == Some(key.as_slice()) {
                continue;
            }
            entry_ids.push(key);
        }

        // Uniformly shuffle everything outside the affinity slot.
        let mut rng = rand::thread_rng();
        for i in (shuffle_head..entry_ids.len()).rev() {
            if i <= shuffle_head {
                break;
            }
            let j = rng.gen_range(shuffle_head..=i);
            entry_ids.swap(i, j);
        }

        // In the first round only, move potential replay candidates to the
        // front of the shuffled region. The move is post-shuffle, so order
        // stays random within each partition. To avoid unmarshalling every
        // record, this checks only that a dial parameters record exists for
        // the current network; whether it is still live for replay (TTL,
        // whitelist) is checked at replay time.
        if initial_round && self.params.get().int(REPLAY_CANDIDATE_COUNT) > 0 {
            let mut i = shuffle_head;
            let mut j = entry_ids.len().saturating_sub(1);
            while i < j {
                while i < j && self.has_replay_record(&entry_ids[i])? {
                    i += 1;
                }
                while i < j && !self.has_replay_record(&entry_ids[j])? {
                    j -= 1;
                }
                if i < j {
                    entry_ids.swap(i, j);
                    i += 1;
                    j -= 1;
                }
            }
        }

        self.entry_ids = entry_ids;
        Ok(())
    }

    fn has_replay_record(&self, entry_id: &[u8]) -> Result<bool, StoreError> {
        let ip_address = String::from_utf8_lossy(entry_id);
        self.store
            .has_dial_parameters(&ip_address, &self.network_id)
    }

    /// The next candidate in rank order, or `None` at the end of the cycle.
    ///
    /// Entries that are missing, corrupt, or filtered out are skipped, not
    /// fatal.
    pub fn next(&mut self) -> Result<Option<ServerEntry>, StoreError> {
        if let Some(target) = &mut self.target {
            if target.has_next {
                target.has_next = false;
                return Ok(Some(target.entry.clone()));
            }
            return Ok(None);
        }

        loop {
            if self.entry_index >= self.entry_ids.len() {
                return Ok(None);
            }

            let entry_id = self.entry_ids[self.entry_index].clone();
            self.entry_index += 1;

            let ip_address = String::from_utf8_lossy(&entry_id).into_owned();
            let entry = match self.store.get_server_entry(&ip_address)? {
                Some(entry) => entry,
                None => {
                    // Corruption or a concurrent delete; keep iterating.
                    warn!(server = ip_address.as_str(), "skipping missing server entry");
                    continue;
                }
            };

            if self.is_tactics {
                if !entry.supported_tactics_profiles().is_empty() {
                    return Ok(Some(entry));
                }
            } else if self.filter.egress_region.is_empty()
                || entry.region == self.filter.egress_region
            {
                return Ok(Some(entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entries::tests::make_entry;
    use crate::store::DialParameters;
    use crate::obfuscation::{Seed, SEED_LENGTH};
    use std::collections::HashMap;
    use std::time::Duration;

    fn seeded_store(ips: &[&str]) -> Arc<Datastore> {
        let store = Arc::new(Datastore::open_in_memory().unwrap());
        for ip in ips {
            store
                .store_server_entry(&make_entry(ip, "CA", 1), false)
                .unwrap();
        }
        store
    }

    fn collect_ips(iterator: &mut ServerEntryIterator) -> Vec<String> {
        let mut ips = Vec::new();
        while let Some(entry) = iterator.next().unwrap() {
            ips.push(entry.ip_address);
        }
        ips
    }

    fn test_dial_params() -> DialParameters {
        DialParameters::new(
            "chrome-62",
            None,
            "",
            Some(Seed::from_bytes(&[9u8; SEED_LENGTH]).unwrap()),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_visits_each_entry_exactly_once_and_reset() {
        let ips = ["192.0.2.1", "192.0.2.2", "192.0.2.3", "192.0.2.4"];
        let store = seeded_store(&ips);
        let params = Arc::new(Parameters::new());

        let (honor_affinity, mut iterator) = ServerEntryIterator::new(
            store,
            params,
            ServerEntryFilter::default(),
            "wifi-1",
        )
        .unwrap();
        assert!(!honor_affinity);

        let mut seen = collect_ips(&mut iterator);
        seen.sort();
        assert_eq!(seen, ips);

        // Exhausted until reset.
        assert!(iterator.next().unwrap().is_none());
        iterator.reset().unwrap();
        let mut seen = collect_ips(&mut iterator);
        seen.sort();
        assert_eq!(seen, ips);
    }

    #[test]
    fn test_affinity_honored_when_filter_matches() {
        let store = seeded_store(&["192.0.2.1", "192.0.2.2", "192.0.2.3"]);
        let params = Arc::new(Parameters::new());
        let filter = ServerEntryFilter {
            egress_region: "CA".to_string(),
            limit_tunnel_protocols: Vec::new(),
        };
        store.promote_server_entry("192.0.2.2", &filter).unwrap();

        for _ in 0..20 {
            let (honor_affinity, mut iterator) = ServerEntryIterator::new(
                store.clone(),
                params.clone(),
                filter.clone(),
                "wifi-1",
            )
            .unwrap();
            assert!(honor_affinity);
            let first = iterator.next().unwrap().unwrap();
            assert_eq!(first.ip_address, "192.0.2.2");
        }
    }

    #[test]
    fn test_affinity_broken_by_filter_change() {
        let store = seeded_store(&["192.0.2.1", "192.0.2.2", "192.0.2.3"]);
        let params = Arc::new(Parameters::new());
        let promoted_under = ServerEntryFilter {
            egress_region: "CA".to_string(),
            limit_tunnel_protocols: Vec::new(),
        };
        store
            .promote_server_entry("192.0.2.2", &promoted_under)
            .unwrap();

        let current = ServerEntryFilter::default();
        let (honor_affinity, mut iterator) =
            ServerEntryIterator::new(store, params, current, "wifi-1").unwrap();
        assert!(!honor_affinity);
        // All three entries still come out; order is just unprivileged.
        assert_eq!(collect_ips(&mut iterator).len(), 3);
    }

    #[test]
    fn test_replay_candidates_partitioned_to_front() {
        let store = seeded_store(&["192.0.2.1", "192.0.2.2"]);
        let params = Arc::new(Parameters::new());
        store
            .set_dial_parameters("192.0.2.1", "wifi-1", &test_dial_params())
            .unwrap();

        for _ in 0..20 {
            let (_, mut iterator) = ServerEntryIterator::new(
                store.clone(),
                params.clone(),
                ServerEntryFilter::default(),
                "wifi-1",
            )
            .unwrap();
            let ips = collect_ips(&mut iterator);
            assert_eq!(ips, vec!["192.0.2.1", "192.0.2.2"]);
        }

        // A record on a different network does not rank the entry.
        store.delete_dial_parameters("192.0.2.1", "wifi-1").unwrap();
        store
            .set_dial_parameters("192.0.2.2", "cell-9", &test_dial_params())
            .unwrap();
        let mut first_counts = HashMap::new();
        for _ in 0..100 {
            let (_, mut iterator) = ServerEntryIterator::new(
                store.clone(),
                params.clone(),
                ServerEntryFilter::default(),
                "wifi-1",
            )
            .unwrap();
            let ips = collect_ips(&mut iterator);
            *first_counts.entry(ips[0].clone()).or_insert(0) += 1;
        }
        // Without an applicable replay record the order is shuffled; both
        // entries should lead sometimes.
        assert_eq!(first_counts.len(), 2);
    }

    #[test]
    fn test_replay_partition_disabled_by_candidate_count() {
        let store = seeded_store(&["192.0.2.1", "192.0.2.2"]);
        let params = Arc::new(Parameters::new());
        let mut apply = HashMap::new();
        apply.insert(REPLAY_CANDIDATE_COUNT.to_string(), serde_json::json!(0));
        params.set("", false, &apply).unwrap();

        store
            .set_dial_parameters("192.0.2.2", "wifi-1", &test_dial_params())
            .unwrap();

        let mut leads_with_replay = 0;
        for _ in 0..200 {
            let (_, mut iterator) = ServerEntryIterator::new(
                store.clone(),
                params.clone(),
                ServerEntryFilter::default(),
                "wifi-1",
            )
            .unwrap();
            if collect_ips(&mut iterator)[0] == "192.0.2.2" {
                leads_with_replay += 1;
            }
        }
        // No partitioning: roughly a fair coin, certainly not always.
        assert!(leads_with_replay > 20 && leads_with_replay < 180);
    }

    #[test]
    fn test_region_filter() {
        let store = Arc::new(Datastore::open_in_memory().unwrap());
        store
            .store_server_entry(&make_entry("192.0.2.1", "CA", 1), false)
            .unwrap();
        store
            .store_server_entry(&make_entry("192.0.2.2", "US", 1), false)
            .unwrap();
        let params = Arc::new(Parameters::new());

        let filter = ServerEntryFilter {
            egress_region: "US".to_string(),
            limit_tunnel_protocols: Vec::new(),
        };
        let (_, mut iterator) =
            ServerEntryIterator::new(store, params, filter, "wifi-1").unwrap();
        assert_eq!(collect_ips(&mut iterator), vec!["192.0.2.2"]);
    }

    #[test]
    fn test_tactics_filter() {
        let store = Arc::new(Datastore::open_in_memory().unwrap());
        store
            .store_server_entry(&make_entry("192.0.2.1", "CA", 1), false)
            .unwrap();
        let mut plain = make_entry("192.0.2.2", "CA", 1);
        plain.capabilities = vec!["tls".to_string()];
        plain.dial_ports = [("tls".to_string(), 443)].into_iter().collect();
        store.store_server_entry(&plain, false).unwrap();
        let params = Arc::new(Parameters::new());

        let mut iterator =
            ServerEntryIterator::new_tactics(store, params, "wifi-1").unwrap();
        // Only the entry with a tactics-capable profile comes out.
        assert_eq!(collect_ips(&mut iterator), vec!["192.0.2.1"]);
    }

    #[test]
    fn test_corrupt_entry_skipped() {
        let store = seeded_store(&["192.0.2.1"]);
        store
            .set_value(BUCKET_SERVER_ENTRIES, b"192.0.2.250", b"garbage")
            .unwrap();
        let params = Arc::new(Parameters::new());

        let (_, mut iterator) = ServerEntryIterator::new(
            store,
            params,
            ServerEntryFilter::default(),
            "wifi-1",
        )
        .unwrap();
        assert_eq!(collect_ips(&mut iterator), vec!["192.0.2.1"]);
    }

    #[test]
    fn test_target_iterator_yields_once() {
        let store = Arc::new(Datastore::open_in_memory().unwrap());
        let params = Arc::new(Parameters::new());
        let entry = make_entry("203.0.113.5", "CA", 1);

        let (honor_affinity, mut iterator) = ServerEntryIterator::new_target(
            store,
            params,
            ServerEntryFilter::default(),
            "wifi-1",
            entry.clone(),
            false,
        )
        .unwrap();
        assert!(!honor_affinity);
        assert_eq!(iterator.next().unwrap().unwrap(), entry);
        assert!(iterator.next().unwrap().is_none());

        iterator.reset().unwrap();
        assert!(iterator.next().unwrap().is_some());
    }

    #[test]
    fn test_target_iterator_validates_constraints() {
        let store = Arc::new(Datastore::open_in_memory().unwrap());
        let params = Arc::new(Parameters::new());
        let entry = make_entry("203.0.113.5", "CA", 1);

        let filter = ServerEntryFilter {
            egress_region: "US".to_string(),
            limit_tunnel_protocols: Vec::new(),
        };
        assert!(ServerEntryIterator::new_target(
            store.clone(),
            params.clone(),
            filter,
            "wifi-1",
            entry.clone(),
            false,
        )
        .is_err());

        let mut no_tactics = entry;
        no_tactics.capabilities = vec!["tls".to_string()];
        no_tactics.dial_ports = [("tls".to_string(), 443)].into_iter().collect();
        assert!(ServerEntryIterator::new_target(
            store,
            params,
            ServerEntryFilter::default(),
            "wifi-1",
            no_tactics,
            true,
        )
        .is_err());
    }
}

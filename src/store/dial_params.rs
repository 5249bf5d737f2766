//! Dial parameters cache.
//!
//! After a fully verified handshake, the exact parameters that produced it
//! (TLS profile, randomized hello seed, SNI, obfuscator padding seed) are
//! recorded against `(server IP, network id)` so a later attempt on the same
//! network can replay the same wire image.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Datastore, StoreError, BUCKET_DIAL_PARAMETERS};
use crate::obfuscation::Seed;
use crate::params::{ParameterSnapshot, LIMIT_TLS_PROFILES, REPLAY_DIAL_PARAMETERS_TTL};

/// The parameters behind one successful dial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialParameters {
    /// TLS profile used.
    pub tls_profile: String,
    /// Seed that generated the randomized ClientHello, when the profile is
    /// randomized.
    pub randomized_hello_seed: Option<Seed>,
    /// SNI actually presented; empty when SNI was omitted.
    pub sni_server_name: String,
    /// Seed that drove the obfuscator padding; absent for profiles that do
    /// not layer the obfuscator.
    pub obfuscator_padding_seed: Option<Seed>,
    /// Unix seconds at which the record was written.
    pub last_success_timestamp: u64,
    /// Lifetime in seconds, captured from the snapshot at write time.
    pub ttl_seconds: u64,
}

impl DialParameters {
    pub fn new(
        tls_profile: impl Into<String>,
        randomized_hello_seed: Option<Seed>,
        sni_server_name: impl Into<String>,
        obfuscator_padding_seed: Option<Seed>,
        ttl: Duration,
    ) -> Self {
        DialParameters {
            tls_profile: tls_profile.into(),
            randomized_hello_seed,
            sni_server_name: sni_server_name.into(),
            obfuscator_padding_seed,
            last_success_timestamp: unix_seconds(SystemTime::now()),
            ttl_seconds: ttl.as_secs(),
        }
    }

    /// Whether the record may drive a replay under the current snapshot:
    /// within its TTL, replay not disabled, and its profile still
    /// whitelisted. Ineligibility is not an error; the caller just
    /// generates fresh parameters.
    pub fn is_replay_eligible(&self, snapshot: &ParameterSnapshot) -> bool {
        // A published TTL of zero is the operator's replay kill switch: it
        // must also stop records written under an earlier, non-zero TTL.
        if snapshot.duration(REPLAY_DIAL_PARAMETERS_TTL).is_zero() {
            return false;
        }
        let age = unix_seconds(SystemTime::now()).saturating_sub(self.last_success_timestamp);
        if age > self.ttl_seconds {
            return false;
        }
        let whitelist = snapshot.string_list(LIMIT_TLS_PROFILES);
        whitelist.is_empty() || whitelist.iter().any(|name| *name == self.tls_profile)
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

pub(crate) fn make_dial_parameters_key(server_ip_address: &str, network_id: &str) -> Vec<u8> {
    let mut key = server_ip_address.as_bytes().to_vec();
    key.extend_from_slice(network_id.as_bytes());
    key
}

impl Datastore {
    /// Record dial parameters for a server/network pair.
    pub fn set_dial_parameters(
        &self,
        server_ip_address: &str,
        network_id: &str,
        dial_params: &DialParameters,
    ) -> Result<(), StoreError> {
        let key = make_dial_parameters_key(server_ip_address, network_id);
        let data = serde_json::to_vec(dial_params)
            .map_err(|err| StoreError::InvalidServerEntry(err.to_string()))?;
        self.set_value(BUCKET_DIAL_PARAMETERS, &key, &data)
    }

    /// Fetch dial parameters for a server/network pair. Absent and corrupt
    /// records both yield `None`.
    pub fn get_dial_parameters(
        &self,
        server_ip_address: &str,
        network_id: &str,
    ) -> Result<Option<DialParameters>, StoreError> {
        let key = make_dial_parameters_key(server_ip_address, network_id);
        let Some(data) = self.get_value(BUCKET_DIAL_PARAMETERS, &key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&data) {
            Ok(dial_params) => Ok(Some(dial_params)),
            Err(err) => {
                warn!(
                    server = server_ip_address,
                    error = %err,
                    "corrupt dial parameters record"
                );
                Ok(None)
            }
        }
    }

    pub fn delete_dial_parameters(
        &self,
        server_ip_address: &str,
        network_id: &str,
    ) -> Result<(), StoreError> {
        let key = make_dial_parameters_key(server_ip_address, network_id);
        self.delete_value(BUCKET_DIAL_PARAMETERS, &key)
    }

    /// Whether any dial parameters record exists for the pair. Used by the
    /// iterator's replay partition, which deliberately checks presence only;
    /// TTL and whitelist are evaluated at replay time.
    pub fn has_dial_parameters(
        &self,
        server_ip_address: &str,
        network_id: &str,
    ) -> Result<bool, StoreError> {
        let key = make_dial_parameters_key(server_ip_address, network_id);
        Ok(self.get_value(BUCKET_DIAL_PARAMETERS, &key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;
    use crate::obfuscation::SEED_LENGTH;
    use std::collections::HashMap;

    fn test_seed(byte: u8) -> Seed {
        Seed::from_bytes(&[byte; SEED_LENGTH]).unwrap()
    }

    fn make_params() -> DialParameters {
        DialParameters::new(
            "chrome-62",
            Some(test_seed(1)),
            "www.example.org",
            Some(test_seed(2)),
            Duration::from_secs(60 * 60),
        )
    }

    #[test]
    fn test_roundtrip_structural_equality() {
        let store = Datastore::open_in_memory().unwrap();
        let dial_params = make_params();

        store
            .set_dial_parameters("192.0.2.1", "wifi-1", &dial_params)
            .unwrap();
        let fetched = store
            .get_dial_parameters("192.0.2.1", "wifi-1")
            .unwrap()
            .unwrap();
        assert_eq!(fetched, dial_params);

        // The key is ip ‖ networkId; a different network misses.
        assert!(store
            .get_dial_parameters("192.0.2.1", "cell-2")
            .unwrap()
            .is_none());

        store.delete_dial_parameters("192.0.2.1", "wifi-1").unwrap();
        assert!(store
            .get_dial_parameters("192.0.2.1", "wifi-1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_has_dial_parameters_checks_presence_only() {
        let store = Datastore::open_in_memory().unwrap();
        let mut dial_params = make_params();
        // Expired record still counts as present.
        dial_params.last_success_timestamp = 0;
        dial_params.ttl_seconds = 1;
        store
            .set_dial_parameters("192.0.2.1", "wifi-1", &dial_params)
            .unwrap();
        assert!(store.has_dial_parameters("192.0.2.1", "wifi-1").unwrap());
    }

    #[test]
    fn test_replay_eligibility() {
        let params = Parameters::new();
        let snapshot = params.get();

        let fresh = make_params();
        assert!(fresh.is_replay_eligible(&snapshot));

        let mut expired = make_params();
        expired.last_success_timestamp = 0;
        assert!(!expired.is_replay_eligible(&snapshot));

        // Whitelist that excludes the recorded profile.
        let mut apply = HashMap::new();
        apply.insert(
            LIMIT_TLS_PROFILES.to_string(),
            serde_json::json!(["firefox-56"]),
        );
        params.set("", false, &apply).unwrap();
        assert!(!fresh.is_replay_eligible(&params.get()));

        // Whitelist that includes it.
        let mut apply = HashMap::new();
        apply.insert(
            LIMIT_TLS_PROFILES.to_string(),
            serde_json::json!(["chrome-62"]),
        );
        params.set("", false, &apply).unwrap();
        assert!(fresh.is_replay_eligible(&params.get()));
    }

    #[test]
    fn test_replay_disabled_by_zero_ttl() {
        let params = Parameters::new();
        let fresh = make_params();
        assert!(fresh.is_replay_eligible(&params.get()));

        // Publishing a zero TTL denies replay even for records written
        // under the earlier, longer TTL.
        let mut apply = HashMap::new();
        apply.insert(
            REPLAY_DIAL_PARAMETERS_TTL.to_string(),
            serde_json::json!(0),
        );
        params.set("", false, &apply).unwrap();
        assert!(!fresh.is_replay_eligible(&params.get()));
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let store = Datastore::open_in_memory().unwrap();
        let key = make_dial_parameters_key("192.0.2.1", "wifi-1");
        store
            .set_value(BUCKET_DIAL_PARAMETERS, &key, b"not json")
            .unwrap();
        assert!(store
            .get_dial_parameters("192.0.2.1", "wifi-1")
            .unwrap()
            .is_none());
    }
}

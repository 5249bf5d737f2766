//! Tunnel establishment.
//!
//! One attempt: candidate from the iterator → parameter snapshot → dial
//! parameters (replayed from the cache when live, fresh otherwise) → custom
//! TLS dial → on success, promote the entry and persist what worked.
//!
//! Attempts run on a bounded worker pool; the first verified connection
//! wins and the rest are canceled. The iterator is confined to the
//! coordinating task.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::params::{
    ParameterSnapshot, Parameters, CONNECTION_WORKER_POOL_SIZE, REPLAY_DIAL_PARAMETERS_TTL,
    TUNNEL_CONNECT_TIMEOUT,
};
use crate::store::{Datastore, DialParameters, ServerEntry, ServerEntryFilter, ServerEntryIterator};
use crate::tls::{
    dial, CustomTlsConfig, DialError, ObfuscationLayer, RawDialer, TunnelConn,
};
use crate::{Error, Result};

/// Transport profile preferred when a candidate offers it.
const PREFERRED_PROFILE: &str = "obfuscated-tls";

/// Inputs for tunnel establishment.
pub struct EstablishConfig {
    pub store: Arc<Datastore>,
    pub params: Arc<Parameters>,
    pub filter: ServerEntryFilter,
    /// Identifier of the current network (for example an SSID hash); scopes
    /// dial parameter replay.
    pub network_id: String,
    /// When set, the only candidate; the store is bypassed.
    pub target_server_entry: Option<ServerEntry>,
    pub raw_dialer: Arc<dyn RawDialer>,
    /// Disable certificate verification. Circumvention endpoints typically
    /// present self-signed certificates and authenticate at the inner
    /// channel instead.
    pub skip_verify: bool,
}

/// An established tunnel and the parameters that produced it.
pub struct EstablishedTunnel {
    pub conn: TunnelConn,
    pub server_entry: ServerEntry,
    pub dial_params: DialParameters,
    /// Whether this dial replayed a cached parameter record.
    pub replayed: bool,
}

/// Establish one tunnel, racing attempts across the worker pool until one
/// verified connection wins or candidates run out.
pub async fn establish_tunnel(
    token: &CancellationToken,
    config: &EstablishConfig,
) -> Result<EstablishedTunnel> {
    let snapshot = config.params.get();
    let pool_size = snapshot.int(CONNECTION_WORKER_POOL_SIZE).max(1) as usize;

    let (honor_affinity, mut iterator) = match &config.target_server_entry {
        Some(entry) => ServerEntryIterator::new_target(
            config.store.clone(),
            config.params.clone(),
            config.filter.clone(),
            config.network_id.clone(),
            entry.clone(),
            false,
        )?,
        None => ServerEntryIterator::new(
            config.store.clone(),
            config.params.clone(),
            config.filter.clone(),
            config.network_id.clone(),
        )?,
    };
    debug!(honor_affinity, "starting tunnel establishment");

    let attempt_token = token.child_token();
    let mut attempts: JoinSet<Result<EstablishedTunnel>> = JoinSet::new();
    let mut exhausted = false;

    loop {
        while attempts.len() < pool_size && !exhausted {
            match iterator.next()? {
                Some(entry) => {
                    let attempt = Attempt {
                        store: config.store.clone(),
                        params: config.params.clone(),
                        snapshot: snapshot.clone(),
                        filter: config.filter.clone(),
                        network_id: config.network_id.clone(),
                        raw_dialer: config.raw_dialer.clone(),
                        skip_verify: config.skip_verify,
                        entry,
                    };
                    let token = attempt_token.clone();
                    attempts.spawn(async move { attempt.run(&token).await });
                }
                None => exhausted = true,
            }
        }

        if attempts.is_empty() {
            return Err(Error::CandidatesExhausted);
        }

        tokio::select! {
            _ = token.cancelled() => {
                attempt_token.cancel();
                attempts.shutdown().await;
                return Err(Error::Dial(DialError::Canceled));
            }
            joined = attempts.join_next() => {
                match joined {
                    Some(Ok(Ok(established))) => {
                        // First success wins; stop the losers before they
                        // finish their handshakes.
                        attempt_token.cancel();
                        attempts.shutdown().await;
                        return Ok(established);
                    }
                    Some(Ok(Err(err))) => {
                        debug!(error = %err, "tunnel attempt failed");
                    }
                    Some(Err(join_err)) => {
                        warn!(error = %join_err, "tunnel attempt panicked");
                    }
                    None => {}
                }
            }
        }
    }
}

struct Attempt {
    store: Arc<Datastore>,
    params: Arc<Parameters>,
    snapshot: Arc<ParameterSnapshot>,
    filter: ServerEntryFilter,
    network_id: String,
    raw_dialer: Arc<dyn RawDialer>,
    skip_verify: bool,
    entry: ServerEntry,
}

impl Attempt {
    async fn run(&self, token: &CancellationToken) -> Result<EstablishedTunnel> {
        let entry = &self.entry;

        let (capability, port) = choose_dial_capability(entry, &self.filter).ok_or_else(|| {
            Error::Dial(DialError::Config(format!(
                "server {} offers no permitted transport profile",
                entry.ip_address
            )))
        })?;
        let addr = format!("{}:{}", entry.ip_address, port);

        // Replay the cached parameters when the record is still live under
        // the current snapshot; fall back to fresh generation silently.
        let cached = self
            .store
            .get_dial_parameters(&entry.ip_address, &self.network_id)?
            .filter(|record| record.is_replay_eligible(&self.snapshot));
        let replayed = cached.is_some();

        let mut tls_config = CustomTlsConfig::new(self.params.clone());
        tls_config.skip_verify = self.skip_verify;
        // The capability names the wire stack: plain "tls" dials bare, the
        // obfuscated and fronted variants layer the obfuscator (for
        // profiles whose class calls for it).
        if capability != "tls" {
            tls_config.obfuscation = Some(ObfuscationLayer {
                keyword: entry.obfuscation_keyword.clone(),
                padding_seed: cached
                    .as_ref()
                    .and_then(|record| record.obfuscator_padding_seed),
                min_padding: None,
                max_padding: None,
            });
        }
        if let Some(record) = &cached {
            tls_config.tls_profile = Some(record.tls_profile.clone());
            tls_config.randomized_hello_seed = record.randomized_hello_seed;
            if !record.sni_server_name.is_empty() {
                tls_config.sni_server_name = Some(record.sni_server_name.clone());
            }
        }

        debug!(
            server = entry.ip_address.as_str(),
            capability = capability.as_str(),
            replayed,
            "dialing candidate"
        );

        let connect_timeout = self.snapshot.duration(TUNNEL_CONNECT_TIMEOUT);
        let dialed = tokio::time::timeout(
            connect_timeout,
            dial(token, "tcp", &addr, &tls_config, self.raw_dialer.as_ref()),
        )
        .await
        // A deadline is just another form of cancellation.
        .unwrap_or(Err(DialError::Canceled));

        let conn = match dialed {
            Ok(conn) => conn,
            Err(err) => {
                if replayed {
                    // The replayed record produced a failure; drop it so the
                    // next attempt generates fresh parameters.
                    let _ = self
                        .store
                        .delete_dial_parameters(&entry.ip_address, &self.network_id);
                }
                return Err(Error::Dial(err));
            }
        };

        let dial_params = DialParameters::new(
            conn.tls_profile(),
            conn.hello_seed().copied(),
            conn.sni_server_name(),
            conn.obfuscator_padding_seed().copied(),
            self.snapshot.duration(REPLAY_DIAL_PARAMETERS_TTL),
        );
        self.store
            .set_dial_parameters(&entry.ip_address, &self.network_id, &dial_params)?;
        self.store
            .promote_server_entry(&entry.ip_address, &self.filter)?;

        info!(
            server = entry.ip_address.as_str(),
            profile = conn.tls_profile(),
            replayed,
            "tunnel established"
        );

        Ok(EstablishedTunnel {
            conn,
            server_entry: entry.clone(),
            dial_params,
            replayed,
        })
    }
}

/// Pick the transport profile to dial: the preferred obfuscated profile
/// when the candidate offers it and the filter permits, otherwise the first
/// permitted capability with a port.
fn choose_dial_capability(
    entry: &ServerEntry,
    filter: &ServerEntryFilter,
) -> Option<(String, u16)> {
    let permitted = entry.supported_profiles(&filter.limit_tunnel_protocols);
    let capability = permitted
        .iter()
        .copied()
        .find(|capability| *capability == PREFERRED_PROFILE)
        .or_else(|| permitted.first().copied())?;
    let port = entry.dial_port(capability)?;
    Some((capability.to_string(), port))
}

/// A deadline helper: a child token that cancels itself after `timeout`.
pub fn deadline_token(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timed = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timed.cancel(),
            _ = timed.cancelled() => {}
        }
    });
    token
}

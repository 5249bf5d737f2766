//! Client-tunable parameters.
//!
//! A [`Parameters`] value holds the active set of tunable knobs. Updates
//! publish a complete immutable [`ParameterSnapshot`] behind an atomic swap;
//! a task takes one `Arc` snapshot at the start of its work and uses it for
//! the duration, so values that cross-validate (a minimum against a maximum,
//! a whitelist against a candidate) always come from a single publication.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::warn;

/// TLS profile whitelist; empty means all supported profiles.
pub const LIMIT_TLS_PROFILES: &str = "LimitTlsProfiles";
/// Tunnel protocol whitelist; empty means all.
pub const LIMIT_TUNNEL_PROTOCOLS: &str = "LimitTunnelProtocols";
/// How many replay candidates the iterator partitions to the front.
pub const REPLAY_CANDIDATE_COUNT: &str = "ReplayCandidateCount";
/// How long a dial parameters record stays replayable.
pub const REPLAY_DIAL_PARAMETERS_TTL: &str = "ReplayDialParametersTtl";
/// Number of concurrent connection attempt workers.
pub const CONNECTION_WORKER_POOL_SIZE: &str = "ConnectionWorkerPoolSize";
/// Timeout for a single tunnel dial attempt.
pub const TUNNEL_CONNECT_TIMEOUT: &str = "TunnelConnectTimeout";
/// Idle timeout for an established tunnel.
pub const IDLE_TUNNEL_TIMEOUT: &str = "IdleTunnelTimeout";
pub const LIVENESS_TEST_MIN_UPSTREAM_BYTES: &str = "LivenessTestMinUpstreamBytes";
pub const LIVENESS_TEST_MAX_UPSTREAM_BYTES: &str = "LivenessTestMaxUpstreamBytes";
pub const LIVENESS_TEST_MIN_DOWNSTREAM_BYTES: &str = "LivenessTestMinDownstreamBytes";
pub const LIVENESS_TEST_MAX_DOWNSTREAM_BYTES: &str = "LivenessTestMaxDownstreamBytes";
/// Rate limits; 0 means unlimited.
pub const UPSTREAM_RATE_LIMIT_BYTES_PER_SECOND: &str = "UpstreamRateLimitBytesPerSecond";
pub const DOWNSTREAM_RATE_LIMIT_BYTES_PER_SECOND: &str = "DownstreamRateLimitBytesPerSecond";
/// Scales all duration parameters; tuned up on high-latency networks.
pub const NETWORK_LATENCY_MULTIPLIER: &str = "NetworkLatencyMultiplier";

/// Parameter errors
#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("type mismatch for parameter {0}")]
    TypeMismatch(String),
}

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Duration(Duration),
    StringList(Vec<String>),
}

struct Definition {
    value: Value,
    minimum: Option<Value>,
}

fn def(value: Value, minimum: Option<Value>) -> Definition {
    Definition { value, minimum }
}

fn default_parameters() -> HashMap<&'static str, Definition> {
    let mut defaults = HashMap::new();
    defaults.insert(LIMIT_TLS_PROFILES, def(Value::StringList(Vec::new()), None));
    defaults.insert(
        LIMIT_TUNNEL_PROTOCOLS,
        def(Value::StringList(Vec::new()), None),
    );
    defaults.insert(
        REPLAY_CANDIDATE_COUNT,
        def(Value::Int(10), Some(Value::Int(-1))),
    );
    defaults.insert(
        REPLAY_DIAL_PARAMETERS_TTL,
        def(
            Value::Duration(Duration::from_secs(24 * 60 * 60)),
            Some(Value::Duration(Duration::ZERO)),
        ),
    );
    defaults.insert(
        CONNECTION_WORKER_POOL_SIZE,
        def(Value::Int(10), Some(Value::Int(1))),
    );
    defaults.insert(
        TUNNEL_CONNECT_TIMEOUT,
        def(
            Value::Duration(Duration::from_secs(20)),
            Some(Value::Duration(Duration::from_secs(1))),
        ),
    );
    defaults.insert(
        IDLE_TUNNEL_TIMEOUT,
        def(
            Value::Duration(Duration::from_secs(5 * 60)),
            Some(Value::Duration(Duration::from_secs(1))),
        ),
    );
    defaults.insert(
        LIVENESS_TEST_MIN_UPSTREAM_BYTES,
        def(Value::Int(0), Some(Value::Int(0))),
    );
    defaults.insert(
        LIVENESS_TEST_MAX_UPSTREAM_BYTES,
        def(Value::Int(0), Some(Value::Int(0))),
    );
    defaults.insert(
        LIVENESS_TEST_MIN_DOWNSTREAM_BYTES,
        def(Value::Int(0), Some(Value::Int(0))),
    );
    defaults.insert(
        LIVENESS_TEST_MAX_DOWNSTREAM_BYTES,
        def(Value::Int(0), Some(Value::Int(0))),
    );
    defaults.insert(
        UPSTREAM_RATE_LIMIT_BYTES_PER_SECOND,
        def(Value::Int(0), Some(Value::Int(0))),
    );
    defaults.insert(
        DOWNSTREAM_RATE_LIMIT_BYTES_PER_SECOND,
        def(Value::Int(0), Some(Value::Int(0))),
    );
    defaults.insert(
        NETWORK_LATENCY_MULTIPLIER,
        def(Value::Float(1.0), Some(Value::Float(1.0))),
    );
    defaults
}

/// An immutable published parameter set.
///
/// Getters never panic: an unknown name or mismatched type is logged and the
/// zero value returned, so a stale caller cannot take the process down.
pub struct ParameterSnapshot {
    tag: String,
    values: HashMap<&'static str, Value>,
}

impl ParameterSnapshot {
    /// The tag supplied with the publication that produced this snapshot.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn int(&self, name: &str) -> i64 {
        match self.values.get(name) {
            Some(Value::Int(v)) => *v,
            _ => {
                warn!(parameter = name, "unknown int parameter");
                0
            }
        }
    }

    pub fn float(&self, name: &str) -> f64 {
        match self.values.get(name) {
            Some(Value::Float(v)) => *v,
            _ => {
                warn!(parameter = name, "unknown float parameter");
                0.0
            }
        }
    }

    /// Durations are scaled by [`NETWORK_LATENCY_MULTIPLIER`].
    pub fn duration(&self, name: &str) -> Duration {
        match self.values.get(name) {
            Some(Value::Duration(v)) => v.mul_f64(self.float(NETWORK_LATENCY_MULTIPLIER)),
            _ => {
                warn!(parameter = name, "unknown duration parameter");
                Duration::ZERO
            }
        }
    }

    pub fn string_list(&self, name: &str) -> Vec<String> {
        match self.values.get(name) {
            Some(Value::StringList(v)) => v.clone(),
            _ => {
                warn!(parameter = name, "unknown string list parameter");
                Vec::new()
            }
        }
    }
}

type Subscriber = Box<dyn Fn(&Arc<ParameterSnapshot>) + Send + Sync>;

/// Handle returned by [`Parameters::subscribe`]; pass it back to
/// [`Parameters::unsubscribe`] to stop notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// The active parameter set with copy-on-publish snapshots.
///
/// Queries return a copy of current state, subscribers are notified after
/// each publication, and the update path is single-writer.
pub struct Parameters {
    snapshot: RwLock<Arc<ParameterSnapshot>>,
    subscribers: parking_lot::Mutex<Vec<(u64, Subscriber)>>,
    next_subscriber_id: std::sync::atomic::AtomicU64,
}

impl Parameters {
    pub fn new() -> Self {
        Parameters {
            snapshot: RwLock::new(Arc::new(make_snapshot(String::new(), &HashMap::new()))),
            subscribers: parking_lot::Mutex::new(Vec::new()),
            next_subscriber_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Register a callback invoked with each newly published snapshot.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Arc<ParameterSnapshot>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self
            .next_subscriber_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.lock().push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.subscribers
            .lock()
            .retain(|(id, _)| *id != subscription.0);
    }

    /// The current snapshot. Hold the `Arc` for the duration of one attempt;
    /// do not re-read mid-decision.
    pub fn get(&self) -> Arc<ParameterSnapshot> {
        self.snapshot.read().clone()
    }

    /// Publish a new snapshot built from defaults plus `apply`.
    ///
    /// Unknown keys are logged and skipped. Out-of-range values are clamped
    /// at the bound. A type mismatch fails the whole publication unless
    /// `skip_on_error` is set, in which case the key is skipped. Returns the
    /// number of keys applied.
    pub fn set(
        &self,
        tag: impl Into<String>,
        skip_on_error: bool,
        apply: &HashMap<String, serde_json::Value>,
    ) -> Result<usize, ParamError> {
        let snapshot = make_checked_snapshot(tag.into(), apply, skip_on_error)?;
        let (snapshot, applied) = snapshot;
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = snapshot.clone();

        // Notify outside the snapshot lock so a subscriber may re-read.
        let subscribers = self.subscribers.lock();
        for (_, callback) in subscribers.iter() {
            callback(&snapshot);
        }
        Ok(applied)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters::new()
    }
}

fn make_snapshot(tag: String, apply: &HashMap<String, serde_json::Value>) -> ParameterSnapshot {
    // Infallible path used for the initial defaults.
    make_checked_snapshot(tag, apply, true)
        .map(|(snapshot, _)| snapshot)
        .unwrap_or(ParameterSnapshot {
            tag: String::new(),
            values: default_parameters()
                .into_iter()
                .map(|(name, definition)| (name, definition.value))
                .collect(),
        })
}

fn make_checked_snapshot(
    tag: String,
    apply: &HashMap<String, serde_json::Value>,
    skip_on_error: bool,
) -> Result<(ParameterSnapshot, usize), ParamError> {
    let defaults = default_parameters();
    let mut values: HashMap<&'static str, Value> = defaults
        .iter()
        .map(|(name, definition)| (*name, definition.value.clone()))
        .collect();

    let mut applied = 0;

    for (key, raw) in apply {
        let Some((name, definition)) = defaults.get_key_value(key.as_str()) else {
            warn!(parameter = key.as_str(), "unknown parameter; skipped");
            continue;
        };

        let parsed = match parse_value(&definition.value, raw) {
            Some(value) => value,
            None => {
                if skip_on_error {
                    warn!(parameter = key.as_str(), "type mismatch; skipped");
                    continue;
                }
                return Err(ParamError::TypeMismatch(key.clone()));
            }
        };

        let clamped = clamp(parsed, definition.minimum.as_ref());
        values.insert(*name, clamped);
        applied += 1;
    }

    Ok((ParameterSnapshot { tag, values }, applied))
}

fn parse_value(template: &Value, raw: &serde_json::Value) -> Option<Value> {
    match template {
        Value::Int(_) => raw.as_i64().map(Value::Int),
        Value::Float(_) => raw.as_f64().map(Value::Float),
        Value::Duration(_) => {
            // Durations are published as integer milliseconds.
            raw.as_i64()
                .filter(|ms| *ms >= 0)
                .map(|ms| Value::Duration(Duration::from_millis(ms as u64)))
        }
        Value::StringList(_) => {
            let list = raw.as_array()?;
            let mut out = Vec::with_capacity(list.len());
            for item in list {
                out.push(item.as_str()?.to_string());
            }
            Some(Value::StringList(out))
        }
    }
}

fn clamp(value: Value, minimum: Option<&Value>) -> Value {
    match (value, minimum) {
        (Value::Int(v), Some(Value::Int(min))) => Value::Int(v.max(*min)),
        (Value::Float(v), Some(Value::Float(min))) => Value::Float(v.max(*min)),
        (Value::Duration(v), Some(Value::Duration(min))) => Value::Duration(v.max(*min)),
        (value, _) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let params = Parameters::new();
        let snapshot = params.get();

        assert_eq!(snapshot.int(REPLAY_CANDIDATE_COUNT), 10);
        assert_eq!(snapshot.int(CONNECTION_WORKER_POOL_SIZE), 10);
        assert_eq!(
            snapshot.duration(TUNNEL_CONNECT_TIMEOUT),
            Duration::from_secs(20)
        );
        assert!(snapshot.string_list(LIMIT_TLS_PROFILES).is_empty());
        assert_eq!(snapshot.float(NETWORK_LATENCY_MULTIPLIER), 1.0);
    }

    #[test]
    fn test_unknown_parameter_returns_zero_value() {
        let params = Parameters::new();
        let snapshot = params.get();
        assert_eq!(snapshot.int("NoSuchParameter"), 0);
        assert!(snapshot.string_list("NoSuchParameter").is_empty());
    }

    #[test]
    fn test_unknown_key_is_skipped() {
        let params = Parameters::new();
        let mut apply = HashMap::new();
        apply.insert("NoSuchParameter".to_string(), json!(42));
        apply.insert(REPLAY_CANDIDATE_COUNT.to_string(), json!(3));

        let applied = params.set("tag", false, &apply).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(params.get().int(REPLAY_CANDIDATE_COUNT), 3);
        assert_eq!(params.get().tag(), "tag");
    }

    #[test]
    fn test_out_of_range_clamped_at_bound() {
        let params = Parameters::new();
        let mut apply = HashMap::new();
        apply.insert(CONNECTION_WORKER_POOL_SIZE.to_string(), json!(0));
        params.set("", false, &apply).unwrap();
        assert_eq!(params.get().int(CONNECTION_WORKER_POOL_SIZE), 1);
    }

    #[test]
    fn test_type_mismatch() {
        let params = Parameters::new();
        let mut apply = HashMap::new();
        apply.insert(REPLAY_CANDIDATE_COUNT.to_string(), json!("not an int"));

        assert!(params.set("", false, &apply).is_err());
        // Failed publication leaves the old snapshot in place.
        assert_eq!(params.get().int(REPLAY_CANDIDATE_COUNT), 10);

        let applied = params.set("", true, &apply).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_network_latency_multiplier_scales_durations() {
        let params = Parameters::new();
        let base = params.get().duration(TUNNEL_CONNECT_TIMEOUT);

        let mut apply = HashMap::new();
        apply.insert(NETWORK_LATENCY_MULTIPLIER.to_string(), json!(2.0));
        params.set("", false, &apply).unwrap();

        assert_eq!(params.get().duration(TUNNEL_CONNECT_TIMEOUT), base * 2);
    }

    #[test]
    fn test_snapshot_isolation() {
        let params = Parameters::new();
        let before = params.get();

        let mut apply = HashMap::new();
        apply.insert(REPLAY_CANDIDATE_COUNT.to_string(), json!(1));
        params.set("", false, &apply).unwrap();

        // The earlier snapshot is unchanged; the new one sees the update.
        assert_eq!(before.int(REPLAY_CANDIDATE_COUNT), 10);
        assert_eq!(params.get().int(REPLAY_CANDIDATE_COUNT), 1);
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let params = Parameters::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let observer = notified.clone();
        let subscription = params.subscribe(move |snapshot| {
            assert_eq!(snapshot.int(REPLAY_CANDIDATE_COUNT), 5);
            observer.fetch_add(1, Ordering::SeqCst);
        });

        let mut apply = HashMap::new();
        apply.insert(REPLAY_CANDIDATE_COUNT.to_string(), json!(5));
        params.set("", false, &apply).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        params.unsubscribe(subscription);
        params.set("", false, &apply).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_whitelist_roundtrip() {
        let params = Parameters::new();
        let mut apply = HashMap::new();
        apply.insert(
            LIMIT_TLS_PROFILES.to_string(),
            json!(["chrome-62", "firefox-56"]),
        );
        params.set("", false, &apply).unwrap();
        assert_eq!(
            params.get().string_list(LIMIT_TLS_PROFILES),
            vec!["chrome-62".to_string(), "firefox-56".to_string()]
        );
    }
}

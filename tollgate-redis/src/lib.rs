//! Redis backend for `tollgate` (companion crate).
//!
//! Two ways to run admission against Redis:
//!
//! - [`RedisStore`] is a [`VersionedStore`]: plain reads plus a Lua compare-and-swap. Wrap it
//!   in [`CasStore`](tollgate::CasStore) and drive it with the generic
//!   [`TokenBucket`](tollgate::TokenBucket) engine.
//! - [`ScriptedLimiter`] runs the whole refill-and-consume step server-side in one Lua
//!   script, so each decision costs a single round trip and can never conflict.
//!
//! Both use the same layout: `<key>:tokens` and `<key>:timestamp`, decimal strings that
//! round-trip `f64`, so buckets written by existing deployments keep working. On Redis
//! Cluster the two keys must share a slot; opt into `{<key>}:tokens` with `with_hash_tag`
//! ([`KeyLayout::HashTag`]). Every process sharing buckets must use the same layout.
//! Each write refreshes the idle TTL on both keys.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use std::sync::Arc;
use std::time::Duration;
use tollgate::config::StoreSettings;
use tollgate::rate_limit::bucket::retry_after;
use std::future::Future;
use tollgate::rate_limit::store::Versioned;
use tollgate::telemetry::emit_best_effort;
use tollgate::{
    AdapterConfig, BucketState, Clock, Decision, LimiterError, LimiterEvent, NullSink, Policy,
    RateLimiter, StoreError, SystemClock, TelemetrySink, VersionedStore,
};

// First word of the script's error reply, which the client reports as the error code.
const CORRUPT_MARKER: &str = "TOLLGATE_CORRUPT";

// KEYS: tokens, timestamp. ARGV: expected tokens ('' = key must be absent), expected
// timestamp, next tokens, next timestamp, ttl ms.
const CAS_SCRIPT: &str = r#"
local tokens = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if tokens then return 0 end
else
  local stamp = redis.call('GET', KEYS[2])
  if tokens ~= ARGV[1] or stamp ~= ARGV[2] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[5])
redis.call('SET', KEYS[2], ARGV[4], 'PX', ARGV[5])
return 1
"#;

// KEYS: tokens, timestamp. ARGV: capacity, rate, now, ttl ms.
// Returns {allowed, refilled, remaining}; floats as %.17g strings so nothing is lost.
const ADMIT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local tokens = capacity
local stamp = now
local raw_tokens = redis.call('GET', KEYS[1])
if raw_tokens then
  local raw_stamp = redis.call('GET', KEYS[2])
  tokens = tonumber(raw_tokens)
  stamp = raw_stamp and tonumber(raw_stamp)
  if not tokens or not stamp then
    return redis.error_reply('TOLLGATE_CORRUPT bucket state unreadable')
  end
end
local refilled = math.min(capacity, tokens + math.max(0, now - stamp) * rate)
local allowed = 0
local remaining = refilled
if refilled >= 1 then
  allowed = 1
  remaining = refilled - 1
end
local stored = string.format('%.17g', math.max(stamp, now))
local left = string.format('%.17g', remaining)
redis.call('SET', KEYS[1], left, 'PX', ARGV[4])
redis.call('SET', KEYS[2], stored, 'PX', ARGV[4])
return {allowed, string.format('%.17g', refilled), left}
"#;

/// How a bucket key maps onto its two Redis keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyLayout {
    /// `<key>:tokens` and `<key>:timestamp`.
    #[default]
    Plain,
    /// `{<key>}:tokens` and `{<key>}:timestamp`, a Redis Cluster hash tag that pins both
    /// keys to one slot.
    HashTag,
}

impl KeyLayout {
    /// Store keys for one bucket: `(tokens, timestamp)`.
    pub fn keys(self, key: &str) -> (String, String) {
        match self {
            KeyLayout::Plain => (format!("{}:tokens", key), format!("{}:timestamp", key)),
            KeyLayout::HashTag => (format!("{{{}}}:tokens", key), format!("{{{}}}:timestamp", key)),
        }
    }
}

/// Store keys for one bucket in the default layout: `(<key>:tokens, <key>:timestamp)`.
pub fn bucket_keys(key: &str) -> (String, String) {
    KeyLayout::Plain.keys(key)
}

/// Connection parameters for [`redis::Client::open`].
pub fn connection_info(settings: &StoreSettings) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(settings.host.clone(), settings.port),
        redis: RedisConnectionInfo {
            db: i64::from(settings.database),
            username: settings.username.clone(),
            password: settings.password.clone(),
            ..Default::default()
        },
    }
}

/// Open a managed, auto-reconnecting connection described by `settings`.
pub async fn connect(settings: &StoreSettings) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(connection_info(settings)).map_err(StoreError::backend)?;
    ConnectionManager::new(client).await.map_err(StoreError::backend)
}

fn format_value(value: f64) -> String {
    // `Display` prints the shortest string that parses back to the same f64.
    value.to_string()
}

fn parse_value(key: &str, raw: &str) -> Result<f64, StoreError> {
    raw.parse::<f64>().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        detail: format!("not a number: {:?}", raw),
    })
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_redis_error(key: &str, err: redis::RedisError) -> StoreError {
    if err.to_string().contains(CORRUPT_MARKER) {
        StoreError::Corrupt { key: key.to_string(), detail: err.to_string() }
    } else {
        StoreError::backend(err)
    }
}

/// Raw stored strings of a bucket, compared verbatim by the CAS script.
///
/// Stored timestamps never decrease and tokens strictly decrease between writes at the
/// same timestamp, so a pair never reappears once overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPair {
    pub tokens: String,
    pub timestamp: String,
}

/// `(tokens, timestamp)` arguments for the CAS script; empty strings mean "must be absent".
fn cas_expectation(expected: Option<&RawPair>) -> (&str, &str) {
    match expected {
        Some(pair) => (pair.tokens.as_str(), pair.timestamp.as_str()),
        None => ("", ""),
    }
}

/// Decode an `MGET` of both bucket keys.
///
/// No tokens means a fresh bucket. Tokens without a timestamp cannot be refilled safely and
/// are reported as corrupt.
fn decode_bucket(
    key: &str,
    (tokens_key, stamp_key): (&str, &str),
    tokens: Option<String>,
    timestamp: Option<String>,
) -> Result<Option<Versioned<RawPair>>, StoreError> {
    let tokens = match tokens {
        Some(tokens) => tokens,
        None => return Ok(None),
    };
    let timestamp = timestamp.ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        detail: "tokens present without timestamp".to_string(),
    })?;

    let state = BucketState {
        tokens: parse_value(tokens_key, &tokens)?,
        last_refill: parse_value(stamp_key, &timestamp)?,
    };
    Ok(Some(Versioned { state, version: RawPair { tokens, timestamp } }))
}

/// [`VersionedStore`] over Redis with a Lua compare-and-swap.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: Arc<Script>,
    layout: KeyLayout,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("layout", &self.layout)
            .finish()
    }
}

impl RedisStore {
    /// Use an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, cas: Arc::new(Script::new(CAS_SCRIPT)), layout: KeyLayout::Plain }
    }

    /// Wrap keys in a hash tag so the CAS script runs on Redis Cluster.
    pub fn with_hash_tag(mut self) -> Self {
        self.layout = KeyLayout::HashTag;
        self
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    /// Connect using deserialized settings.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        Ok(Self::new(connect(settings).await?))
    }
}

#[async_trait]
impl VersionedStore for RedisStore {
    type Version = RawPair;

    async fn load(&self, key: &str) -> Result<Option<Versioned<RawPair>>, StoreError> {
        let (tokens_key, stamp_key) = self.layout.keys(key);
        let mut conn = self.conn.clone();
        let (tokens, timestamp): (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(&tokens_key)
            .arg(&stamp_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(key, e))?;
        decode_bucket(key, (&tokens_key, &stamp_key), tokens, timestamp)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&RawPair>,
        next: &BucketState,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let (tokens_key, stamp_key) = self.layout.keys(key);
        let (expected_tokens, expected_stamp) = cas_expectation(expected);
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(&tokens_key)
            .key(&stamp_key)
            .arg(expected_tokens)
            .arg(expected_stamp)
            .arg(format_value(next.tokens))
            .arg(format_value(next.last_refill))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(key, e))?;
        Ok(swapped == 1)
    }
}

/// Parsed reply of the admission script.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScriptReply {
    allowed: bool,
    refilled: f64,
    remaining: f64,
}

impl ScriptReply {
    fn parse(key: &str, (allowed, refilled, remaining): (i64, String, String)) -> Result<Self, StoreError> {
        Ok(Self {
            allowed: allowed == 1,
            refilled: parse_value(key, &refilled)?,
            remaining: parse_value(key, &remaining)?,
        })
    }

    fn decision(&self, policy: &Policy) -> Decision {
        if self.allowed {
            Decision::Admitted { remaining: self.remaining }
        } else {
            Decision::Denied { retry_after: retry_after(self.refilled, policy) }
        }
    }
}

fn decision_event(client_id: &str, decision: &Decision) -> LimiterEvent {
    match decision {
        Decision::Admitted { remaining } => {
            LimiterEvent::Admitted { client_id: client_id.to_string(), remaining: *remaining }
        }
        Decision::Denied { retry_after } => {
            LimiterEvent::Denied { client_id: client_id.to_string(), retry_after: *retry_after }
        }
    }
}

/// Run `call` under the retry budget of `config`.
///
/// Each attempt gets its own deadline. Transient errors are retried after the configured
/// backoff; corrupt state returns at once. When every attempt fails the last error is
/// returned.
async fn with_retries<T, F, Fut>(config: &AdapterConfig, client_id: &str, mut call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let deadline = config.deadline();
    let mut last_failure = None;

    for attempt in 0..config.max_attempts() {
        config.pause_before(attempt).await;
        match deadline.execute(call()).await {
            Ok(reply) => return Ok(reply),
            Err(err) if err.is_transient() => {
                tracing::warn!(target: "tollgate::redis", client_id, attempt = attempt + 1, error = %err, "admission script failed");
                last_failure = Some(err);
            }
            Err(err) => {
                tracing::warn!(target: "tollgate::redis", client_id, error = %err, "bucket state unreadable");
                return Err(err);
            }
        }
    }

    Err(last_failure.unwrap_or(StoreError::Contended { attempts: config.max_attempts() }))
}

/// [`RateLimiter`] that runs refill and consumption inside one Redis script.
///
/// `now` comes from the caller's [`Clock`], not Redis `TIME`, so every backend shares one
/// notion of time and tests stay deterministic. Transient failures are retried with the
/// [`AdapterConfig`] budget; a retried call whose first attempt did reach Redis may have
/// consumed a token already.
#[derive(Clone)]
pub struct ScriptedLimiter<T = NullSink> {
    conn: ConnectionManager,
    script: Arc<Script>,
    clock: Arc<dyn Clock>,
    config: AdapterConfig,
    sink: T,
    layout: KeyLayout,
    key_prefix: String,
    ttl_factor: u32,
}

impl<T> std::fmt::Debug for ScriptedLimiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedLimiter")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("key_prefix", &self.key_prefix)
            .field("ttl_factor", &self.ttl_factor)
            .finish()
    }
}

impl ScriptedLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Arc::new(Script::new(ADMIT_SCRIPT)),
            clock: Arc::new(SystemClock),
            config: AdapterConfig::default(),
            sink: NullSink,
            layout: KeyLayout::Plain,
            key_prefix: String::new(),
            ttl_factor: 2,
        }
    }
}

impl<T> ScriptedLimiter<T> {
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Attach a telemetry sink for admission events.
    pub fn with_sink<U>(self, sink: U) -> ScriptedLimiter<U>
    where
        U: TelemetrySink,
    {
        ScriptedLimiter {
            conn: self.conn,
            script: self.script,
            clock: self.clock,
            config: self.config,
            sink,
            layout: self.layout,
            key_prefix: self.key_prefix,
            ttl_factor: self.ttl_factor,
        }
    }

    /// Retry budget and per-call timeout.
    pub fn with_config(mut self, config: AdapterConfig) -> Self {
        self.config = config;
        self
    }

    /// Wrap keys in a hash tag so the script runs on Redis Cluster.
    pub fn with_hash_tag(mut self) -> Self {
        self.layout = KeyLayout::HashTag;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_ttl_factor(mut self, factor: u32) -> Self {
        self.ttl_factor = factor.max(1);
        self
    }

    pub fn sink(&self) -> &T {
        &self.sink
    }

    async fn run_script(
        &self,
        key: &str,
        policy: &Policy,
        now: f64,
        ttl: Duration,
    ) -> Result<ScriptReply, StoreError> {
        let (tokens_key, stamp_key) = self.layout.keys(key);
        let mut conn = self.conn.clone();
        let raw: (i64, String, String) = self
            .script
            .key(&tokens_key)
            .key(&stamp_key)
            .arg(policy.capacity)
            .arg(format_value(policy.rate))
            .arg(format_value(now))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(key, e))?;
        ScriptReply::parse(key, raw)
    }
}

#[async_trait]
impl<T> RateLimiter for ScriptedLimiter<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn evaluate(&self, client_id: &str, policy: &Policy) -> Result<Decision, LimiterError> {
        policy.validate()?;
        if client_id.is_empty() {
            return Err(LimiterError::InvalidClientId);
        }

        let now = self.clock.now_secs();
        let key = format!("{}{}", self.key_prefix, client_id);
        let ttl = policy.idle_ttl(self.ttl_factor);

        let reply = match with_retries(&self.config, client_id, || self.run_script(&key, policy, now, ttl)).await {
            Ok(reply) => reply,
            Err(err) => {
                let event = LimiterEvent::StoreFailure {
                    client_id: client_id.to_string(),
                    error: err.to_string(),
                };
                emit_best_effort(self.sink.clone(), event).await;
                return Err(err.into());
            }
        };

        let decision = reply.decision(policy);
        match &decision {
            Decision::Admitted { remaining } => {
                tracing::debug!(target: "tollgate::redis", client_id, remaining, "admitted");
            }
            Decision::Denied { retry_after } => {
                tracing::debug!(target: "tollgate::redis", client_id, tokens = reply.refilled, ?retry_after, "denied");
            }
        }
        emit_best_effort(self.sink.clone(), decision_event(client_id, &decision)).await;
        Ok(decision)
    }
}

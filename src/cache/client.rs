//! Read-through cache for one scope.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::error::CacheError;
use crate::cache::record::{CacheRecord, Slot};
use crate::cache::schema::SchemaDefaults;
use crate::config::CacheConfig;
use crate::hub::BroadcastHub;
use crate::model::{ChangeEvent, ChangeKind, ConfigEntry, ConfigValue, Scope, Version};
use crate::observability::metrics;
use crate::storage::{GatewayError, StorageGateway};

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Fresh cached entry.
    Cache,
    /// Fetched through the gateway on a miss or expiry.
    Store,
    /// Last known value served during an outage.
    Stale,
    SchemaDefault,
    ClientDefault,
}

impl ValueSource {
    fn as_str(&self) -> &'static str {
        match self {
            ValueSource::Cache => "cache",
            ValueSource::Store => "store",
            ValueSource::Stale => "stale",
            ValueSource::SchemaDefault => "schema_default",
            ValueSource::ClientDefault => "client_default",
        }
    }
}

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: ConfigValue,
    pub source: ValueSource,
    /// Present when the value is a stored entry.
    pub version: Option<Version>,
}

impl Resolved {
    pub fn is_stale(&self) -> bool {
        self.source == ValueSource::Stale
    }
}

#[derive(Debug)]
struct LinkState {
    /// Set while the push channel is not connected and reconciled.
    push_down_since: Option<Instant>,
    last_gateway_ok: Option<Instant>,
}

pub(crate) struct CacheInner {
    pub(crate) scope: Scope,
    pub(crate) gateway: Arc<StorageGateway>,
    pub(crate) hub: BroadcastHub,
    schema: Option<Arc<dyn SchemaDefaults>>,
    pub(crate) config: CacheConfig,
    records: DashMap<String, Slot>,
    link: Mutex<LinkState>,
}

/// Read-through cache of one scope, kept current by hub pushes.
///
/// Cloning is cheap; clones share records.
#[derive(Clone)]
pub struct ClientCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCache")
            .field("scope", &self.inner.scope)
            .field("records", &self.inner.records.len())
            .finish()
    }
}

impl ClientCache {
    pub fn new(
        scope: Scope,
        gateway: Arc<StorageGateway>,
        hub: BroadcastHub,
        schema: Option<Arc<dyn SchemaDefaults>>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                scope,
                gateway,
                hub,
                schema,
                config,
                records: DashMap::new(),
                link: Mutex::new(LinkState {
                    push_down_since: Some(Instant::now()),
                    last_gateway_ok: None,
                }),
            }),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// True once the push channel is connected and reconciled.
    pub fn is_push_connected(&self) -> bool {
        self.link().push_down_since.is_none()
    }

    /// Resolve `key`: fresh cache entry, then the store, then the schema
    /// default, then `client_default`.
    pub async fn resolve(&self, key: &str, client_default: Option<ConfigValue>) -> Result<Resolved, CacheError> {
        let config_key = self.inner.scope.key(key)?;
        let now = Instant::now();

        let cached = self.inner.records.get(key).map(|slot| slot.clone());
        let mut stale_candidate = None;
        let mut store_unreachable = false;

        match cached {
            Some(Slot::Live(record)) if self.is_trusted(&record, now) => {
                return Ok(self.found(record.entry, ValueSource::Cache));
            }
            Some(Slot::Live(record)) => stale_candidate = Some(record),
            Some(Slot::Tombstone { valid_until, .. }) if now < valid_until => {
                return self.fall_back(key, client_default, false);
            }
            _ => {}
        }

        match self.inner.gateway.get(&config_key).await {
            Ok(entry) => {
                self.gateway_ok();
                self.store(entry.clone(), Instant::now());
                return Ok(self.found(entry, ValueSource::Store));
            }
            Err(GatewayError::NotFound(_)) => {
                self.gateway_ok();
                self.inner
                    .records
                    .remove_if(key, |_, slot| matches!(slot, Slot::Live(_)));
            }
            Err(GatewayError::Unavailable { .. }) => store_unreachable = true,
            Err(other) => return Err(other.into()),
        }

        if store_unreachable {
            if let Some(record) = stale_candidate {
                if let Some(age) = self.outage_age(Instant::now()) {
                    if age > self.inner.config.max_stale() {
                        tracing::warn!(
                            scope = %self.inner.scope,
                            key,
                            age_ms = age.as_millis() as u64,
                            "Refusing to serve value beyond staleness bound"
                        );
                        return Err(CacheError::StaleBeyondBound { age });
                    }
                }
                return Ok(self.found(record.entry, ValueSource::Stale));
            }
        }

        self.fall_back(key, client_default, store_unreachable)
    }

    /// Value only; see [`ClientCache::resolve`].
    pub async fn get(&self, key: &str, client_default: Option<ConfigValue>) -> Result<ConfigValue, CacheError> {
        Ok(self.resolve(key, client_default).await?.value)
    }

    /// Every known entry, key-sorted, each flagged stale or fresh.
    pub fn get_all(&self) -> Vec<CacheRecord> {
        let now = Instant::now();
        let mut records: Vec<_> = self
            .inner
            .records
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Live(record) => {
                    let mut record = record.clone().annotated(now);
                    record.stale |= !self.is_trusted(&record, now);
                    Some(record)
                }
                Slot::Tombstone { .. } => None,
            })
            .collect();
        records.sort_by(|a, b| a.entry.key.cmp(&b.entry.key));
        records
    }

    /// Integer lookup with optional bounds. Numeric strings are accepted.
    /// With a default, unusable values fall back to it.
    pub async fn get_i64(
        &self,
        key: &str,
        default: Option<i64>,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Result<i64, CacheError> {
        let value = self.get(key, default.map(ConfigValue::from)).await?;
        let parsed = match &value {
            ConfigValue::String(s) => s.trim().parse::<i64>().ok(),
            other => other.as_i64(),
        };
        let checked = match parsed {
            None => Err(CacheError::TypeMismatch {
                key: key.to_string(),
                expected: "an integer",
            }),
            Some(n) if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) => Err(CacheError::OutOfRange {
                key: key.to_string(),
                value: n,
                min,
                max,
            }),
            Some(n) => Ok(n),
        };
        match (checked, default) {
            (Err(e), Some(fallback)) => {
                tracing::error!(scope = %self.inner.scope, key, error = %e, "Invalid integer value, using default");
                Ok(fallback)
            }
            (result, _) => result,
        }
    }

    /// Boolean lookup. Strings "true", "1", "yes" and "on" (any case) are
    /// true, other strings false; numbers are true when non-zero.
    pub async fn get_bool(&self, key: &str, default: Option<bool>) -> Result<bool, CacheError> {
        let value = self.get(key, default.map(ConfigValue::from)).await?;
        Ok(match value {
            ConfigValue::Null => false,
            ConfigValue::Bool(b) => b,
            ConfigValue::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            ConfigValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            ConfigValue::Array(items) => !items.is_empty(),
            ConfigValue::Object(fields) => !fields.is_empty(),
        })
    }

    /// Apply a pushed change; older versions are ignored.
    pub fn apply_event(&self, event: &ChangeEvent) {
        if event.scope != self.inner.scope {
            return;
        }
        let now = Instant::now();
        match (event.kind, &event.entry) {
            (ChangeKind::Put, Some(entry)) => {
                self.store(entry.clone(), now);
            }
            _ => {
                self.tombstone(&event.key, event.version, now);
            }
        }
    }

    /// Re-read the whole scope: refresh every entry and tombstone keys that
    /// are gone as of the snapshot revision.
    pub async fn reconcile(&self) -> Result<usize, CacheError> {
        let snapshot = self.inner.gateway.snapshot(&self.inner.scope).await?;
        self.gateway_ok();
        let now = Instant::now();

        let present: HashSet<&str> = snapshot.entries.iter().map(|e| e.key.as_str()).collect();
        let missing: Vec<String> = self
            .inner
            .records
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Live(_)) && !present.contains(slot.key().as_str()))
            .map(|slot| slot.key().clone())
            .collect();
        for key in &missing {
            self.tombstone(key, snapshot.revision, now);
        }
        let count = snapshot.entries.len();
        for entry in snapshot.entries {
            self.store(entry, now);
        }
        tracing::debug!(
            scope = %self.inner.scope,
            entries = count,
            removed = missing.len(),
            revision = %snapshot.revision,
            "Cache reconciled"
        );
        Ok(count)
    }

    fn found(&self, entry: ConfigEntry, source: ValueSource) -> Resolved {
        metrics::record_cache_lookup(source.as_str());
        Resolved {
            version: Some(entry.version),
            value: entry.value,
            source,
        }
    }

    fn fall_back(&self, key: &str, client_default: Option<ConfigValue>, store_unreachable: bool) -> Result<Resolved, CacheError> {
        let schema_default = self
            .inner
            .schema
            .as_ref()
            .and_then(|schema| schema.default_value(&self.inner.scope, key));
        let (value, source) = match (schema_default, client_default) {
            (Some(value), _) => (value, ValueSource::SchemaDefault),
            (None, Some(value)) => (value, ValueSource::ClientDefault),
            (None, None) if store_unreachable => return Err(CacheError::Unavailable),
            (None, None) => {
                metrics::record_cache_lookup("not_found");
                return Err(CacheError::NotFound(format!("{}:{}", self.inner.scope, key)));
            }
        };
        metrics::record_cache_lookup(source.as_str());
        Ok(Resolved {
            value,
            source,
            version: None,
        })
    }

    fn store(&self, entry: ConfigEntry, now: Instant) {
        let key = entry.key.clone();
        self.merge_key(key, Slot::Live(CacheRecord::new(entry, now, self.inner.config.ttl())));
    }

    fn tombstone(&self, key: &str, version: Version, now: Instant) {
        let incoming = Slot::Tombstone {
            version,
            valid_until: now + self.inner.config.ttl(),
        };
        self.merge_key(key.to_string(), incoming);
    }

    fn merge_key(&self, key: String, incoming: Slot) {
        // Entry lock makes the version check and replacement one step per key.
        match self.inner.records.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                slot.get_mut().merge(incoming);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(incoming);
            }
        }
    }

    fn link(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.inner.link.lock().expect("cache link mutex poisoned")
    }

    fn gateway_ok(&self) {
        self.link().last_gateway_ok = Some(Instant::now());
    }

    pub(crate) fn push_connected(&self) {
        self.link().push_down_since = None;
    }

    pub(crate) fn push_lost(&self) {
        let mut link = self.link();
        if link.push_down_since.is_none() {
            link.push_down_since = Some(Instant::now());
        }
    }

    /// Whether `record` may be served without asking the store. While push
    /// is down only records fetched after it went down qualify, and only
    /// while the store answered within the staleness bound.
    fn is_trusted(&self, record: &CacheRecord, now: Instant) -> bool {
        if !record.is_fresh(now) {
            return false;
        }
        let link = self.link();
        match link.push_down_since {
            None => true,
            Some(down) => {
                record.fetched_at >= down
                    && link
                        .last_gateway_ok
                        .is_some_and(|ok| now.saturating_duration_since(ok) <= self.inner.config.max_stale())
            }
        }
    }

    /// Time since the last confirmation from either channel, while the push
    /// channel is down. `None` while it is up.
    fn outage_age(&self, now: Instant) -> Option<Duration> {
        let link = self.link();
        let push_down = link.push_down_since?;
        let since = match link.last_gateway_ok {
            Some(ok) if ok > push_down => ok,
            _ => push_down,
        };
        Some(now.saturating_duration_since(since))
    }
}

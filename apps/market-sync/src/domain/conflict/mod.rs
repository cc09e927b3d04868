//! Conflict Resolution
//!
//! Reconciles a locally-queued value against the authoritative server
//! value once both have diverged.
//!
//! Resolution first diffs the two values field by field. Without
//! differing fields the server value wins, extended with any fields only
//! the client has. With differing fields the caller-chosen strategy
//! decides:
//!
//! | Strategy          | Result                                              |
//! |-------------------|-----------------------------------------------------|
//! | `client_wins`     | local value                                         |
//! | `server_wins`     | server value                                        |
//! | `last_write_wins` | the value with the later timestamp (server on ties) |
//! | `merge`           | field union plus per-field rules for conflicts      |
//! | `manual`          | a marker carrying both values for a human decision  |

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field name used for a conflict between two non-object values.
pub const ROOT_FIELD: &str = "$";

// =============================================================================
// Strategy
// =============================================================================

/// How to resolve conflicting fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the local value.
    ClientWins,
    /// Keep the server value.
    #[default]
    ServerWins,
    /// Keep whichever value was written last.
    LastWriteWins,
    /// Union fields and apply per-field rules to conflicts.
    Merge,
    /// Hand both values to a human.
    Manual,
}

impl ResolutionStrategy {
    /// Get the strategy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::LastWriteWins => "last_write_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "client_wins" => Ok(Self::ClientWins),
            "server_wins" => Ok(Self::ServerWins),
            "last_write_wins" => Ok(Self::LastWriteWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            _ => Err(ConflictError::UnknownStrategy(s.to_string())),
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    /// Strategy name not recognised.
    #[error("unknown conflict resolution strategy: {0}")]
    UnknownStrategy(String),

    /// A policy entry is not of the form `type:strategy`.
    #[error("invalid conflict policy entry: {0}")]
    InvalidPolicy(String),
}

// =============================================================================
// Descriptor
// =============================================================================

/// The result of diffing a local value against a server value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDescriptor<'a> {
    /// Locally queued value.
    pub local_value: &'a Value,
    /// Authoritative server value.
    pub server_value: &'a Value,
    /// Fields present on both sides with different values.
    pub conflicting_fields: BTreeSet<String>,
}

impl<'a> ConflictDescriptor<'a> {
    /// Diff two values field by field.
    ///
    /// Fields present on only one side are not conflicts.
    #[must_use]
    pub fn diff(local_value: &'a Value, server_value: &'a Value) -> Self {
        let conflicting_fields = match (local_value, server_value) {
            (Value::Object(local), Value::Object(server)) => local
                .iter()
                .filter(|(key, value)| server.get(*key).is_some_and(|s| s != *value))
                .map(|(key, _)| key.clone())
                .collect(),
            (local, server) if local != server => BTreeSet::from([ROOT_FIELD.to_string()]),
            _ => BTreeSet::new(),
        };

        Self {
            local_value,
            server_value,
            conflicting_fields,
        }
    }

    /// Whether any field differs.
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicting_fields.is_empty()
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Marker returned by the `manual` strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualResolution {
    /// Always `true`; lets consumers recognise the marker in raw JSON.
    pub requires_manual_resolution: bool,
    /// Locally queued value.
    pub local_value: Value,
    /// Authoritative server value.
    pub server_value: Value,
    /// Fields that differ.
    pub conflicting_fields: Vec<String>,
}

/// Outcome of a resolution call.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A value to adopt.
    Resolved(Value),
    /// A human has to decide; no further automatic action is taken.
    Manual(ManualResolution),
}

impl Resolution {
    /// The resolved value, if no human decision is needed.
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Manual(_) => None,
        }
    }

    /// Convert into a JSON value; manual outcomes become the marker object.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Resolved(value) => value,
            Self::Manual(marker) => serde_json::to_value(marker).unwrap_or(Value::Null),
        }
    }
}

// =============================================================================
// Merge Rules
// =============================================================================

/// Field rules used by the `merge` and `last_write_wins` strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRules {
    /// Numeric fields resolved by taking the maximum (volume-like fields).
    pub max_fields: HashSet<String>,
    /// Keys holding a record's write time, checked in order.
    pub timestamp_keys: Vec<String>,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            max_fields: ["volume", "count", "high"]
                .into_iter()
                .map(String::from)
                .collect(),
            timestamp_keys: ["timestamp", "updatedAt", "updated_at", "time"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl MergeRules {
    /// Write time of a record in milliseconds, if it carries one.
    fn timestamp_of(&self, value: &Value) -> Option<i64> {
        let object = value.as_object()?;
        self.timestamp_keys
            .iter()
            .find_map(|key| object.get(key))
            .and_then(parse_timestamp)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| s.parse().ok()),
        _ => None,
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Option<Ordering> {
    let exact = |n: &serde_json::Number| {
        let text = n.to_string();
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .ok()
    };
    match (exact(a), exact(b)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Stateless conflict resolver.
///
/// # Example
///
/// ```rust
/// use market_sync::domain::conflict::{ConflictResolver, Resolution, ResolutionStrategy};
/// use serde_json::json;
///
/// let resolver = ConflictResolver::default();
/// let local = json!({"price": 10, "volume": 500});
/// let server = json!({"price": 12, "volume": 300, "open": 9});
///
/// let resolved = resolver.resolve(&local, &server, ResolutionStrategy::Merge);
/// assert_eq!(
///     resolved,
///     Resolution::Resolved(json!({"price": 12, "volume": 500, "open": 9}))
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    rules: MergeRules,
}

impl ConflictResolver {
    /// Create a resolver with custom merge rules.
    #[must_use]
    pub const fn new(rules: MergeRules) -> Self {
        Self { rules }
    }

    /// Get the merge rules.
    #[must_use]
    pub const fn rules(&self) -> &MergeRules {
        &self.rules
    }

    /// Resolve with a strategy given by name.
    ///
    /// # Errors
    ///
    /// Returns `ConflictError::UnknownStrategy` if the name is not recognised.
    pub fn resolve_named(
        &self,
        local: &Value,
        server: &Value,
        strategy: &str,
    ) -> Result<Resolution, ConflictError> {
        Ok(self.resolve(local, server, strategy.parse()?))
    }

    /// Resolve a local value against the server value.
    #[must_use]
    pub fn resolve(
        &self,
        local: &Value,
        server: &Value,
        strategy: ResolutionStrategy,
    ) -> Resolution {
        let descriptor = ConflictDescriptor::diff(local, server);

        if !descriptor.has_conflicts() {
            return Resolution::Resolved(with_client_only_fields(server, local));
        }

        tracing::debug!(
            strategy = %strategy,
            fields = ?descriptor.conflicting_fields,
            "Resolving conflict"
        );

        match strategy {
            ResolutionStrategy::ClientWins => Resolution::Resolved(local.clone()),
            ResolutionStrategy::ServerWins => Resolution::Resolved(server.clone()),
            ResolutionStrategy::LastWriteWins => {
                Resolution::Resolved(self.later_of(local, server).clone())
            }
            ResolutionStrategy::Merge => Resolution::Resolved(self.merge(local, server)),
            ResolutionStrategy::Manual => Resolution::Manual(ManualResolution {
                requires_manual_resolution: true,
                local_value: local.clone(),
                server_value: server.clone(),
                conflicting_fields: descriptor.conflicting_fields.into_iter().collect(),
            }),
        }
    }

    /// The value with the later write time; the server value on ties or
    /// when either side lacks a timestamp.
    fn later_of<'v>(&self, local: &'v Value, server: &'v Value) -> &'v Value {
        if self.local_is_later(local, server) {
            local
        } else {
            server
        }
    }

    fn local_is_later(&self, local: &Value, server: &Value) -> bool {
        matches!(
            (self.rules.timestamp_of(local), self.rules.timestamp_of(server)),
            (Some(l), Some(s)) if l > s
        )
    }

    /// Field union of both sides with conflicting fields resolved by rule.
    fn merge(&self, local: &Value, server: &Value) -> Value {
        let local_is_later = self.local_is_later(local, server);
        let (Value::Object(local_map), Value::Object(server_map)) = (local, server) else {
            return self.merge_conflict(ROOT_FIELD, local, server, local_is_later);
        };

        let mut merged = server_map.clone();
        for (field, local_value) in local_map {
            match server_map.get(field) {
                None => {
                    merged.insert(field.clone(), local_value.clone());
                }
                Some(server_value) if server_value != local_value => {
                    let value =
                        self.merge_conflict(field, local_value, server_value, local_is_later);
                    merged.insert(field.clone(), value);
                }
                Some(_) => {}
            }
        }
        Value::Object(merged)
    }

    /// Type-specific rule for one conflicting field.
    fn merge_conflict(
        &self,
        field: &str,
        local: &Value,
        server: &Value,
        local_is_later: bool,
    ) -> Value {
        if local.is_object() && server.is_object() {
            return self.merge(local, server);
        }
        if let Some(series) = self.union_series(local, server) {
            return series;
        }
        if self.rules.max_fields.contains(field)
            && let (Value::Number(l), Value::Number(s)) = (local, server)
        {
            return if compare_numbers(l, s) == Some(Ordering::Greater) {
                local.clone()
            } else {
                server.clone()
            };
        }

        // Remaining conflicts follow the records' write times
        if local_is_later {
            local.clone()
        } else {
            server.clone()
        }
    }

    /// Union two time series keyed by timestamp; client entries override
    /// server entries on the same timestamp.
    ///
    /// Returns `None` unless both values are arrays of timestamped records.
    fn union_series(&self, local: &Value, server: &Value) -> Option<Value> {
        let (Value::Array(local), Value::Array(server)) = (local, server) else {
            return None;
        };

        let mut by_time = BTreeMap::new();
        for entry in server.iter().chain(local) {
            let at = self.rules.timestamp_of(entry)?;
            by_time.insert(at, entry.clone());
        }
        Some(Value::Array(by_time.into_values().collect()))
    }
}

/// `server` extended with fields only `local` has.
fn with_client_only_fields(server: &Value, local: &Value) -> Value {
    match (server, local) {
        (Value::Object(server_map), Value::Object(local_map)) => {
            let mut merged = server_map.clone();
            for (key, value) in local_map {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
            Value::Object(merged)
        }
        _ => server.clone(),
    }
}

// =============================================================================
// Strategy Policy
// =============================================================================

/// Strategy selection per mutation type.
///
/// Parsed from `type:strategy` pairs, e.g.
/// `"price:server_wins,annotation:merge"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictPolicy {
    default: ResolutionStrategy,
    per_type: HashMap<String, ResolutionStrategy>,
}

impl ConflictPolicy {
    /// Create a policy with a default strategy and no overrides.
    #[must_use]
    pub fn new(default: ResolutionStrategy) -> Self {
        Self {
            default,
            per_type: HashMap::new(),
        }
    }

    /// Add an override for one mutation type.
    #[must_use]
    pub fn with(mut self, mutation_type: impl Into<String>, strategy: ResolutionStrategy) -> Self {
        self.per_type.insert(mutation_type.into(), strategy);
        self
    }

    /// Parse comma-separated `type:strategy` pairs.
    ///
    /// # Errors
    ///
    /// Returns an error for a pair without `:` or an unknown strategy name.
    pub fn parse(default: ResolutionStrategy, pairs: &str) -> Result<Self, ConflictError> {
        let mut policy = Self::new(default);
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (mutation_type, strategy) = pair
                .split_once(':')
                .ok_or_else(|| ConflictError::InvalidPolicy(pair.to_string()))?;
            policy
                .per_type
                .insert(mutation_type.trim().to_string(), strategy.parse()?);
        }
        Ok(policy)
    }

    /// Strategy for a mutation type.
    #[must_use]
    pub fn for_type(&self, mutation_type: &str) -> ResolutionStrategy {
        self.per_type
            .get(mutation_type)
            .copied()
            .unwrap_or(self.default)
    }

    /// The fallback strategy.
    #[must_use]
    pub const fn default_strategy(&self) -> ResolutionStrategy {
        self.default
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    const ALL: [ResolutionStrategy; 5] = [
        ResolutionStrategy::ClientWins,
        ResolutionStrategy::ServerWins,
        ResolutionStrategy::LastWriteWins,
        ResolutionStrategy::Merge,
        ResolutionStrategy::Manual,
    ];

    fn resolved(resolution: Resolution) -> Value {
        resolution.value().cloned().expect("expected resolved value")
    }

    #[test_case("client_wins", ResolutionStrategy::ClientWins)]
    #[test_case("server_wins", ResolutionStrategy::ServerWins)]
    #[test_case("last_write_wins", ResolutionStrategy::LastWriteWins)]
    #[test_case("merge", ResolutionStrategy::Merge)]
    #[test_case("MANUAL", ResolutionStrategy::Manual)]
    fn parse_strategy(name: &str, expected: ResolutionStrategy) {
        assert_eq!(name.parse::<ResolutionStrategy>().unwrap(), expected);
    }

    #[test]
    fn unknown_strategy_rejected() {
        let resolver = ConflictResolver::default();
        let err = resolver
            .resolve_named(&json!(1), &json!(2), "coin_flip")
            .unwrap_err();
        assert_eq!(err, ConflictError::UnknownStrategy("coin_flip".into()));
    }

    #[test]
    fn diff_ignores_one_sided_fields() {
        let local = json!({"a": 1, "b": 2, "only_local": true});
        let server = json!({"a": 1, "b": 3, "only_server": true});
        let descriptor = ConflictDescriptor::diff(&local, &server);
        assert_eq!(descriptor.conflicting_fields, BTreeSet::from(["b".into()]));
    }

    #[test]
    fn diff_scalars_uses_root_field() {
        let (local, server) = (json!(1), json!(2));
        let descriptor = ConflictDescriptor::diff(&local, &server);
        assert_eq!(
            descriptor.conflicting_fields,
            BTreeSet::from([ROOT_FIELD.to_string()])
        );
    }

    #[test]
    fn no_conflict_keeps_client_only_fields() {
        let resolver = ConflictResolver::default();
        let local = json!({"symbol": "AAPL", "note": "watch earnings"});
        let server = json!({"symbol": "AAPL", "alerts": 2});

        for strategy in ALL {
            let value = resolved(resolver.resolve(&local, &server, strategy));
            assert_eq!(
                value,
                json!({"symbol": "AAPL", "alerts": 2, "note": "watch earnings"})
            );
        }
    }

    #[test]
    fn client_and_server_wins() {
        let resolver = ConflictResolver::default();
        let local = json!({"price": 10});
        let server = json!({"price": 12});

        assert_eq!(
            resolved(resolver.resolve(&local, &server, ResolutionStrategy::ClientWins)),
            local
        );
        assert_eq!(
            resolved(resolver.resolve(&local, &server, ResolutionStrategy::ServerWins)),
            server
        );
    }

    #[test]
    fn last_write_wins_compares_timestamps() {
        let resolver = ConflictResolver::default();
        let local = json!({"price": 10, "timestamp": 2_000});
        let server = json!({"price": 12, "timestamp": 1_000});
        assert_eq!(
            resolved(resolver.resolve(&local, &server, ResolutionStrategy::LastWriteWins)),
            local
        );

        let local = json!({"price": 10, "updatedAt": "2024-01-01T00:00:00Z"});
        let server = json!({"price": 12, "updatedAt": "2024-06-01T00:00:00Z"});
        assert_eq!(
            resolved(resolver.resolve(&local, &server, ResolutionStrategy::LastWriteWins)),
            server
        );
    }

    #[test]
    fn last_write_wins_without_timestamps_prefers_server() {
        let resolver = ConflictResolver::default();
        let local = json!({"price": 10});
        let server = json!({"price": 12});
        assert_eq!(
            resolved(resolver.resolve(&local, &server, ResolutionStrategy::LastWriteWins)),
            server
        );
    }

    #[test]
    fn merge_price_volume_open() {
        let resolver = ConflictResolver::default();
        let local = json!({"price": 10, "volume": 500});
        let server = json!({"price": 12, "volume": 300, "open": 9});

        let value = resolved(resolver.resolve(&local, &server, ResolutionStrategy::Merge));
        assert_eq!(value, json!({"price": 12, "volume": 500, "open": 9}));
    }

    #[test]
    fn merge_max_rule_with_decimals() {
        let resolver = ConflictResolver::default();
        let local = json!({"volume": 100.25});
        let server = json!({"volume": 100.5});
        let value = resolved(resolver.resolve(&local, &server, ResolutionStrategy::Merge));
        assert_eq!(value, json!({"volume": 100.5}));
    }

    #[test]
    fn merge_unions_time_series() {
        let resolver = ConflictResolver::default();
        let local = json!({"bars": [
            {"timestamp": 2, "close": 20},
            {"timestamp": 3, "close": 30},
        ]});
        let server = json!({"bars": [
            {"timestamp": 1, "close": 10},
            {"timestamp": 2, "close": 19},
        ]});

        let value = resolved(resolver.resolve(&local, &server, ResolutionStrategy::Merge));
        assert_eq!(
            value,
            json!({"bars": [
                {"timestamp": 1, "close": 10},
                {"timestamp": 2, "close": 20},
                {"timestamp": 3, "close": 30},
            ]})
        );
    }

    #[test]
    fn merge_recurses_into_objects() {
        let resolver = ConflictResolver::default();
        let local = json!({"stats": {"volume": 900, "note": "mine"}});
        let server = json!({"stats": {"volume": 100, "vwap": 1.5}});

        let value = resolved(resolver.resolve(&local, &server, ResolutionStrategy::Merge));
        assert_eq!(
            value,
            json!({"stats": {"volume": 900, "vwap": 1.5, "note": "mine"}})
        );
    }

    #[test]
    fn merge_uses_record_time_for_other_fields() {
        let resolver = ConflictResolver::default();
        let local = json!({"sentiment": "bullish", "timestamp": 20});
        let server = json!({"sentiment": "bearish", "timestamp": 10});

        let value = resolved(resolver.resolve(&local, &server, ResolutionStrategy::Merge));
        assert_eq!(value, local);
    }

    #[test]
    fn manual_returns_marker() {
        let resolver = ConflictResolver::default();
        let local = json!({"price": 10, "volume": 1});
        let server = json!({"price": 12, "volume": 1});

        let Resolution::Manual(marker) =
            resolver.resolve(&local, &server, ResolutionStrategy::Manual)
        else {
            panic!("expected manual marker");
        };
        assert!(marker.requires_manual_resolution);
        assert_eq!(marker.conflicting_fields, vec!["price".to_string()]);
        assert_eq!(marker.local_value, local);
        assert_eq!(marker.server_value, server);

        let raw = Resolution::Manual(marker).into_value();
        assert_eq!(raw["requiresManualResolution"], true);
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ]
    }

    fn json_value() -> impl Strategy<Value = Value> {
        json_leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn identical_values_resolve_to_server(value in json_value()) {
            let resolver = ConflictResolver::default();
            for strategy in ALL {
                let out = resolver.resolve(&value, &value.clone(), strategy);
                prop_assert_eq!(out, Resolution::Resolved(value.clone()));
            }
        }
    }

    #[test]
    fn policy_selects_per_type_strategy() {
        let policy = ConflictPolicy::parse(
            ResolutionStrategy::ServerWins,
            "annotation:merge, watchlist : client_wins,",
        )
        .unwrap();

        assert_eq!(policy.for_type("annotation"), ResolutionStrategy::Merge);
        assert_eq!(policy.for_type("watchlist"), ResolutionStrategy::ClientWins);
        assert_eq!(policy.for_type("price"), ResolutionStrategy::ServerWins);
        assert_eq!(policy.default_strategy(), ResolutionStrategy::ServerWins);
    }

    #[test]
    fn policy_rejects_bad_entries() {
        assert_eq!(
            ConflictPolicy::parse(ResolutionStrategy::Merge, "annotation"),
            Err(ConflictError::InvalidPolicy("annotation".to_string()))
        );
        assert!(matches!(
            ConflictPolicy::parse(ResolutionStrategy::Merge, "annotation:coinflip"),
            Err(ConflictError::UnknownStrategy(_))
        ));
    }
}

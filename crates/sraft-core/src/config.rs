//! # config
//!
//! why: load and validate zone topology and timing once, at startup
//! relations: consumed by sraft-chain to build chains, replicators and timers
//! what: Config, ZoneConfig, ConfigError, JSON parsing with duplicate-zone detection

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_ORDER_TIMEOUT_MS: u64 = 5_000;

/// Reasons a configuration document is refused
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("configuration declares no zones")]
    NoZones,

    #[error("zone {zone} has an empty node list")]
    EmptyZone { zone: String },

    #[error("zone id {zone} is declared more than once")]
    DuplicateZone { zone: String },

    #[error("node {node} is listed twice in zone {zone}")]
    DuplicateNode { zone: String, node: String },

    #[error("election timeout ({election_ms}ms) must exceed heartbeat interval ({heartbeat_ms}ms)")]
    TimingOrder { election_ms: u64, heartbeat_ms: u64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be a whole number of milliseconds that fits in u64")]
    NotWholeMillis { field: &'static str },

    #[error("zone {zone} is not configured")]
    UnknownZone { zone: String },

    #[error("node {node} is not a member of zone {zone}")]
    NotAMember { zone: String, node: String },
}

/// Static topology of one zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    #[serde(default)]
    pub leader_priority: i64,
    /// Node addresses; the address doubles as the node identifier
    pub nodes: Vec<String>,
}

impl ZoneConfig {
    pub fn new(leader_priority: i64, nodes: Vec<String>) -> Self {
        Self { leader_priority, nodes }
    }
}

/// Whole-cluster timing and topology. Immutable once validated; reconfiguration
/// means building a new `Config` and swapping it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    election_timeout_ms: u64,
    heartbeat_interval_ms: u64,
    max_batch_size: usize,
    rpc_timeout_ms: u64,
    order_timeout_ms: u64,
    zones: BTreeMap<String, ZoneConfig>,
}

/// Document shape before validation; zones keep declaration order and duplicates
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    election_timeout_ms: u64,
    heartbeat_interval_ms: u64,
    max_batch_size: usize,
    #[serde(default = "default_rpc_timeout")]
    rpc_timeout_ms: u64,
    #[serde(default = "default_order_timeout")]
    order_timeout_ms: u64,
    #[serde(deserialize_with = "zone_entries")]
    zones: Vec<(String, ZoneConfig)>,
}

/// Milliseconds in `duration`, refusing values the millisecond fields cannot hold exactly
fn whole_millis(field: &'static str, duration: Duration) -> Result<u64, ConfigError> {
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return Err(ConfigError::NotWholeMillis { field });
    }
    u64::try_from(duration.as_millis()).map_err(|_| ConfigError::NotWholeMillis { field })
}

fn default_rpc_timeout() -> u64 {
    DEFAULT_RPC_TIMEOUT_MS
}

fn default_order_timeout() -> u64 {
    DEFAULT_ORDER_TIMEOUT_MS
}

fn zone_entries<'de, D>(deserializer: D) -> Result<Vec<(String, ZoneConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ZoneEntries;

    impl<'de> Visitor<'de> for ZoneEntries {
        type Value = Vec<(String, ZoneConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of zone id to zone configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, ZoneConfig>()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(ZoneEntries)
}

impl Config {
    /// Build and validate a configuration
    pub fn new(
        election_timeout: Duration,
        heartbeat_interval: Duration,
        max_batch_size: usize,
        zones: impl IntoIterator<Item = (String, ZoneConfig)>,
    ) -> Result<Self, ConfigError> {
        Self::validate(RawConfig {
            election_timeout_ms: whole_millis("electionTimeoutMs", election_timeout)?,
            heartbeat_interval_ms: whole_millis("heartbeatIntervalMs", heartbeat_interval)?,
            max_batch_size,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            order_timeout_ms: DEFAULT_ORDER_TIMEOUT_MS,
            zones: zones.into_iter().collect(),
        })
    }

    /// Parse a JSON configuration document and validate it
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_slice(raw)?;
        Self::validate(raw)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Same configuration with different per-call and order budgets
    pub fn with_timeouts(&self, rpc_timeout: Duration, order_timeout: Duration) -> Result<Self, ConfigError> {
        Self::validate(RawConfig {
            election_timeout_ms: self.election_timeout_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            max_batch_size: self.max_batch_size,
            rpc_timeout_ms: whole_millis("rpcTimeoutMs", rpc_timeout)?,
            order_timeout_ms: whole_millis("orderTimeoutMs", order_timeout)?,
            zones: self.zones.clone().into_iter().collect(),
        })
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero { field: "heartbeatIntervalMs" });
        }
        if raw.election_timeout_ms <= raw.heartbeat_interval_ms {
            return Err(ConfigError::TimingOrder {
                election_ms: raw.election_timeout_ms,
                heartbeat_ms: raw.heartbeat_interval_ms,
            });
        }
        if raw.max_batch_size == 0 {
            return Err(ConfigError::Zero { field: "maxBatchSize" });
        }
        if raw.rpc_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "rpcTimeoutMs" });
        }
        if raw.order_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "orderTimeoutMs" });
        }
        if raw.zones.is_empty() {
            return Err(ConfigError::NoZones);
        }

        let mut zones = BTreeMap::new();
        for (zone_id, zone) in raw.zones {
            if zone.nodes.is_empty() {
                return Err(ConfigError::EmptyZone { zone: zone_id });
            }
            for (i, node) in zone.nodes.iter().enumerate() {
                if zone.nodes[..i].contains(node) {
                    return Err(ConfigError::DuplicateNode {
                        zone: zone_id,
                        node: node.clone(),
                    });
                }
            }
            if zones.contains_key(&zone_id) {
                return Err(ConfigError::DuplicateZone { zone: zone_id });
            }
            zones.insert(zone_id, zone);
        }

        Ok(Self {
            election_timeout_ms: raw.election_timeout_ms,
            heartbeat_interval_ms: raw.heartbeat_interval_ms,
            max_batch_size: raw.max_batch_size,
            rpc_timeout_ms: raw.rpc_timeout_ms,
            order_timeout_ms: raw.order_timeout_ms,
            zones,
        })
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Budget for a single remote call
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Default wait for `Order` when the caller gives none
    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn zones(&self) -> &BTreeMap<String, ZoneConfig> {
        &self.zones
    }

    pub fn zone(&self, zone_id: &str) -> Option<&ZoneConfig> {
        self.zones.get(zone_id)
    }

    /// Zone with the highest leader priority, ties broken by the smaller id
    pub fn root_zone(&self) -> Option<&str> {
        self.zones
            .iter()
            .max_by(|(a_id, a), (b_id, b)| {
                a.leader_priority
                    .cmp(&b.leader_priority)
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "electionTimeoutMs": 150,
        "heartbeatIntervalMs": 50,
        "maxBatchSize": 16,
        "zones": {
            "east": { "leaderPriority": 2, "nodes": ["a:7050", "b:7050", "c:7050"] },
            "west": { "leaderPriority": 1, "nodes": ["d:7050"] }
        }
    }"#;

    #[test]
    fn parses_valid_document_with_defaults() {
        let config = Config::from_json(VALID.as_bytes()).unwrap();
        assert_eq!(config.election_timeout(), Duration::from_millis(150));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(50));
        assert_eq!(config.max_batch_size(), 16);
        assert_eq!(config.rpc_timeout(), Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS));
        assert_eq!(config.order_timeout(), Duration::from_millis(DEFAULT_ORDER_TIMEOUT_MS));
        assert_eq!(config.zone("east").unwrap().nodes.len(), 3);
    }

    #[test]
    fn root_zone_prefers_highest_priority() {
        let config = Config::from_json(VALID.as_bytes()).unwrap();
        assert_eq!(config.root_zone(), Some("east"));
    }

    #[test]
    fn duplicate_zone_keys_are_detected() {
        let raw = r#"{
            "electionTimeoutMs": 150, "heartbeatIntervalMs": 50, "maxBatchSize": 1,
            "zones": { "z": { "nodes": ["a"] }, "z": { "nodes": ["b"] } }
        }"#;
        assert!(matches!(
            Config::from_json(raw.as_bytes()),
            Err(ConfigError::DuplicateZone { zone }) if zone == "z"
        ));
    }

    #[test]
    fn sub_millisecond_durations_are_refused() {
        let zone = || [("z".to_string(), ZoneConfig::new(0, vec!["a".to_string()]))];

        let err = Config::new(
            Duration::from_micros(150_500),
            Duration::from_millis(50),
            1,
            zone(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotWholeMillis { field: "electionTimeoutMs" }));

        let config = Config::new(Duration::from_millis(150), Duration::from_millis(50), 1, zone()).unwrap();
        let err = config
            .with_timeouts(Duration::from_millis(100), Duration::MAX)
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotWholeMillis { field: "orderTimeoutMs" }));

        let config = config
            .with_timeouts(Duration::from_millis(80), Duration::from_secs(2))
            .unwrap();
        assert_eq!(config.rpc_timeout(), Duration::from_millis(80));
    }
}

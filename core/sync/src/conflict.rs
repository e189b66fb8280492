//! Conflict detection and resolution between a local and a server record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use jobsync_common::{record_id, record_timestamp, EntityType, Error, Record};

/// Fields owned by the server or by external integrations; `Merge` never
/// takes them from the local side.
pub const SERVER_COMPUTED_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "deleted_at",
    "stripe_payment_link",
    "stripe_payment_intent_id",
    "stripe_checkout_session_id",
    "xero_invoice_id",
    "xero_contact_id",
];

/// Fields ignored when deciding whether two versions conflict.
pub const DEFAULT_IGNORE_FIELDS: &[&str] = &["updated_at", "deleted_at"];

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Always keep the server version.
    ServerWins,
    /// Always keep the local version.
    ClientWins,
    /// Keep whichever side has the later `updated_at`; ties favor local.
    #[default]
    LastWriteWins,
    /// Overlay local user-editable fields onto the server version.
    Merge,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 4] = [
        ConflictStrategy::ServerWins,
        ConflictStrategy::ClientWins,
        ConflictStrategy::LastWriteWins,
        ConflictStrategy::Merge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown conflict strategy: {}", s)))
    }
}

/// Outcome of resolving one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub resolved: Record,
    /// Whether the two inputs actually diverged.
    pub had_conflict: bool,
    pub strategy: ConflictStrategy,
    /// Human-readable explanation of the choice.
    pub message: String,
}

fn field_value<'a>(record: &'a Record, field: &str) -> &'a Value {
    record.get(field).unwrap_or(&Value::Null)
}

/// Names of the fields that differ between `local` and `server`, sorted.
///
/// A missing field compares equal to `null`. `id` and `ignore` are skipped.
pub fn conflicting_fields(local: &Record, server: &Record, ignore: &[&str]) -> Vec<String> {
    let keys: BTreeSet<&String> = local.keys().chain(server.keys()).collect();
    keys.into_iter()
        .filter(|k| k.as_str() != "id" && !ignore.contains(&k.as_str()))
        .filter(|k| field_value(local, k) != field_value(server, k))
        .cloned()
        .collect()
}

/// True iff any field outside `ignore` differs between the two versions.
pub fn has_conflict(local: &Record, server: &Record, ignore: &[&str]) -> bool {
    !conflicting_fields(local, server, ignore).is_empty()
}

/// User-facing description of a conflict.
pub fn format_conflict_message(entity: EntityType, fields: &[String]) -> String {
    if fields.is_empty() {
        format!("This {} was changed on another device.", entity)
    } else {
        format!(
            "This {} was changed on another device. Conflicting fields: {}.",
            entity,
            fields.join(", ")
        )
    }
}

fn merge(local: &Record, server: &Record) -> (Record, usize) {
    let mut merged = server.clone();
    let mut taken = 0;

    for (field, value) in local {
        if SERVER_COMPUTED_FIELDS.contains(&field.as_str()) {
            continue;
        }
        if field_value(server, field) != value {
            merged.insert(field.clone(), value.clone());
            taken += 1;
        }
    }

    let local_ts = record_timestamp(local, "updated_at");
    let server_ts = record_timestamp(server, "updated_at");
    if local_ts > server_ts {
        if let Some(updated_at) = local.get("updated_at") {
            merged.insert("updated_at".to_string(), updated_at.clone());
        }
    }

    (merged, taken)
}

/// Resolve a divergence between `local` and `server` under `strategy`.
pub fn resolve_conflict(local: &Record, server: &Record, strategy: ConflictStrategy) -> Resolution {
    let had_conflict = has_conflict(local, server, DEFAULT_IGNORE_FIELDS);

    let (resolved, message) = match strategy {
        ConflictStrategy::ServerWins => (server.clone(), "Server version was kept".to_string()),
        ConflictStrategy::ClientWins => (local.clone(), "Local version was kept".to_string()),
        ConflictStrategy::LastWriteWins => {
            let local_ts = record_timestamp(local, "updated_at");
            let server_ts = record_timestamp(server, "updated_at");
            match server_ts.cmp(&local_ts) {
                std::cmp::Ordering::Greater => {
                    (server.clone(), "Server version was newer".to_string())
                }
                std::cmp::Ordering::Less => (local.clone(), "Local version was newer".to_string()),
                std::cmp::Ordering::Equal => (
                    local.clone(),
                    "Timestamps were equal; local version was kept".to_string(),
                ),
            }
        }
        ConflictStrategy::Merge => {
            let (merged, taken) = merge(local, server);
            (
                merged,
                format!("Merged {} local field(s) into server version", taken),
            )
        }
    };

    Resolution {
        resolved,
        had_conflict,
        strategy,
        message,
    }
}

/// Resolve using a strategy name.
///
/// An unknown name falls back to server-wins; the divergence is still
/// reported through `had_conflict`.
pub fn resolve_conflict_named(local: &Record, server: &Record, strategy: &str) -> Resolution {
    let strategy = strategy.parse().unwrap_or_else(|_| {
        warn!("Unknown conflict strategy '{}', keeping server version", strategy);
        ConflictStrategy::ServerWins
    });
    resolve_conflict(local, server, strategy)
}

/// Resolve every local record against its server counterpart, joined by id.
///
/// Records with no server counterpart (or no id) are kept as they are.
/// Server-only records are left to the bulk refresh.
pub fn batch_resolve_conflicts(
    locals: &[Record],
    servers: &[Record],
    strategy: ConflictStrategy,
) -> Vec<Resolution> {
    let by_id: HashMap<&str, &Record> = servers
        .iter()
        .filter_map(|r| record_id(r).map(|id| (id, r)))
        .collect();

    locals
        .iter()
        .map(|local| match record_id(local).and_then(|id| by_id.get(id)) {
            Some(server) => resolve_conflict(local, server, strategy),
            None => Resolution {
                resolved: local.clone(),
                had_conflict: false,
                strategy,
                message: "No server version; local version was kept".to_string(),
            },
        })
        .collect()
}

/// Resolver bound to a configured default strategy.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self { default_strategy }
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Resolve with the default strategy.
    pub fn resolve(&self, local: &Record, server: &Record) -> Resolution {
        resolve_conflict(local, server, self.default_strategy)
    }

    /// Differing fields under the default ignore set.
    pub fn conflicting_fields(&self, local: &Record, server: &Record) -> Vec<String> {
        conflicting_fields(local, server, DEFAULT_IGNORE_FIELDS)
    }
}

//! Configuration for the apply worker.
//!
//! Configuration arrives already validated from the host process manager;
//! this module only defines the shapes. Everything is `serde`-deserializable
//! so the host can load it from YAML/JSON or build it programmatically.
//!
//! # Quick Start
//!
//! ```rust
//! use apply_engine::config::{ApplyConfig, LocalNodeConfig, UpstreamConfig};
//!
//! let config = ApplyConfig {
//!     local: LocalNodeConfig::for_testing(222),
//!     upstreams: vec![UpstreamConfig::for_testing("node-a", "10.0.0.7:5533")],
//!     ..Default::default()
//! };
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local:
//!   node_id: 222
//!   timeline: 1
//!   database_id: 16384
//!   database: appdb
//!
//! upstreams:
//!   - name: "node-a"
//!     addr: "10.0.0.7:5533"
//!     database: appdb
//!     apply_delay_ms: 0
//!
//! settings:
//!   wait_timeout: "1s"
//!   commit_durability: durable
//!
//! positions:
//!   sqlite_path: "/var/lib/app/apply_positions.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object for one host process.
///
/// One worker is spawned per entry in `upstreams`; workers share nothing but
/// the position store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Identity of the local node. Compared against the remote's identity
    /// during negotiation to refuse self-loops.
    pub local: LocalNodeConfig,

    /// The remote nodes to consume change streams from.
    pub upstreams: Vec<UpstreamConfig>,

    /// Run-loop tunables shared by all workers.
    #[serde(default)]
    pub settings: WorkerSettings,

    /// Position store persistence settings.
    #[serde(default)]
    pub positions: PositionStoreConfig,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            local: LocalNodeConfig {
                node_id: 1,
                timeline: 1,
                database_id: 16384,
                database: "appdb".to_string(),
            },
            upstreams: Vec::new(),
            settings: WorkerSettings::default(),
            positions: PositionStoreConfig::default(),
        }
    }
}

/// Identity of the local node.
///
/// `node_id` must differ from every remote's node id; negotiation fails
/// fatally otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    /// System-wide unique node identifier.
    pub node_id: u64,

    /// Local timeline identifier.
    pub timeline: u32,

    /// Local database identifier; part of the slot-name key space.
    pub database_id: u32,

    /// Local database name (operator-facing, used in logs).
    pub database: String,
}

impl LocalNodeConfig {
    /// Create a local identity for testing.
    pub fn for_testing(node_id: u64) -> Self {
        Self {
            node_id,
            timeline: 1,
            database_id: 16384,
            database: "appdb".to_string(),
        }
    }
}

/// Configuration for a single upstream node (one worker's connection
/// descriptor, minus the negotiated parts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Operator-facing name for this upstream (used in logs and metrics).
    pub name: String,

    /// `host:port` of the remote node's replication listener.
    pub addr: String,

    /// Remote database to stream from.
    pub database: String,

    /// Delay before a remote transaction becomes visible locally, in
    /// milliseconds. Zero means apply immediately.
    #[serde(default)]
    pub apply_delay_ms: u64,

    /// Origin name, distinguishing multiple streams from the same remote
    /// database. Empty for the default stream.
    #[serde(default)]
    pub origin_name: String,
}

impl UpstreamConfig {
    /// The apply delay as a `Duration`.
    pub fn apply_delay(&self) -> Duration {
        Duration::from_millis(self.apply_delay_ms)
    }

    /// Create an upstream config for testing.
    pub fn for_testing(name: &str, addr: &str) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
            database: "appdb".to_string(),
            apply_delay_ms: 0,
            origin_name: String::new(),
        }
    }
}

/// Run-loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Upper bound on one blocked wait in the run loop, as a duration
    /// string (e.g. "1s"). Bounds shutdown latency while idle.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: String,

    /// Durability level for position-store commits.
    #[serde(default)]
    pub commit_durability: CommitDurability,

    /// Whether feedback frames ask the remote for a reply.
    #[serde(default)]
    pub reply_requested: bool,
}

fn default_wait_timeout() -> String {
    "1s".to_string()
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            wait_timeout: default_wait_timeout(),
            commit_durability: CommitDurability::default(),
            reply_requested: false,
        }
    }
}

impl WorkerSettings {
    /// Parse the wait_timeout string to a Duration.
    pub fn wait_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.wait_timeout).unwrap_or(Duration::from_secs(1))
    }
}

/// Durability level applied to position-store commits.
///
/// Maps onto SQLite's `synchronous` pragma: `Durable` fsyncs on every
/// commit, `Relaxed` lets the WAL absorb a crash window (replay is
/// idempotent from the last acknowledged position, so the relaxed level
/// only costs re-applied changes after a crash).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitDurability {
    /// Fsync on every commit (SQLite `synchronous = FULL`).
    #[default]
    Durable,
    /// WAL-only durability (SQLite `synchronous = NORMAL`).
    Relaxed,
}

/// Position store persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionStoreConfig {
    /// Path to the SQLite database holding origins and positions.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PositionStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "apply_positions.db".to_string(),
            wal_mode: true,
        }
    }
}

impl PositionStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

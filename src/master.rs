//! Shard-to-group configurations and the shard master query seam.
//!
//! The shard master service itself is an external collaborator; replicas
//! and clerks reach it through the `ShardMaster` trait. `LocalMaster` is an
//! in-memory implementation for tests, embedders, and single-node runs.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::utils::ShardsetError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::Mutex;

/// Replica group ID type. Group 0 is reserved to mean "no group".
pub type GroupId = u64;

/// Client identifier type. Peer sender groups fold into the same opaque
/// 64-bit space when acting as dedup keys.
pub type ClientId = u64;

/// Per-client request sequence number type.
pub type Seq = u64;

/// Fixed number of shards the key space is partitioned into.
pub const NUM_SHARDS: usize = 10;

/// Maps a key to the index of the shard that holds it. Intentionally a
/// trivial stable function of the first byte so that every process, of any
/// build, routes identically.
pub fn key_to_shard(key: &str) -> usize {
    key.as_bytes().first().map_or(0, |b| (*b as usize) % NUM_SHARDS)
}

/// A numbered assignment of shards to replica groups. Configuration numbers
/// are strictly monotonic; number 0 is the initial configuration in which no
/// group owns any shard.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration sequence number.
    pub num: u64,

    /// Owning group of each shard (0 = unowned).
    pub shards: [GroupId; NUM_SHARDS],

    /// Group ID -> addresses of that group's replica servers.
    pub groups: HashMap<GroupId, Vec<SocketAddr>>,
}

impl Config {
    /// The initial empty configuration.
    pub fn empty() -> Self {
        Config {
            num: 0,
            shards: [0; NUM_SHARDS],
            groups: HashMap::new(),
        }
    }
}

/// Query interface to the shard master service.
#[async_trait]
pub trait ShardMaster: Send + Sync {
    /// Fetches the configuration numbered `num`, or the newest one if `num`
    /// is `None` or beyond the newest published.
    async fn query(&self, num: Option<u64>) -> Result<Config, ShardsetError>;
}

/// In-memory shard master: a publishable, totally-ordered sequence of
/// configurations starting from the empty configuration 0.
pub struct LocalMaster {
    /// All published configurations, indexed by their number.
    configs: Mutex<Vec<Config>>,
}

impl LocalMaster {
    /// Creates a master holding only the empty configuration.
    pub fn new() -> Self {
        LocalMaster {
            configs: Mutex::new(vec![Config::empty()]),
        }
    }

    /// Publishes the next configuration. Its number must be exactly one past
    /// the newest published one.
    pub async fn publish(&self, config: Config) -> Result<(), ShardsetError> {
        let mut configs = self.configs.lock().await;
        if config.num != configs.len() as u64 {
            return logged_err!("master"; "non-consecutive config number {} (expecting {})",
                                         config.num, configs.len());
        }
        configs.push(config);
        Ok(())
    }
}

impl Default for LocalMaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardMaster for LocalMaster {
    async fn query(&self, num: Option<u64>) -> Result<Config, ShardsetError> {
        let configs = self.configs.lock().await;
        let idx = match num {
            Some(num) if (num as usize) < configs.len() => num as usize,
            _ => configs.len() - 1,
        };
        Ok(configs[idx].clone())
    }
}

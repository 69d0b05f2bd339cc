//! Shard state machine: op log entries and their deterministic application.

use std::collections::{HashMap, HashSet};

use crate::master::{ClientId, GroupId, Seq};

use serde::{Deserialize, Serialize};

/// State of a single shard: the key/value database plus the dedup tables
/// recording, per client and per donor group, the highest sequence number
/// whose effect is already incorporated.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ShardState {
    /// Key -> current value.
    pub database: HashMap<String, String>,

    /// Client -> highest absorbed sequence number.
    pub max_client_seq: HashMap<ClientId, Seq>,

    /// Donor group -> highest handoff sequence installed into this shard.
    /// Kept apart from the client dedup table so group IDs never mix with
    /// client IDs.
    pub handoff: HashMap<GroupId, Seq>,
}

impl ShardState {
    /// True if the effect of `(client, seq)` is already in the database.
    pub fn seen(&self, client: ClientId, seq: Seq) -> bool {
        seq <= self.max_client_seq.get(&client).copied().unwrap_or(0)
    }

    /// True if a handoff from `donor` with `seq` is already installed.
    pub fn handed_off(&self, donor: GroupId, seq: Seq) -> bool {
        seq <= self.handoff.get(&donor).copied().unwrap_or(0)
    }

    /// Records `(client, seq)` as absorbed.
    fn absorb(&mut self, client: ClientId, seq: Seq) {
        let max = self.max_client_seq.entry(client).or_insert(0);
        if seq > *max {
            *max = seq;
        }
    }
}

/// Operation agreed through the consensus log, one per slot.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Op {
    /// Read of a key. Logged like a write so that reads linearize against
    /// in-flight configuration changes.
    Get {
        key: String,
        client: ClientId,
        seq: Seq,
        shard: usize,
        config_num: u64,
    },

    /// Overwrite of a key's value.
    Put {
        key: String,
        value: String,
        client: ClientId,
        seq: Seq,
        shard: usize,
        config_num: u64,
    },

    /// Concatenation onto a key's current value (missing key reads as "").
    Append {
        key: String,
        value: String,
        client: ClientId,
        seq: Seq,
        shard: usize,
        config_num: u64,
    },

    /// Wholesale install of a shard shipped by its previous owner group.
    Update {
        shard: usize,
        config_num: u64,
        database: HashMap<String, String>,
        max_client_seq: HashMap<ClientId, Seq>,
        sender: GroupId,
        seq: Seq,
    },

    /// No-op used to force all group replicas to a common slot before any
    /// shard state is shipped during reconfiguration.
    Noop,
}

/// What one `apply_op` call changed, telling the caller whether a shard's
/// durable record must be rewritten.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ApplyEffect {
    /// Nothing changed.
    None,

    /// The shard's state (database and/or dedup tables) changed.
    Shard { shard: usize },
}

/// Applies one decided op to the shard states. The database transition is
/// deterministic: every replica of a group converges by feeding it the same
/// ops in slot order. Duplicate submissions (same client and sequence
/// number) are no-ops. `config_num` is the applying replica's current
/// configuration; an install is tracked in `received` only when it belongs
/// to the transition out of that configuration, so that installs replayed
/// from older configurations cannot satisfy the current one.
pub fn apply_op(
    shards: &mut [ShardState],
    received: &mut HashSet<usize>,
    config_num: u64,
    op: &Op,
) -> ApplyEffect {
    match op {
        Op::Get {
            client, seq, shard, ..
        } => {
            let state = &mut shards[*shard];
            if state.seen(*client, *seq) {
                return ApplyEffect::None;
            }
            state.absorb(*client, *seq);
            ApplyEffect::Shard { shard: *shard }
        }

        Op::Put {
            key,
            value,
            client,
            seq,
            shard,
            ..
        } => {
            let state = &mut shards[*shard];
            if state.seen(*client, *seq) {
                return ApplyEffect::None;
            }
            state.database.insert(key.clone(), value.clone());
            state.absorb(*client, *seq);
            ApplyEffect::Shard { shard: *shard }
        }

        Op::Append {
            key,
            value,
            client,
            seq,
            shard,
            ..
        } => {
            let state = &mut shards[*shard];
            if state.seen(*client, *seq) {
                return ApplyEffect::None;
            }
            state
                .database
                .entry(key.clone())
                .or_default()
                .push_str(value);
            state.absorb(*client, *seq);
            ApplyEffect::Shard { shard: *shard }
        }

        Op::Update {
            shard,
            config_num: op_config_num,
            database,
            max_client_seq,
            sender,
            seq,
        } => {
            if *op_config_num == config_num {
                received.insert(*shard);
            }
            let state = &mut shards[*shard];
            if state.handed_off(*sender, *seq) {
                return ApplyEffect::None;
            }
            state.database = database.clone();
            state.max_client_seq = max_client_seq.clone();
            state.handoff.insert(*sender, *seq);
            ApplyEffect::Shard { shard: *shard }
        }

        Op::Noop => ApplyEffect::None,
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;

    fn fresh() -> (Vec<ShardState>, HashSet<usize>) {
        (vec![ShardState::default(); 10], HashSet::new())
    }

    fn put(key: &str, value: &str, seq: Seq) -> Op {
        Op::Put {
            key: key.into(),
            value: value.into(),
            client: 42,
            seq,
            shard: 3,
            config_num: 1,
        }
    }

    fn append(key: &str, value: &str, seq: Seq) -> Op {
        Op::Append {
            key: key.into(),
            value: value.into(),
            client: 42,
            seq,
            shard: 3,
            config_num: 1,
        }
    }

    #[test]
    fn put_then_overwrite() {
        let (mut shards, mut received) = fresh();
        assert_eq!(
            apply_op(&mut shards, &mut received, 1, &put("k", "1", 1)),
            ApplyEffect::Shard { shard: 3 }
        );
        apply_op(&mut shards, &mut received, 1, &put("k", "2", 2));
        assert_eq!(shards[3].database["k"], "2");
        assert_eq!(shards[3].max_client_seq[&42], 2);
    }

    #[test]
    fn append_concatenates() {
        let (mut shards, mut received) = fresh();
        apply_op(&mut shards, &mut received, 1, &append("k", "a", 1));
        apply_op(&mut shards, &mut received, 1, &append("k", "b", 2));
        assert_eq!(shards[3].database["k"], "ab");
    }

    #[test]
    fn duplicate_submission_is_noop() {
        let (mut shards, mut received) = fresh();
        apply_op(&mut shards, &mut received, 1, &append("k", "a", 1));
        assert_eq!(
            apply_op(&mut shards, &mut received, 1, &append("k", "a", 1)),
            ApplyEffect::None
        );
        assert_eq!(shards[3].database["k"], "a");

        // stale sequence numbers are equally suppressed
        assert_eq!(
            apply_op(&mut shards, &mut received, 1, &put("k", "old", 0)),
            ApplyEffect::None
        );
        assert_eq!(shards[3].database["k"], "a");
    }

    #[test]
    fn get_absorbs_sequence_only() {
        let (mut shards, mut received) = fresh();
        apply_op(&mut shards, &mut received, 1, &put("k", "1", 1));
        let get = Op::Get {
            key: "k".into(),
            client: 42,
            seq: 2,
            shard: 3,
            config_num: 1,
        };
        assert_eq!(
            apply_op(&mut shards, &mut received, 1, &get),
            ApplyEffect::Shard { shard: 3 }
        );
        assert_eq!(shards[3].database["k"], "1");
        assert_eq!(shards[3].max_client_seq[&42], 2);
        // the same read replayed changes nothing
        assert_eq!(apply_op(&mut shards, &mut received, 1, &get), ApplyEffect::None);
    }

    #[test]
    fn install_replaces_wholesale() {
        let (mut shards, mut received) = fresh();
        apply_op(&mut shards, &mut received, 1, &put("stale", "x", 1));

        let update = Op::Update {
            shard: 3,
            config_num: 1,
            database: HashMap::from([("k".into(), "v".into())]),
            max_client_seq: HashMap::from([(7, 5)]),
            sender: 101,
            seq: 1,
        };
        assert_eq!(
            apply_op(&mut shards, &mut received, 1, &update),
            ApplyEffect::Shard { shard: 3 }
        );
        assert!(received.contains(&3));
        assert_eq!(shards[3].database, HashMap::from([("k".into(), "v".into())]));
        assert_eq!(shards[3].max_client_seq, HashMap::from([(7, 5)]));
        // the donor's handoff stamp lands in its own table, not among
        // client dedup entries
        assert_eq!(shards[3].handoff[&101], 1);
        // the old owner's pre-install contents are gone
        assert!(!shards[3].database.contains_key("stale"));
    }

    #[test]
    fn duplicate_install_is_noop() {
        let (mut shards, mut received) = fresh();
        let update = Op::Update {
            shard: 3,
            config_num: 1,
            database: HashMap::from([("k".into(), "v".into())]),
            max_client_seq: HashMap::new(),
            sender: 101,
            seq: 1,
        };
        apply_op(&mut shards, &mut received, 1, &update);
        let before = shards[3].clone();
        assert_eq!(
            apply_op(&mut shards, &mut received, 1, &update),
            ApplyEffect::None
        );
        assert_eq!(shards[3], before);
    }

    #[test]
    fn stale_install_not_tracked_as_received() {
        let (mut shards, mut received) = fresh();
        // an install replayed while the replica is already two transitions
        // ahead installs data (dedup permitting) but must not satisfy the
        // current transition's acquisition tracking
        let update = Op::Update {
            shard: 3,
            config_num: 1,
            database: HashMap::from([("k".into(), "v".into())]),
            max_client_seq: HashMap::new(),
            sender: 101,
            seq: 1,
        };
        assert_eq!(
            apply_op(&mut shards, &mut received, 3, &update),
            ApplyEffect::Shard { shard: 3 }
        );
        assert!(received.is_empty());
        assert_eq!(shards[3].handoff[&101], 1);
    }

    #[test]
    fn noop_changes_nothing() {
        let (mut shards, mut received) = fresh();
        apply_op(&mut shards, &mut received, 1, &put("k", "1", 1));
        let before = shards.clone();
        assert_eq!(
            apply_op(&mut shards, &mut received, 1, &Op::Noop),
            ApplyEffect::None
        );
        assert_eq!(shards, before);
        assert!(received.is_empty());
    }
}

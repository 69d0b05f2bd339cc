//! Per-slot consensus engine seam and an in-process implementation.
//!
//! Each replica group agrees on an ordered op log, one consensus instance
//! per slot. The engine itself (a Paxos implementation in real deployments)
//! is reached through the `ConsensusLog` trait; it owns its own durable log
//! and rehydrates it on restart. `LocalConsensus` is the in-process engine
//! used by tests, the standalone binary, and embedders: the replicas of one
//! group share a slot table in which the first proposal to reach a slot
//! decides it, mirroring a group that always reaches agreement instantly.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::server::Op;
use crate::utils::ShardsetError;

use async_trait::async_trait;

use tokio::sync::Mutex;

/// Consensus slot index type. Slot numbering starts at 1; slot 0 is the
/// "nothing applied yet" watermark.
pub type Slot = u64;

/// Decision state of one consensus slot.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SlotStatus {
    /// The slot has an agreed value.
    Decided(Op),

    /// No agreement reached yet; keep polling.
    Pending,

    /// The slot was garbage-collected below the group's done watermark.
    Forgotten,
}

/// Interface to the consensus engine driving one replica group's op log.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Proposes a value for the given slot. Returns immediately; agreement
    /// is observed through `status`.
    async fn start(&self, slot: Slot, op: Op) -> Result<(), ShardsetError>;

    /// Reports the decision state of the given slot.
    async fn status(&self, slot: Slot) -> Result<SlotStatus, ShardsetError>;

    /// Tells the engine that this replica has applied all slots up to and
    /// including `upto`, allowing garbage collection once every group
    /// member is past them.
    async fn done(&self, upto: Slot) -> Result<(), ShardsetError>;
}

/// Shared state of a `LocalConsensus` group.
struct LocalConsensusState {
    /// Decided value of each live slot.
    decided: BTreeMap<Slot, Op>,

    /// Per-member applied watermark reported through `done`.
    done: Vec<Slot>,

    /// Slots at or below this index have been garbage-collected.
    floor: Slot,
}

/// In-process consensus engine shared by the replicas of one group.
pub struct LocalConsensus {
    state: Mutex<LocalConsensusState>,
}

impl LocalConsensus {
    /// Creates the shared engine for a group with `population` members.
    pub fn new(population: usize) -> Arc<Self> {
        Arc::new(LocalConsensus {
            state: Mutex::new(LocalConsensusState {
                decided: BTreeMap::new(),
                done: vec![0; population],
                floor: 0,
            }),
        })
    }

    /// Returns member `me`'s handle onto the shared engine.
    pub fn handle(self: &Arc<Self>, me: usize) -> LocalConsensusHandle {
        LocalConsensusHandle {
            group: Arc::clone(self),
            me,
        }
    }
}

/// One group member's handle onto a `LocalConsensus` engine.
#[derive(Clone)]
pub struct LocalConsensusHandle {
    group: Arc<LocalConsensus>,
    me: usize,
}

#[async_trait]
impl ConsensusLog for LocalConsensusHandle {
    async fn start(&self, slot: Slot, op: Op) -> Result<(), ShardsetError> {
        let mut state = self.group.state.lock().await;
        if slot > state.floor {
            state.decided.entry(slot).or_insert(op);
        }
        Ok(())
    }

    async fn status(&self, slot: Slot) -> Result<SlotStatus, ShardsetError> {
        let state = self.group.state.lock().await;
        if slot <= state.floor {
            return Ok(SlotStatus::Forgotten);
        }
        Ok(match state.decided.get(&slot) {
            Some(op) => SlotStatus::Decided(op.clone()),
            None => SlotStatus::Pending,
        })
    }

    async fn done(&self, upto: Slot) -> Result<(), ShardsetError> {
        let mut state = self.group.state.lock().await;
        if upto > state.done[self.me] {
            state.done[self.me] = upto;
        }
        // slots every member has applied can be dropped
        let group_min = state.done.iter().copied().min().unwrap_or(0);
        if group_min > state.floor {
            state.floor = group_min;
            state.decided = state.decided.split_off(&(group_min + 1));
        }
        Ok(())
    }
}

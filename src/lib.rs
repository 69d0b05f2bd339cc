//! Public interface to the shardset library: a sharded, replicated,
//! disk-durable key/value store.
//!
//! A fixed number of shards partition the key space; each shard is owned at
//! any moment by exactly one replica group. Within a group, replicas agree
//! on an ordered op log through a per-slot consensus engine; across groups,
//! shard ownership moves with the shard master's configuration sequence
//! without losing, duplicating, or reordering client updates.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod client;
mod consensus;
mod master;
mod server;

pub use client::{Clerk, ClerkConfig};
pub use consensus::{
    ConsensusLog, LocalConsensus, LocalConsensusHandle, Slot, SlotStatus,
};
pub use master::{
    key_to_shard, ClientId, Config, GroupId, LocalMaster, Seq, ShardMaster,
    NUM_SHARDS,
};
pub use server::{
    ErrCode, GetArgs, GetReply, Op, PutAppendArgs, PutAppendReply, PutKind,
    RecoverReply, Reply, ReplicaConfig, Request, ShardServer, ShardState,
    UpdateArgs, UpdateReply,
};
pub use utils::ShardsetError;

//! Shardset's server-side functionality modules.

mod external;
mod reconfig;
mod replica;
mod statemach;
mod storage;

pub use external::{
    ErrCode, GetArgs, GetReply, PutAppendArgs, PutAppendReply, PutKind,
    RecoverReply, Reply, Request, UpdateArgs, UpdateReply,
};
pub use replica::{ReplicaConfig, ShardServer};
pub use statemach::{apply_op, ApplyEffect, Op, ShardState};

//! Client/peer RPC surface: wire records, the per-connection servant task,
//! and the outbound call helper.
//!
//! Every request/reply travels as a length-prefixed MessagePack frame. One
//! listener per replica serves both client traffic (Get/PutAppend) and peer
//! traffic (Update shard handoffs, Recover snapshots).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::master::{ClientId, Config, GroupId, Seq};
use crate::server::replica::ShardServer;
use crate::server::statemach::ShardState;
use crate::utils::{recv_msg, send_msg, ShardsetError};

use serde::{Deserialize, Serialize};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// Error code carried in replies; the only values callers ever see.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ErrCode {
    Ok,
    NoKey,
    WrongGroup,
}

/// Which mutation a PutAppend request carries.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum PutKind {
    Put,
    Append,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client: ClientId,
    pub seq: Seq,
    pub config_num: u64,
    pub shard: usize,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub err: ErrCode,
    pub value: String,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub kind: PutKind,
    pub client: ClientId,
    pub seq: Seq,
    pub config_num: u64,
    pub shard: usize,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub err: ErrCode,
}

/// Shard handoff from the group losing a shard to the group gaining it,
/// keyed idempotently by `(sender, seq)`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct UpdateArgs {
    pub shard: usize,
    pub config_num: u64,
    pub database: HashMap<String, String>,
    pub max_client_seq: HashMap<ClientId, Seq>,
    pub sender: GroupId,
    pub seq: Seq,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct UpdateReply {
    pub err: ErrCode,
}

/// Full-state snapshot served to a group peer restarting after disk loss.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RecoverReply {
    pub shards: Vec<ShardState>,
    pub config: Config,
    pub last_applied: u64,
    pub received: HashSet<usize>,
}

/// Request frame read off a connection.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Request {
    Get(GetArgs),
    PutAppend(PutAppendArgs),
    Update(UpdateArgs),
    Recover,
}

/// Reply frame written back for a request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Reply {
    Get(GetReply),
    PutAppend(PutAppendReply),
    Update(UpdateReply),
    Recover(Box<RecoverReply>),
}

/// Sends one request to a server over a fresh connection and waits for its
/// reply, bounding both the connect and the reply wait by `timeout`. Any
/// failure surfaces as an error; callers treat it as "no reply" and retry.
pub(crate) async fn call(
    addr: SocketAddr,
    req: &Request,
    timeout: Duration,
) -> Result<Reply, ShardsetError> {
    let mut stream = time::timeout(timeout, TcpStream::connect(addr)).await??;
    send_msg(&mut stream, req).await?;
    let reply = time::timeout(timeout, recv_msg(&mut stream)).await??;
    Ok(reply)
}

/// Serves one accepted connection: reads framed requests and writes framed
/// replies, in order, until the peer hangs up or the replica shuts down.
/// Storage failures inside a handler are reported as fatal.
pub(crate) async fn servant_task(
    server: Arc<ShardServer>,
    mut stream: TcpStream,
    tx_fatal: mpsc::UnboundedSender<ShardsetError>,
) {
    let mut rx_term = server.term_watch();
    loop {
        let req: Request = tokio::select! {
            req = recv_msg(&mut stream) => {
                match req {
                    Ok(req) => req,
                    Err(_) => return, // connection closed by peer
                }
            },
            _ = rx_term.changed() => return,
        };

        let reply = match server.dispatch(req).await {
            Ok(reply) => reply,
            Err(e) => {
                // a handler fails only when shutting down or when durable
                // state can no longer be written; the latter is fatal
                if !*rx_term.borrow() {
                    let _ = tx_fatal.send(e);
                }
                return;
            }
        };

        if let Err(e) = send_msg(&mut stream, &reply).await {
            pf_debug!(server.id(); "error writing reply: {}", e);
            return;
        }
    }
}

//! Client library ("clerk") for the sharded store.
//!
//! A clerk picks an immutable random client ID at creation and stamps each
//! logical operation with the next sequence number; a retried operation
//! keeps its number, which is what makes retries at-most-once server-side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::master::{key_to_shard, ClientId, Seq, ShardMaster};
use crate::server::{
    ErrCode, GetArgs, PutAppendArgs, PutKind, Reply, Request,
};
use crate::utils::{recv_msg, send_msg, ShardsetError};

use serde::Deserialize;

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClerkConfig {
    /// Reply timeout of one server call in millisecs.
    pub reply_timeout_ms: u64,

    /// Pause before the next routing round after a miss, in millisecs.
    pub retry_pause_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ClerkConfig {
    fn default() -> Self {
        ClerkConfig {
            reply_timeout_ms: 500,
            retry_pause_ms: 100,
        }
    }
}

/// Client handle onto a shardset deployment.
pub struct Clerk {
    /// My immutable client ID.
    id: ClientId,

    /// Sequence number of the latest operation issued.
    seq: Seq,

    /// Shard master query handle.
    master: Arc<dyn ShardMaster>,

    /// Configuration parameters struct.
    config: ClerkConfig,

    /// Cached server connections, dropped on any call failure.
    conns: HashMap<SocketAddr, TcpStream>,
}

impl Clerk {
    /// Creates a new clerk with a random client ID.
    pub fn new_and_setup(
        master: Arc<dyn ShardMaster>,
        config_str: Option<&str>,
    ) -> Result<Self, ShardsetError> {
        let config = parsed_config!(config_str => ClerkConfig;
                                    reply_timeout_ms, retry_pause_ms)?;
        Ok(Clerk {
            id: rand::random(),
            seq: 0,
            master,
            config,
            conns: HashMap::new(),
        })
    }

    /// Reads a key. Returns `None` if the key does not exist. Retries until
    /// the owning group answers.
    pub async fn get(
        &mut self,
        key: &str,
    ) -> Result<Option<String>, ShardsetError> {
        self.seq += 1;
        let seq = self.seq;
        let shard = key_to_shard(key);

        loop {
            let config = self.master.query(None).await?;
            let gid = config.shards[shard];
            if let Some(servers) =
                config.groups.get(&gid).filter(|_| gid != 0)
            {
                for &srv in servers.iter() {
                    let args = GetArgs {
                        key: key.into(),
                        client: self.id,
                        seq,
                        config_num: config.num,
                        shard,
                    };
                    match self.call(srv, &Request::Get(args)).await {
                        Ok(Reply::Get(reply)) => match reply.err {
                            ErrCode::Ok => return Ok(Some(reply.value)),
                            ErrCode::NoKey => return Ok(None),
                            // routing stale; re-query the master
                            ErrCode::WrongGroup => break,
                        },
                        Ok(_) => {}  // mismatched reply frame; next server
                        Err(_) => {} // no reply; next server
                    }
                }
            }
            time::sleep(Duration::from_millis(self.config.retry_pause_ms))
                .await;
        }
    }

    /// Overwrites a key's value. Applied exactly once regardless of how many
    /// internal retries it takes.
    pub async fn put(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<(), ShardsetError> {
        self.put_append(key, value, PutKind::Put).await
    }

    /// Appends to a key's value (a missing key reads as empty). Applied
    /// exactly once regardless of how many internal retries it takes.
    pub async fn append(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<(), ShardsetError> {
        self.put_append(key, value, PutKind::Append).await
    }

    async fn put_append(
        &mut self,
        key: &str,
        value: &str,
        kind: PutKind,
    ) -> Result<(), ShardsetError> {
        self.seq += 1;
        let seq = self.seq;
        let shard = key_to_shard(key);

        loop {
            let config = self.master.query(None).await?;
            let gid = config.shards[shard];
            if let Some(servers) =
                config.groups.get(&gid).filter(|_| gid != 0)
            {
                for &srv in servers.iter() {
                    let args = PutAppendArgs {
                        key: key.into(),
                        value: value.into(),
                        kind,
                        client: self.id,
                        seq,
                        config_num: config.num,
                        shard,
                    };
                    match self.call(srv, &Request::PutAppend(args)).await {
                        Ok(Reply::PutAppend(reply)) => match reply.err {
                            ErrCode::Ok => return Ok(()),
                            ErrCode::WrongGroup => break,
                            ErrCode::NoKey => {}
                        },
                        Ok(_) => {}
                        Err(_) => {}
                    }
                }
            }
            time::sleep(Duration::from_millis(self.config.retry_pause_ms))
                .await;
        }
    }

    /// Sends one framed request to a server, reusing a cached connection,
    /// and waits for its framed reply. Any failure drops the cached
    /// connection so the next attempt reconnects.
    async fn call(
        &mut self,
        srv: SocketAddr,
        req: &Request,
    ) -> Result<Reply, ShardsetError> {
        let timeout = Duration::from_millis(self.config.reply_timeout_ms);
        let mut stream = match self.conns.remove(&srv) {
            Some(stream) => stream,
            None => time::timeout(timeout, TcpStream::connect(srv)).await??,
        };
        let result = Self::roundtrip(&mut stream, req, timeout).await;
        if result.is_ok() {
            self.conns.insert(srv, stream);
        }
        result
    }

    async fn roundtrip(
        stream: &mut TcpStream,
        req: &Request,
        timeout: Duration,
    ) -> Result<Reply, ShardsetError> {
        send_msg(stream, req).await?;
        Ok(time::timeout(timeout, recv_msg(stream)).await??)
    }
}

#[cfg(test)]
mod clerk_tests {
    use super::*;
    use crate::master::LocalMaster;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn clerk_ids_distinct() -> Result<(), ShardsetError> {
        let master = Arc::new(LocalMaster::new());
        let ck_a = Clerk::new_and_setup(master.clone(), None)?;
        let ck_b = Clerk::new_and_setup(master, None)?;
        assert_ne!(ck_a.id, ck_b.id);
        Ok(())
    }

    #[test]
    fn clerk_config_overrides() -> Result<(), ShardsetError> {
        let config = parsed_config!(Some("reply_timeout_ms = 50") => ClerkConfig;
                                    reply_timeout_ms, retry_pause_ms)?;
        assert_eq!(config.reply_timeout_ms, 50);
        assert_eq!(config.retry_pause_ms, 100);
        Ok(())
    }
}

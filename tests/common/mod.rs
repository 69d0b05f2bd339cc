//! Shared scaffolding for end-to-end tests: in-process replica groups and
//! clerks talking over real localhost TCP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use shardset::{
    Config, GroupId, LocalConsensus, LocalMaster, Reply, Request,
    ShardServer, ShardsetError, NUM_SHARDS,
};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Replica parameter overrides keeping test reconfiguration snappy.
pub const TEST_PARAMS: &str = "tick_interval_ms = 40\n\
                               ship_retry_ms = 40\n\
                               call_timeout_ms = 300";

static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);

/// Allocates fresh localhost addresses; distinct `base` values keep test
/// files out of each other's port ranges.
pub fn alloc_addrs(base: u16, count: usize) -> Vec<SocketAddr> {
    (0..count)
        .map(|_| {
            let port = base + PORT_OFFSET.fetch_add(1, Ordering::SeqCst);
            format!("127.0.0.1:{}", port).parse().unwrap()
        })
        .collect()
}

/// One replica group under test: a shared in-process consensus engine plus
/// per-replica servers, data directories, and listen addresses.
pub struct TestGroup {
    pub gid: GroupId,
    pub addrs: Vec<SocketAddr>,
    pub dirs: Vec<String>,
    pub consensus: Arc<LocalConsensus>,
    pub servers: Vec<Option<Arc<ShardServer>>>,
}

impl TestGroup {
    /// Launches a whole group with wiped data directories.
    pub async fn launch(
        tag: &str,
        gid: GroupId,
        population: usize,
        base_port: u16,
        master: &Arc<LocalMaster>,
    ) -> Result<TestGroup, ShardsetError> {
        let addrs = alloc_addrs(base_port, population);
        let dirs: Vec<String> = (0..population)
            .map(|me| format!("/tmp/test-shardset-{}-{}-{}", tag, gid, me))
            .collect();
        for dir in &dirs {
            if fs::try_exists(dir).await? {
                fs::remove_dir_all(dir).await?;
            }
        }

        let mut group = TestGroup {
            gid,
            addrs,
            dirs,
            consensus: LocalConsensus::new(population),
            servers: (0..population).map(|_| None).collect(),
        };
        for me in 0..population {
            group.start_replica(me, master, false).await?;
        }
        Ok(group)
    }

    /// Starts (or restarts) one replica of the group and spawns its run
    /// loop in the background.
    pub async fn start_replica(
        &mut self,
        me: usize,
        master: &Arc<LocalMaster>,
        restart: bool,
    ) -> Result<(), ShardsetError> {
        let server = ShardServer::new_and_setup(
            self.gid,
            me,
            self.addrs.clone(),
            Path::new(&self.dirs[me]),
            Arc::new(self.consensus.handle(me)),
            master.clone(),
            Some(TEST_PARAMS),
            restart,
        )
        .await?;
        let node = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = node.run().await;
        });
        self.servers[me] = Some(server);
        Ok(())
    }

    /// Simulates a crash of one replica: all of its tasks stop, its data
    /// directory stays behind.
    pub fn crash_replica(&mut self, me: usize) {
        if let Some(server) = self.servers[me].take() {
            server.shutdown();
        }
    }

    /// Wipes one (crashed) replica's data directory, simulating disk loss.
    pub async fn wipe_disk(&self, me: usize) -> Result<(), ShardsetError> {
        if fs::try_exists(&self.dirs[me]).await? {
            fs::remove_dir_all(&self.dirs[me]).await?;
        }
        Ok(())
    }

    /// Stops every replica of the group.
    pub fn stop_all(&mut self) {
        for me in 0..self.servers.len() {
            self.crash_replica(me);
        }
    }
}

/// Builds a configuration from a shard ownership array and the groups that
/// appear in it.
pub fn config_with(
    num: u64,
    shards: [GroupId; NUM_SHARDS],
    groups: &[&TestGroup],
) -> Config {
    let mut map = HashMap::new();
    for group in groups {
        map.insert(group.gid, group.addrs.clone());
    }
    Config {
        num,
        shards,
        groups: map,
    }
}

/// Sends one raw framed request to a server and awaits its reply; used by
/// tests that need to craft duplicate submissions below the clerk API.
pub async fn raw_call(
    addr: SocketAddr,
    req: &Request,
) -> Result<Reply, ShardsetError> {
    let mut stream = TcpStream::connect(addr).await?;
    let req_bytes = rmp_serde::encode::to_vec(req)?;
    stream.write_u64(req_bytes.len() as u64).await?;
    stream.write_all(&req_bytes[..]).await?;
    stream.flush().await?;

    let reply_len = stream.read_u64().await?;
    let mut reply_buf: Vec<u8> = vec![0; reply_len as usize];
    stream.read_exact(&mut reply_buf[..]).await?;
    Ok(rmp_serde::decode::from_slice(&reply_buf)?)
}

/// Sleeps for the given number of milliseconds.
pub async fn pause_ms(ms: u64) {
    time::sleep(Duration::from_millis(ms)).await;
}

//! Shardset standalone server executable: one replica group of one server
//! owning every shard, for single-node deployments and smoke testing.
//! Multi-node deployments embed the library and plug a real consensus
//! engine and shard master through its traits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use shardset::{
    pf_error, Config, GroupId, LocalConsensus, LocalMaster, ShardServer,
    ShardsetError, NUM_SHARDS,
};

/// The group ID the standalone server runs as.
const STANDALONE_GID: GroupId = 1;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Key-value API address to listen on.
    #[arg(short, long, default_value_t = String::from("127.0.0.1:52700"))]
    api_addr: String,

    /// Data directory for durable state.
    #[arg(short, long, default_value_t = String::from("/tmp/shardset.data"))]
    dir: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Treat this start as a restart after a crash.
    #[arg(short, long, default_value_t = false)]
    restart: bool,

    /// Replica configuration overrides as a TOML string,
    /// e.g. 'tick_interval_ms = 100'.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the parsed API address on
    /// success or `Err(ShardsetError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, ShardsetError> {
        let api_addr: SocketAddr = self.api_addr.parse()?;
        if api_addr.port() <= 1024 {
            Err(ShardsetError(format!(
                "invalid api port {}",
                api_addr.port()
            )))
        } else if self.threads < 2 {
            Err(ShardsetError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(api_addr)
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), ShardsetError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let api_addr = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-replica")
        .build()?;

    // enter tokio runtime, set up the replica, and run its main loop
    runtime.block_on(async move {
        // a fixed single-entry configuration sequence: this one group owns
        // every shard
        let master = Arc::new(LocalMaster::new());
        master
            .publish(Config {
                num: 1,
                shards: [STANDALONE_GID; NUM_SHARDS],
                groups: HashMap::from([(STANDALONE_GID, vec![api_addr])]),
            })
            .await?;

        let consensus = LocalConsensus::new(1);
        let node = ShardServer::new_and_setup(
            STANDALONE_GID,
            0,
            vec![api_addr],
            Path::new(&args.dir),
            Arc::new(consensus.handle(0)),
            master,
            args.config.as_deref(),
            args.restart,
        )
        .await?;

        node.run().await
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exitted: {}", e);
    }
}

//! Replica server: the coarse-mutex replica core, the propose-until-chosen
//! consensus driver, the client/peer RPC handlers, boot-time recovery, and
//! the accept loop.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::consensus::{ConsensusLog, Slot, SlotStatus};
use crate::master::{Config, GroupId, ShardMaster, NUM_SHARDS};
use crate::server::external::{
    call, servant_task, ErrCode, GetArgs, GetReply, PutAppendArgs,
    PutAppendReply, PutKind, RecoverReply, Reply, Request, UpdateArgs,
    UpdateReply,
};
use crate::server::statemach::{apply_op, ApplyEffect, Op, ShardState};
use crate::server::storage::{FileStore, Meta};
use crate::utils::{tcp_bind_with_retry, ShardsetError};

use serde::Deserialize;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Reconfiguration poll interval in millisecs.
    pub tick_interval_ms: u64,

    /// Pause between shard shipment (and peer recovery) retry rounds in
    /// millisecs.
    pub ship_retry_ms: u64,

    /// Reply timeout of one outbound peer call in millisecs.
    pub call_timeout_ms: u64,

    /// Initial consensus status poll backoff in microsecs.
    pub poll_backoff_init_us: u64,

    /// Consensus status poll backoff cap in millisecs.
    pub poll_backoff_cap_ms: u64,

    /// Whether to `fdatasync()` value/meta files before the atomic rename.
    pub file_sync: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            tick_interval_ms: 250,
            ship_retry_ms: 100,
            call_timeout_ms: 500,
            poll_backoff_init_us: 10,
            poll_backoff_cap_ms: 10_000,
            file_sync: false,
        }
    }
}

/// Mutable replica state guarded by the coarse mutex.
pub(crate) struct ReplicaCore {
    /// Current configuration.
    pub(crate) config: Config,

    /// One state per shard index.
    pub(crate) shards: Vec<ShardState>,

    /// Highest consensus slot whose op has been applied.
    pub(crate) last_applied: Slot,

    /// Shards already ingested from donor groups in the current transition.
    pub(crate) received: HashSet<usize>,

    /// Shards this group is handing off in the in-flight transition; not
    /// served until the transition completes.
    pub(crate) producing: HashSet<usize>,

    /// Durable backing store.
    pub(crate) store: FileStore,
}

impl ReplicaCore {
    /// Applies one decided op, persists its effects, and only then advances
    /// `last_applied` — the only durability checkpoint advertised onward.
    /// The shard record is one atomic unit, so an op's effect never reaches
    /// disk without its dedup entry; a crash before the meta write merely
    /// makes the log re-application of this op a no-op.
    pub(crate) async fn apply(&mut self, op: &Op) -> Result<(), ShardsetError> {
        let config_num = self.config.num;
        match apply_op(&mut self.shards, &mut self.received, config_num, op) {
            ApplyEffect::None => {}
            ApplyEffect::Shard { shard } => {
                self.store.write_shard(shard, &self.shards[shard]).await?;
            }
        }
        self.last_applied += 1;
        self.persist_meta().await?;
        Ok(())
    }

    /// Rewrites the durable meta record from current in-memory state.
    pub(crate) async fn persist_meta(&self) -> Result<(), ShardsetError> {
        self.store
            .write_meta(&Meta {
                config: self.config.clone(),
                last_applied: self.last_applied,
                received: self.received.clone(),
            })
            .await
    }

    /// True iff this replica currently serves the given shard. A shard
    /// being handed off to its next owner is no longer served, even before
    /// the configuration advances.
    pub(crate) fn serves(&self, gid: GroupId, shard: usize) -> bool {
        self.config.num > 0
            && self.config.shards[shard] == gid
            && !self.producing.contains(&shard)
    }
}

/// One sharded KV replica server.
pub struct ShardServer {
    /// Replica index within its group.
    pub(crate) me: usize,

    /// My replica group ID.
    pub(crate) gid: GroupId,

    /// Addresses of all replicas of my group; index `me` is my own.
    pub(crate) group_addrs: Vec<SocketAddr>,

    /// Configuration parameters struct.
    pub(crate) params: ReplicaConfig,

    /// Consensus engine handle for my group's op log.
    pub(crate) consensus: Arc<dyn ConsensusLog>,

    /// Shard master query handle.
    pub(crate) master: Arc<dyn ShardMaster>,

    /// Coarse-mutex replica core.
    pub(crate) core: Mutex<ReplicaCore>,

    /// Termination signal; flips to true once `shutdown` is called.
    pub(crate) tx_term: watch::Sender<bool>,
}

// ShardServer setup & run
impl ShardServer {
    /// Creates a replica server, recovering its state: from the data
    /// directory when the meta record survives, from a live group peer when
    /// the disk was lost on a restart, or empty on first boot.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_and_setup(
        gid: GroupId,
        me: usize,
        group_addrs: Vec<SocketAddr>,
        dir: &Path,
        consensus: Arc<dyn ConsensusLog>,
        master: Arc<dyn ShardMaster>,
        config_str: Option<&str>,
        restart: bool,
    ) -> Result<Arc<Self>, ShardsetError> {
        let params = parsed_config!(config_str => ReplicaConfig;
                                    tick_interval_ms, ship_retry_ms,
                                    call_timeout_ms, poll_backoff_init_us,
                                    poll_backoff_cap_ms, file_sync)?;
        if params.tick_interval_ms == 0 {
            return logged_err!(me; "invalid config.tick_interval_ms '{}'",
                                   params.tick_interval_ms);
        }
        if gid == 0 {
            return logged_err!(me; "group ID 0 is reserved");
        }
        if me >= group_addrs.len() {
            return logged_err!(me; "replica index {} out of group of {}",
                                   me, group_addrs.len());
        }

        let store = FileStore::new(dir, params.file_sync);
        store.prepare().await?;

        let mut core = ReplicaCore {
            config: Config::empty(),
            shards: vec![ShardState::default(); NUM_SHARDS],
            last_applied: 0,
            received: HashSet::new(),
            producing: HashSet::new(),
            store,
        };

        match core.store.read_meta().await? {
            Some(meta) => {
                // disk intact: rebuild in-memory indices from shard records
                core.config = meta.config;
                core.last_applied = meta.last_applied;
                core.received = meta.received;
                for shard in 0..NUM_SHARDS {
                    core.shards[shard] = core.store.read_shard(shard).await?;
                }
                pf_info!(me; "recovered from disk: config {} last_applied {}",
                             core.config.num, core.last_applied);
            }
            None if restart && group_addrs.len() > 1 => {
                // disk lost: pull a snapshot from a live group peer and
                // persist it before serving anything
                let snapshot =
                    Self::fetch_peer_snapshot(me, &group_addrs, &params)
                        .await?;
                if snapshot.shards.len() != NUM_SHARDS {
                    return logged_err!(me; "peer snapshot has {} shards",
                                           snapshot.shards.len());
                }
                core.config = snapshot.config;
                core.last_applied = snapshot.last_applied;
                core.received = snapshot.received;
                core.shards = snapshot.shards;
                for shard in 0..NUM_SHARDS {
                    core.store.write_shard(shard, &core.shards[shard]).await?;
                }
                core.persist_meta().await?;
                pf_info!(me; "recovered from peer: config {} last_applied {}",
                             core.config.num, core.last_applied);
            }
            None => {
                if restart {
                    pf_warn!(me; "restart without meta and without peers; starting empty");
                }
                core.persist_meta().await?;
            }
        }

        let (tx_term, _) = watch::channel(false);
        Ok(Arc::new(ShardServer {
            me,
            gid,
            group_addrs,
            params,
            consensus,
            master,
            core: Mutex::new(core),
            tx_term,
        }))
    }

    /// Runs the replica: binds the RPC listener, spawns the reconfiguration
    /// ticker, and accepts connections until shutdown or a fatal storage
    /// error.
    pub async fn run(self: Arc<Self>) -> Result<(), ShardsetError> {
        let listener =
            tcp_bind_with_retry(self.group_addrs[self.me], 10).await?;
        pf_info!(self.me; "replica of group {} listening on {}",
                          self.gid, self.group_addrs[self.me]);

        let (tx_fatal, mut rx_fatal) =
            mpsc::unbounded_channel::<ShardsetError>();
        let _ticker = tokio::spawn(crate::server::reconfig::ticker_task(
            Arc::clone(&self),
            tx_fatal.clone(),
        ));

        let mut rx_term = self.tx_term.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tokio::spawn(servant_task(
                                Arc::clone(&self),
                                stream,
                                tx_fatal.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!(self.me; "error accepting connection: {}", e);
                        }
                    }
                },

                fatal = rx_fatal.recv() => {
                    if let Some(e) = fatal {
                        pf_error!(self.me; "fatal replica error: {}", e);
                        self.shutdown();
                        return Err(e);
                    }
                },

                _ = rx_term.changed() => {
                    pf_info!(self.me; "replica caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    /// Signals every task of this replica to terminate.
    pub fn shutdown(&self) {
        self.tx_term.send_replace(true);
    }

    /// Subscribes to the termination signal.
    pub(crate) fn term_watch(&self) -> watch::Receiver<bool> {
        self.tx_term.subscribe()
    }

    /// This replica's index, for log line prefixes.
    pub(crate) fn id(&self) -> usize {
        self.me
    }

    /// Fetches a full-state snapshot from any live group peer, retrying
    /// rounds across the group until one answers.
    async fn fetch_peer_snapshot(
        me: usize,
        group_addrs: &[SocketAddr],
        params: &ReplicaConfig,
    ) -> Result<RecoverReply, ShardsetError> {
        let timeout = Duration::from_millis(params.call_timeout_ms);
        loop {
            for (peer, &addr) in group_addrs.iter().enumerate() {
                if peer == me {
                    continue;
                }
                if let Ok(Reply::Recover(snapshot)) =
                    call(addr, &Request::Recover, timeout).await
                {
                    pf_info!(me; "fetched recovery snapshot from peer {}", peer);
                    return Ok(*snapshot);
                }
            }
            time::sleep(Duration::from_millis(params.ship_retry_ms)).await;
        }
    }
}

// ShardServer consensus driver
impl ShardServer {
    /// Drives `op` through the consensus log: proposes at successive slots,
    /// applying every decided value in slot order (catching up on slots
    /// decided elsewhere), until the decided value at some slot equals `op`.
    pub(crate) async fn propose(&self, op: Op) -> Result<(), ShardsetError> {
        loop {
            let slot = {
                let core = self.core.lock().await;
                core.last_applied + 1
            };
            self.consensus.start(slot, op.clone()).await?;
            let decided = self.wait_decided(slot).await?;

            let mut core = self.core.lock().await;
            if slot == core.last_applied + 1 {
                core.apply(&decided).await?;
            }
            if decided == op {
                let upto = core.last_applied;
                drop(core);
                self.consensus.done(upto).await?;
                return Ok(());
            }
        }
    }

    /// Polls the decision status of a slot with exponential backoff until it
    /// is decided. The replica mutex is never held across the sleeps, so
    /// other handlers (and the ticker) keep making progress.
    async fn wait_decided(&self, slot: Slot) -> Result<Op, ShardsetError> {
        let mut rx_term = self.tx_term.subscribe();
        let mut backoff =
            Duration::from_micros(self.params.poll_backoff_init_us.max(1));
        let cap = Duration::from_millis(self.params.poll_backoff_cap_ms);
        loop {
            if *rx_term.borrow() {
                return logged_err!(self.me; "shut down while awaiting slot {}", slot);
            }
            match self.consensus.status(slot).await? {
                SlotStatus::Decided(op) => return Ok(op),
                SlotStatus::Pending => {}
                SlotStatus::Forgotten => {
                    return logged_err!(self.me;
                        "slot {} collected below the group watermark", slot);
                }
            }
            tokio::select! {
                _ = time::sleep(backoff) => {},
                _ = rx_term.changed() => {},
            }
            if backoff < cap {
                backoff *= 2;
            }
        }
    }
}

// ShardServer RPC handlers
impl ShardServer {
    /// Routes one decoded request frame to its handler.
    pub(crate) async fn dispatch(
        &self,
        req: Request,
    ) -> Result<Reply, ShardsetError> {
        Ok(match req {
            Request::Get(args) => Reply::Get(self.handle_get(args).await?),
            Request::PutAppend(args) => {
                Reply::PutAppend(self.handle_put_append(args).await?)
            }
            Request::Update(args) => {
                Reply::Update(self.handle_update(args).await?)
            }
            Request::Recover => {
                Reply::Recover(Box::new(self.handle_recover().await?))
            }
        })
    }

    /// Handler of client Get requests.
    async fn handle_get(
        &self,
        args: GetArgs,
    ) -> Result<GetReply, ShardsetError> {
        {
            let core = self.core.lock().await;
            if args.shard >= NUM_SHARDS
                || core.config.num != args.config_num
                || !core.serves(self.gid, args.shard)
            {
                return Ok(GetReply {
                    err: ErrCode::WrongGroup,
                    value: String::new(),
                });
            }
        }

        self.propose(Op::Get {
            key: args.key.clone(),
            client: args.client,
            seq: args.seq,
            shard: args.shard,
            config_num: args.config_num,
        })
        .await?;

        let core = self.core.lock().await;
        // the configuration may have moved while the proposal was in
        // flight; answering from a shard we no longer own would be wrong
        if core.config.num != args.config_num
            || !core.serves(self.gid, args.shard)
        {
            return Ok(GetReply {
                err: ErrCode::WrongGroup,
                value: String::new(),
            });
        }
        Ok(match core.shards[args.shard].database.get(&args.key) {
            Some(value) => GetReply {
                err: ErrCode::Ok,
                value: value.clone(),
            },
            None => GetReply {
                err: ErrCode::NoKey,
                value: String::new(),
            },
        })
    }

    /// Handler of client Put and Append requests.
    async fn handle_put_append(
        &self,
        args: PutAppendArgs,
    ) -> Result<PutAppendReply, ShardsetError> {
        {
            let core = self.core.lock().await;
            if args.shard >= NUM_SHARDS
                || core.config.num != args.config_num
                || !core.serves(self.gid, args.shard)
            {
                return Ok(PutAppendReply {
                    err: ErrCode::WrongGroup,
                });
            }
            if core.shards[args.shard].seen(args.client, args.seq) {
                // retried request whose effect is already in
                return Ok(PutAppendReply { err: ErrCode::Ok });
            }
        }

        let op = match args.kind {
            PutKind::Put => Op::Put {
                key: args.key,
                value: args.value,
                client: args.client,
                seq: args.seq,
                shard: args.shard,
                config_num: args.config_num,
            },
            PutKind::Append => Op::Append {
                key: args.key,
                value: args.value,
                client: args.client,
                seq: args.seq,
                shard: args.shard,
                config_num: args.config_num,
            },
        };
        self.propose(op).await?;

        let core = self.core.lock().await;
        // if the shard moved (or began its handoff) while the proposal was
        // in flight, the write may have missed the shipped snapshot; make
        // the client retry at the new owner, whose dedup table settles
        // whether the effect already travelled
        if core.config.num != args.config_num
            || !core.serves(self.gid, args.shard)
        {
            return Ok(PutAppendReply {
                err: ErrCode::WrongGroup,
            });
        }
        Ok(PutAppendReply { err: ErrCode::Ok })
    }

    /// Handler of peer shard handoffs.
    async fn handle_update(
        &self,
        args: UpdateArgs,
    ) -> Result<UpdateReply, ShardsetError> {
        {
            let core = self.core.lock().await;
            if args.shard >= NUM_SHARDS {
                return Ok(UpdateReply {
                    err: ErrCode::WrongGroup,
                });
            }
            if core.shards[args.shard].handed_off(args.sender, args.seq) {
                // duplicate transfer
                return Ok(UpdateReply { err: ErrCode::Ok });
            }
            if core.config.num != args.config_num {
                // sender is ahead or behind; it will retry
                return Ok(UpdateReply {
                    err: ErrCode::WrongGroup,
                });
            }
        }

        self.propose(Op::Update {
            shard: args.shard,
            config_num: args.config_num,
            database: args.database,
            max_client_seq: args.max_client_seq,
            sender: args.sender,
            seq: args.seq,
        })
        .await?;
        Ok(UpdateReply { err: ErrCode::Ok })
    }

    /// Handler of peer recovery snapshot requests.
    async fn handle_recover(&self) -> Result<RecoverReply, ShardsetError> {
        let core = self.core.lock().await;
        Ok(RecoverReply {
            shards: core.shards.clone(),
            config: core.config.clone(),
            last_applied: core.last_applied,
            received: core.received.clone(),
        })
    }
}

//! Reconfiguration: the periodic tick that detects the next configuration,
//! ships shards this group is losing, gates on shards it is gaining, and
//! advances one configuration at a time.

use std::sync::Arc;

use crate::master::{Config, NUM_SHARDS};
use crate::server::external::{call, ErrCode, Reply, Request, UpdateArgs};
use crate::server::replica::ShardServer;
use crate::server::statemach::{Op, ShardState};
use crate::utils::ShardsetError;

use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Periodic reconfiguration poller task of one replica.
pub(crate) async fn ticker_task(
    server: Arc<ShardServer>,
    tx_fatal: mpsc::UnboundedSender<ShardsetError>,
) {
    let mut rx_term = server.term_watch();
    let mut interval =
        time::interval(Duration::from_millis(server.params.tick_interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = server.tick().await {
                    if !*rx_term.borrow() {
                        let _ = tx_fatal.send(e);
                    }
                    return;
                }
            },

            _ = rx_term.changed() => return,
        }
    }
}

// ShardServer reconfiguration logic
impl ShardServer {
    /// One reconfiguration tick: if the shard master has published the next
    /// configuration, drive this group's side of the transition. At most one
    /// configuration is crossed per tick; an incomplete transition leaves
    /// the replica at the current configuration for the next tick to retry.
    pub(crate) async fn tick(&self) -> Result<(), ShardsetError> {
        let cur_num = {
            let core = self.core.lock().await;
            core.config.num
        };
        let new_config = match self.master.query(Some(cur_num + 1)).await {
            Ok(config) => config,
            Err(e) => {
                pf_warn!(self.me; "error querying shard master: {}", e);
                return Ok(());
            }
        };
        if new_config.num != cur_num + 1 {
            return Ok(()); // no newer configuration published
        }

        // classify this group's role for each shard in the transition, and
        // stop serving the shards being handed off right away: a write
        // accepted past this point could commit after the shipped snapshot
        // was taken and would be lost when the shard is zeroed
        let (produced, consumed) = {
            let mut core = self.core.lock().await;
            if core.config.num != cur_num {
                return Ok(());
            }
            let mut produced = Vec::new();
            let mut consumed = Vec::new();
            for shard in 0..NUM_SHARDS {
                let old_owner = core.config.shards[shard];
                let new_owner = new_config.shards[shard];
                if old_owner == self.gid && new_owner != self.gid {
                    produced.push(shard);
                }
                if old_owner != 0
                    && old_owner != self.gid
                    && new_owner == self.gid
                {
                    consumed.push(shard);
                }
            }
            core.producing = produced.iter().copied().collect();
            (produced, consumed)
        };

        if !produced.is_empty() || !consumed.is_empty() {
            // land a fresh slot first, so that every replica of this group
            // has absorbed all writes committed under the old configuration
            // before any state is shipped or gated on
            self.propose(Op::Noop).await?;
        }

        for &shard in &produced {
            let args = {
                let core = self.core.lock().await;
                UpdateArgs {
                    shard,
                    config_num: cur_num,
                    database: core.shards[shard].database.clone(),
                    max_client_seq: core.shards[shard].max_client_seq.clone(),
                    sender: self.gid,
                    seq: cur_num,
                }
            };
            if !self.ship_shard(args, &new_config).await? {
                return Ok(()); // shutting down
            }
        }

        if !consumed.is_empty() {
            let core = self.core.lock().await;
            if core.config.num != cur_num {
                return Ok(());
            }
            // a shard counts as acquired if its install was tracked this
            // transition, or if the handoff table durably records the
            // donor's handoff for this configuration (the install may have
            // been applied while this replica was still catching up behind)
            let acquired = |&shard: &usize| {
                let donor = core.config.shards[shard];
                core.received.contains(&shard)
                    || core.shards[shard]
                        .handoff
                        .get(&donor)
                        .copied()
                        .unwrap_or(0)
                        >= cur_num
            };
            if !consumed.iter().all(acquired) {
                pf_debug!(self.me; "transition {} -> {} still awaiting shards",
                                   cur_num, new_config.num);
                return Ok(());
            }
        }

        // transition complete: install the new configuration durably, then
        // drop the shipped shards. A crash in between leaves stale records
        // for shards no longer owned, which are never served and are
        // replaced wholesale if the shard ever comes back; the reverse
        // order could leave an owned shard with its record already gone.
        let mut core = self.core.lock().await;
        if core.config.num != cur_num {
            return Ok(());
        }
        core.config = new_config;
        core.received.clear();
        core.producing.clear();
        core.persist_meta().await?;
        for &shard in &produced {
            core.shards[shard] = ShardState::default();
            core.store.wipe_shard(shard).await?;
        }
        pf_info!(self.me; "group {} advanced to config {}",
                          self.gid, core.config.num);
        Ok(())
    }

    /// Ships one shard to its next owner group, retrying rounds across the
    /// destination replica set until one acknowledges. `WrongGroup` means
    /// the destination has not reached this configuration yet; keep trying.
    /// Returns `false` if the replica shut down before an acknowledgment.
    async fn ship_shard(
        &self,
        args: UpdateArgs,
        new_config: &Config,
    ) -> Result<bool, ShardsetError> {
        let shard = args.shard;
        let dest = new_config.shards[shard];
        let req = Request::Update(args);
        let timeout = Duration::from_millis(self.params.call_timeout_ms);
        let mut rx_term = self.term_watch();

        loop {
            if let Some(servers) = new_config.groups.get(&dest) {
                for &srv in servers {
                    match call(srv, &req, timeout).await {
                        Ok(Reply::Update(reply))
                            if reply.err == ErrCode::Ok
                                || reply.err == ErrCode::NoKey =>
                        {
                            pf_debug!(self.me; "shipped shard {} to group {} via {}",
                                               shard, dest, srv);
                            return Ok(true);
                        }
                        Ok(_) => {} // WrongGroup; try the next server
                        Err(_) => {} // no reply; try the next server
                    }
                }
            }
            if *rx_term.borrow() {
                return Ok(false);
            }
            tokio::select! {
                _ = time::sleep(Duration::from_millis(self.params.ship_retry_ms)) => {},
                _ = rx_term.changed() => return Ok(false),
            }
        }
    }
}

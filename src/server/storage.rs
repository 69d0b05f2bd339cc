//! Durable shard store: one record file per shard holding that shard's
//! database and dedup tables as a single unit, plus the replica meta
//! record, all written with temp file + atomic rename. A reader after any
//! crash observes either the old record or the new, never a torn one — in
//! particular, an op's effect never reaches disk without its dedup entry,
//! so re-applying the op from the log after a restart is a no-op.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::master::Config;
use crate::server::statemach::ShardState;
use crate::utils::ShardsetError;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Replica-wide durable record: everything outside the per-shard records
/// that must survive a crash.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct Meta {
    /// Current configuration.
    pub(crate) config: Config,

    /// Highest consensus slot whose op has been applied.
    pub(crate) last_applied: u64,

    /// Shards already ingested from donor groups in the current transition.
    pub(crate) received: HashSet<usize>,
}

/// Durable store rooted at one replica's data directory.
#[derive(Debug, Clone)]
pub(crate) struct FileStore {
    /// Root directory of this replica's files.
    dir: PathBuf,

    /// Whether to `fdatasync()` file contents before the atomic rename.
    sync: bool,
}

impl FileStore {
    pub(crate) fn new(dir: &Path, sync: bool) -> Self {
        FileStore {
            dir: dir.to_path_buf(),
            sync,
        }
    }

    /// Creates the root directory if missing.
    pub(crate) async fn prepare(&self) -> Result<(), ShardsetError> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    fn shard_path(&self, shard: usize) -> PathBuf {
        self.dir.join(format!("shard-{}", shard))
    }

    fn shard_temp_path(&self, shard: usize) -> PathBuf {
        self.dir.join(format!("temp-shard-{}", shard))
    }

    /// Writes `bytes` to `temp`, then atomically renames it to `dest`.
    async fn write_atomic(
        &self,
        temp: &Path,
        dest: &Path,
        bytes: &[u8],
    ) -> Result<(), ShardsetError> {
        let mut file = File::create(temp).await?;
        file.write_all(bytes).await?;
        if self.sync {
            file.sync_data().await?;
        }
        drop(file);
        fs::rename(temp, dest).await?;
        Ok(())
    }

    /// Rewrites one shard's record. The database and the dedup tables land
    /// on disk together or not at all.
    pub(crate) async fn write_shard(
        &self,
        shard: usize,
        state: &ShardState,
    ) -> Result<(), ShardsetError> {
        let bytes = encode_to_vec(state)?;
        self.write_atomic(
            &self.shard_temp_path(shard),
            &self.shard_path(shard),
            &bytes,
        )
        .await
    }

    /// Reads one shard's record back; an absent file reads as the empty
    /// shard. Leftover `temp-*` debris from an interrupted write is never
    /// consulted.
    pub(crate) async fn read_shard(
        &self,
        shard: usize,
    ) -> Result<ShardState, ShardsetError> {
        let path = self.shard_path(shard);
        if !fs::try_exists(&path).await? {
            return Ok(ShardState::default());
        }
        let bytes = fs::read(&path).await?;
        Ok(decode_from_slice(&bytes)?)
    }

    /// Removes a shard's record (and any temp debris), leaving the empty
    /// shard on disk.
    pub(crate) async fn wipe_shard(&self, shard: usize) -> Result<(), ShardsetError> {
        for path in [self.shard_path(shard), self.shard_temp_path(shard)] {
            if fs::try_exists(&path).await? {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    /// Rewrites the replica meta record.
    pub(crate) async fn write_meta(&self, meta: &Meta) -> Result<(), ShardsetError> {
        let bytes = encode_to_vec(meta)?;
        let temp = self.dir.join("meta.tmp");
        let dest = self.dir.join("meta");
        self.write_atomic(&temp, &dest, &bytes).await
    }

    /// Reads the replica meta record, or `None` if it does not exist (first
    /// boot, or a restart after disk loss).
    pub(crate) async fn read_meta(&self) -> Result<Option<Meta>, ShardsetError> {
        let path = self.dir.join("meta");
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        Ok(Some(decode_from_slice(&bytes)?))
    }
}

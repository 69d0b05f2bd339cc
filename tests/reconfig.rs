//! End-to-end reconfiguration tests: groups joining, leaving, and churning
//! while clients keep issuing operations.

mod common;

use std::sync::Arc;

use common::{config_with, pause_ms, TestGroup};
use shardset::{Clerk, LocalMaster, ShardsetError, NUM_SHARDS};

/// Shard ownership split: the first `boundary` shards to group 1, the rest
/// to group 2.
fn split_at(boundary: usize) -> [u64; NUM_SHARDS] {
    let mut shards = [1; NUM_SHARDS];
    for owner in shards.iter_mut().skip(boundary) {
        *owner = 2;
    }
    shards
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_moves_shards() -> Result<(), ShardsetError> {
    let master = Arc::new(LocalMaster::new());
    let mut g1 = TestGroup::launch("join", 1, 2, 42000, &master).await?;
    master
        .publish(config_with(1, [1; NUM_SHARDS], &[&g1]))
        .await?;

    // keys chosen to land on ten distinct shards
    let keys = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
    let mut ck = Clerk::new_and_setup(master.clone(), None)?;
    for (idx, key) in keys.iter().enumerate() {
        ck.put(key, &format!("v{}", idx)).await?;
    }

    // a second group joins and takes half the shards; the client keeps
    // writing right through the handoff
    let mut g2 = TestGroup::launch("join", 2, 2, 42050, &master).await?;
    master
        .publish(config_with(2, split_at(5), &[&g1, &g2]))
        .await?;
    for key in keys.iter() {
        ck.append(key, "+").await?;
    }

    // every key previously put is retrievable exactly once via its new owner
    for (idx, key) in keys.iter().enumerate() {
        assert_eq!(ck.get(key).await?, Some(format!("v{}+", idx)));
    }

    g1.stop_all();
    g2.stop_all();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leave_drains_group() -> Result<(), ShardsetError> {
    let master = Arc::new(LocalMaster::new());
    let mut g1 = TestGroup::launch("leave", 1, 2, 42100, &master).await?;
    let mut g2 = TestGroup::launch("leave", 2, 2, 42150, &master).await?;
    master
        .publish(config_with(1, split_at(5), &[&g1, &g2]))
        .await?;

    let keys = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
    let mut ck = Clerk::new_and_setup(master.clone(), None)?;
    for (idx, key) in keys.iter().enumerate() {
        ck.put(key, &format!("v{}", idx)).await?;
    }

    // group 1 leaves; everything it owned migrates to group 2
    master
        .publish(config_with(2, [2; NUM_SHARDS], &[&g2]))
        .await?;

    for (idx, key) in keys.iter().enumerate() {
        assert_eq!(ck.get(key).await?, Some(format!("v{}", idx)));
    }

    // group 1 is drained by now; stopping it must not lose anything
    pause_ms(200).await;
    g1.stop_all();
    for (idx, key) in keys.iter().enumerate() {
        assert_eq!(ck.get(key).await?, Some(format!("v{}", idx)));
        ck.append(key, "!").await?;
        assert_eq!(ck.get(key).await?, Some(format!("v{}!", idx)));
    }

    g2.stop_all();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn churn_preserves_appends() -> Result<(), ShardsetError> {
    let master = Arc::new(LocalMaster::new());
    let mut g1 = TestGroup::launch("churn", 1, 2, 42200, &master).await?;
    let mut g2 = TestGroup::launch("churn", 2, 2, 42250, &master).await?;
    master
        .publish(config_with(1, [1; NUM_SHARDS], &[&g1]))
        .await?;

    // bounce shard ownership back and forth while a client appends
    let plan = [
        config_with(2, split_at(3), &[&g1, &g2]),
        config_with(3, [2; NUM_SHARDS], &[&g1, &g2]),
        config_with(4, split_at(7), &[&g1, &g2]),
        config_with(5, [1; NUM_SHARDS], &[&g1, &g2]),
    ];
    let publisher_master = master.clone();
    let publisher = tokio::spawn(async move {
        for config in plan {
            pause_ms(150).await;
            publisher_master.publish(config).await?;
        }
        Ok::<(), ShardsetError>(())
    });

    let mut ck = Clerk::new_and_setup(master.clone(), None)?;
    let mut expected = String::new();
    for round in 0..24 {
        let piece = format!("p{};", round);
        ck.append("a", &piece).await?;
        expected.push_str(&piece);
        pause_ms(25).await;
    }
    publisher.await??;

    // final value is the concatenation of every unique payload, in order
    assert_eq!(ck.get("a").await?, Some(expected));

    g1.stop_all();
    g2.stop_all();
    Ok(())
}

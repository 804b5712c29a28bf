//! Tier rebalancing against a real libSQL database

mod common;

use chrono::Duration;
use common::{create_test_storage, seed_memories, FaultyStore};
use std::sync::Arc;
use tagmaker_core::{
    evolution::{tiering, BackgroundScheduler, EvolutionConfig, TieringConfig},
    JobMetrics, TagMetricsRecord, TagStore, Tier, TieringRebalancer,
};

#[tokio::test]
async fn test_hot_tag_is_promoted_with_fan_out() {
    let (storage, _dir) = create_test_storage().await;
    // 10 uses today: 10 / ln 2 ≈ 14.4
    let memories = seed_memories(&storage, "rust", 10, Duration::zero()).await;

    let metrics = JobMetrics::new();
    let rebalancer = TieringRebalancer::new(storage.clone(), &EvolutionConfig::default(), metrics.clone());
    let report = rebalancer.rebalance_all().await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.rebalanced, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(metrics.tags_rebalanced().await, 1);

    assert_eq!(storage.tag_tier("rust").await.unwrap(), Some(Tier::Hot.as_i64()));
    for memory in &memories {
        assert_eq!(storage.memory_tier(&memory.id).await.unwrap(), Some((1, 1)));
    }
}

#[tokio::test]
async fn test_warm_tag_is_left_alone() {
    let (storage, _dir) = create_test_storage().await;
    // 2 uses today: 2 / ln 2 ≈ 2.885
    let memories = seed_memories(&storage, "go", 2, Duration::zero()).await;

    let rebalancer = TieringRebalancer::new(storage.clone(), &EvolutionConfig::default(), JobMetrics::new());
    let report = rebalancer.rebalance_all().await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.rebalanced, 0);
    assert_eq!(storage.tag_tier("go").await.unwrap(), None);
    assert_eq!(storage.memory_tier(&memories[0].id).await.unwrap(), Some((2, 0)));
}

#[tokio::test]
async fn test_old_tag_goes_cold() {
    let (storage, _dir) = create_test_storage().await;
    let memories = seed_memories(&storage, "cobol", 1, Duration::days(400)).await;

    let rebalancer = TieringRebalancer::new(storage.clone(), &EvolutionConfig::default(), JobMetrics::new());
    let report = rebalancer.rebalance_all().await.unwrap();

    assert_eq!(report.rebalanced, 1);
    assert_eq!(storage.tag_tier("cobol").await.unwrap(), Some(3));
    assert_eq!(storage.memory_tier(&memories[0].id).await.unwrap(), Some((3, 1)));
}

#[tokio::test]
async fn test_recent_promotion_boosts_into_hot() {
    let (storage, _dir) = create_test_storage().await;
    // 3 uses today: 3 / ln 2 ≈ 4.33 (warm), boosted ≈ 6.49 (hot)
    let memories = seed_memories(&storage, "sql", 3, Duration::zero()).await;
    storage
        .mark_promoted(&memories[0].id, chrono::Utc::now())
        .await
        .unwrap();

    let rebalancer = TieringRebalancer::new(storage.clone(), &EvolutionConfig::default(), JobMetrics::new());
    rebalancer.rebalance_all().await.unwrap();

    assert_eq!(storage.tag_tier("sql").await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_paginates_every_tag_and_is_idempotent() {
    let (storage, _dir) = create_test_storage().await;
    for tag in ["a", "b", "c", "d", "e"] {
        seed_memories(&storage, tag, 1, Duration::days(400)).await;
    }

    let config = EvolutionConfig {
        tiering: TieringConfig { page_size: 2 },
        ..EvolutionConfig::default()
    };
    let rebalancer = TieringRebalancer::new(storage.clone(), &config, JobMetrics::new());

    let first = rebalancer.rebalance_all().await.unwrap();
    assert_eq!(first.processed, 5);
    assert_eq!(first.rebalanced, 5);

    let second = rebalancer.rebalance_all().await.unwrap();
    assert_eq!(second.processed, 5);
    assert_eq!(second.rebalanced, 0);
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let (storage, _dir) = create_test_storage().await;
    seed_memories(&storage, "rust", 10, Duration::zero()).await;

    let broken = TagMetricsRecord {
        tag: "broken".to_string(),
        use_count: Some(4),
        created_at: Some("not a date".to_string()),
        last_used_at: None,
        last_promoted_at: None,
        tier: Some(2),
    };
    let store: Arc<dyn TagStore> = Arc::new(FaultyStore::new(storage.clone()).inject_record(broken));

    let rebalancer = TieringRebalancer::new(store, &EvolutionConfig::default(), JobMetrics::new());
    let report = rebalancer.rebalance_all().await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.rebalanced, 1);
    assert_eq!(storage.tag_tier("rust").await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_stale_tier_write_is_rejected() {
    let (storage, _dir) = create_test_storage().await;
    let memories = seed_memories(&storage, "rust", 10, Duration::zero()).await;

    // Another sweep lands a Cold write between our read and our write
    let store: Arc<dyn TagStore> =
        Arc::new(FaultyStore::new(storage.clone()).interleave_tier("rust", Tier::Cold));

    let rebalancer = TieringRebalancer::new(store, &EvolutionConfig::default(), JobMetrics::new());
    let report = rebalancer.rebalance_all().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.rebalanced, 0);
    assert_eq!(storage.tag_tier("rust").await.unwrap(), Some(3));
    assert_eq!(storage.memory_tier(&memories[0].id).await.unwrap(), Some((3, 1)));
}

#[tokio::test]
async fn test_failed_tier_write_does_not_stop_the_sweep() {
    let (storage, _dir) = create_test_storage().await;
    seed_memories(&storage, "a", 1, Duration::days(400)).await;
    let memories = seed_memories(&storage, "b", 1, Duration::days(400)).await;

    let store: Arc<dyn TagStore> = Arc::new(FaultyStore::new(storage.clone()).failing_tier("a"));
    let rebalancer = TieringRebalancer::new(store, &EvolutionConfig::default(), JobMetrics::new());
    let report = rebalancer.rebalance_all().await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.rebalanced, 1);
    assert_eq!(storage.tag_tier("a").await.unwrap(), None);
    assert_eq!(storage.tag_tier("b").await.unwrap(), Some(3));
    assert_eq!(storage.memory_tier(&memories[0].id).await.unwrap(), Some((3, 1)));
}

#[tokio::test]
async fn test_stalled_tier_write_times_out() {
    let (storage, _dir) = create_test_storage().await;
    seed_memories(&storage, "a", 1, Duration::days(400)).await;

    let config = EvolutionConfig {
        storage_timeout: std::time::Duration::from_millis(50),
        ..EvolutionConfig::default()
    };
    let store: Arc<dyn TagStore> = Arc::new(
        FaultyStore::new(storage.clone()).slow_tier(std::time::Duration::from_millis(500)),
    );
    let rebalancer = TieringRebalancer::new(store, &config, JobMetrics::new());
    let report = rebalancer.rebalance_all().await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.rebalanced, 0);
}

#[tokio::test]
async fn test_unreachable_store_fails_the_sweep() {
    let (storage, _dir) = create_test_storage().await;

    let store: Arc<dyn TagStore> = Arc::new(FaultyStore::new(storage).unreachable());
    let rebalancer = TieringRebalancer::new(store, &EvolutionConfig::default(), JobMetrics::new());

    assert!(rebalancer.rebalance_all().await.is_err());
}

#[tokio::test]
async fn test_scheduler_trigger_runs_rebalance() {
    let (storage, _dir) = create_test_storage().await;
    seed_memories(&storage, "rust", 10, Duration::zero()).await;

    let config = EvolutionConfig::default();
    let mut scheduler = BackgroundScheduler::new(config.clone());
    scheduler.register_job(Arc::new(TieringRebalancer::new(
        storage.clone(),
        &config,
        JobMetrics::new(),
    )));

    let report = scheduler.trigger(tiering::JOB_NAME).await.unwrap();
    assert_eq!(report.items_processed, 1);
    assert_eq!(report.changes_made, 1);

    let history = scheduler.get_job_history(Some(tiering::JOB_NAME), 5).await;
    assert_eq!(history.len(), 1);
}

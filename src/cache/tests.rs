use super::*;
use crate::driver::fault::Fault;
use crate::driver::DriverErrorKind;
use crate::pool::PoolConfig;
use crate::testing::Fixture;

async fn setup(config: CacheConfig) -> (Fixture, ResultCache) {
    let fx = Fixture::new(PoolConfig::new().min_connections(1).max_connections(4)).await;
    fx.batch(
        "CREATE TABLE warnings (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL, reason TEXT);
         INSERT INTO warnings (user_id, reason) VALUES (1, 'spam'), (1, 'caps'), (2, 'links');",
    )
    .await;
    let cache = ResultCache::new(fx.engine.clone(), config.sweep_interval(Duration::ZERO), fx.events.clone());
    (fx, cache)
}

const BY_USER: &str = "SELECT id, reason FROM warnings WHERE user_id = ? ORDER BY id";

mod reads {
    use super::*;

    #[tokio::test]
    async fn test_second_identical_read_is_served_from_cache() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        let before = fx.plan.executions();

        let first = cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await.unwrap();
        let second = cache
            .cached_fetch("SELECT id, reason\n  FROM warnings\n  WHERE user_id = ?  ORDER BY id", &[Value::Int(1)], None, true)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.plan.executions() - before, 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.total_requests), (1, 1, 2));
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_different_params_are_different_entries() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        let before = fx.plan.executions();

        let one = cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await.unwrap();
        let two = cache.cached_fetch(BY_USER, &[Value::Int(2)], None, true).await.unwrap();
        assert_eq!(one.len(), 2);
        assert_eq!(two.len(), 1);
        assert_eq!(fx.plan.executions() - before, 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_bypass_skips_lookup_and_store() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        let before = fx.plan.executions();

        cache.cached_fetch(BY_USER, &[Value::Int(1)], None, false).await.unwrap();
        cache.cached_fetch(BY_USER, &[Value::Int(1)], None, false).await.unwrap();

        assert_eq!(fx.plan.executions() - before, 2);
        let stats = cache.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.bypassed, 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unkeyable_params_fall_back_to_direct_fetch() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        let before = fx.plan.executions();

        let rows = cache
            .cached_fetch("SELECT id FROM warnings WHERE ? IS NULL OR 1 = 1", &[Value::Float(f64::NAN)], None, true)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(fx.plan.executions() - before, 1);
        assert_eq!(cache.stats().bypassed, 1);
        assert_eq!(cache.stats().total_requests, 0);
        assert_eq!(fx.sink.count(EventKind::CacheFallback), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        fx.plan.push(Fault::Fail(DriverErrorKind::Authorization));

        let err = cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let rows = cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(cache.stats().misses, 2);
    }
}

mod eviction {
    use super::*;

    #[tokio::test]
    async fn test_capacity_two_evicts_least_recently_used() {
        let (fx, cache) = setup(CacheConfig::new().capacity(2)).await;
        assert_eq!(cache.shard_count(), 1);
        let sql = "SELECT ? AS n";
        let read = |n: i64| {
            let cache = cache.clone();
            async move { cache.cached_fetch(sql, &[Value::Int(n)], None, true).await.unwrap() }
        };
        let before = fx.plan.executions();

        read(1).await; // A miss
        read(2).await; // B miss
        read(1).await; // A hit, B is now least recently used
        read(3).await; // C miss, evicts B
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(fx.plan.executions() - before, 3);

        read(1).await; // A hit, survived C
        assert_eq!(fx.plan.executions() - before, 3);
        read(2).await; // B miss, evicts C
        assert_eq!(fx.plan.executions() - before, 4);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 4));
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.entries, 2);
        assert_eq!(fx.sink.count(EventKind::CacheEviction), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        let ttl = Some(Duration::from_millis(100));
        let before = fx.plan.executions();

        cache.cached_fetch(BY_USER, &[Value::Int(1)], ttl, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.cached_fetch(BY_USER, &[Value::Int(1)], ttl, true).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.evictions, 1);
        assert_eq!(fx.plan.executions() - before, 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_entries() {
        let (_fx, cache) = setup(CacheConfig::new()).await;

        cache
            .cached_fetch(BY_USER, &[Value::Int(1)], Some(Duration::from_millis(20)), true)
            .await
            .unwrap();
        cache
            .cached_fetch(BY_USER, &[Value::Int(2)], Some(Duration::from_secs(60)), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_background_sweeper_runs() {
        let fx = Fixture::new(PoolConfig::new()).await;
        let cache = ResultCache::new(
            fx.engine.clone(),
            CacheConfig::new().sweep_interval(Duration::from_millis(20)),
            fx.events.clone(),
        );

        cache
            .cached_fetch("SELECT 1", &[], Some(Duration::from_millis(10)), true)
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.is_empty());
        cache.shutdown();
    }

    #[test]
    fn test_shard_count_follows_capacity() {
        assert_eq!(CacheConfig::new().capacity(2).effective_shards(), 1);
        assert_eq!(CacheConfig::new().capacity(640).shards(16).effective_shards(), 10);
        assert_eq!(CacheConfig::new().capacity(100_000).shards(16).effective_shards(), 16);
        assert_eq!(CacheConfig::new().capacity(100_000).shards(0).effective_shards(), 1);
    }
}

mod invalidation {
    use super::*;

    #[tokio::test]
    async fn test_invalidate_removes_dependent_entries_only() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        fx.batch("CREATE TABLE guilds (id INTEGER PRIMARY KEY, name TEXT)").await;

        cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await.unwrap();
        cache.cached_fetch(BY_USER, &[Value::Int(2)], None, true).await.unwrap();
        cache.cached_fetch("SELECT * FROM guilds", &[], None, true).await.unwrap();
        assert_eq!(cache.len(), 3);

        // Case and schema qualifier are ignored
        assert_eq!(cache.invalidate("main.WARNINGS"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().invalidations, 2);
        assert_eq!(fx.sink.count(EventKind::CacheInvalidation), 1);

        assert_eq!(cache.invalidate("warnings"), 0);
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[tokio::test]
    async fn test_read_after_invalidation_sees_the_write() {
        let (fx, cache) = setup(CacheConfig::new()).await;

        let rows = cache.cached_fetch(BY_USER, &[Value::Int(2)], None, true).await.unwrap();
        assert_eq!(rows.len(), 1);

        fx.batch("INSERT INTO warnings (user_id, reason) VALUES (2, 'flood')").await;
        cache.invalidate("warnings");

        let rows = cache.cached_fetch(BY_USER, &[Value::Int(2)], None, true).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_declared_tables_are_used_for_invalidation() {
        let (_fx, cache) = setup(CacheConfig::new()).await;

        cache
            .cached_fetch_tagged("SELECT COUNT(*) FROM warnings", &[], None, &["leaderboard"])
            .await
            .unwrap();
        assert_eq!(cache.invalidate("warnings"), 0);
        assert_eq!(cache.invalidate("Leaderboard"), 1);
    }

    #[tokio::test]
    async fn test_fetch_overlapping_invalidation_is_not_stored() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        fx.plan.push(Fault::Delay(Duration::from_millis(100)));

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.invalidate("warnings");

        let rows = reader.await.unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidating_another_table_does_not_block_fill() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        fx.plan.push(Fault::Delay(Duration::from_millis(100)));

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.invalidate("guilds");

        reader.await.unwrap().unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_comma_join_is_invalidated_by_either_table() {
        let (fx, cache) = setup(CacheConfig::new()).await;
        fx.batch(
            "CREATE TABLE guilds (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO guilds (id, name) VALUES (1, 'old');",
        )
        .await;
        let sql = "SELECT g.name FROM warnings w, guilds g WHERE g.id = w.user_id AND w.id = 1";

        let before = cache.cached_fetch(sql, &[], None, true).await.unwrap();
        assert_eq!(before[0].get(0), Some(&Value::from("old")));

        fx.batch("UPDATE guilds SET name = 'new'").await;
        assert_eq!(cache.invalidate("guilds"), 1);

        let after = cache.cached_fetch(sql, &[], None, true).await.unwrap();
        assert_eq!(after[0].get(0), Some(&Value::from("new")));
    }

    #[tokio::test]
    async fn test_clear_keeps_counters() {
        let (_fx, cache) = setup(CacheConfig::new()).await;
        cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await.unwrap();
        cache.cached_fetch(BY_USER, &[Value::Int(1)], None, true).await.unwrap();

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_requests, 2);
    }
}

#[tokio::test]
async fn test_hits_plus_misses_equals_total_under_concurrency() {
    let (_fx, cache) = setup(CacheConfig::new().capacity(8)).await;

    let mut tasks = Vec::new();
    for i in 0..32_i64 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let user = i % 3;
            cache.cached_fetch(BY_USER, &[Value::Int(user)], None, i % 5 != 0).await.unwrap();
            if i % 7 == 0 {
                cache.invalidate("warnings");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.hits + stats.misses, stats.total_requests);
    assert_eq!(stats.total_requests + stats.bypassed, 32);
}

//! Batch processor behaviour: completeness, deadlines, retries, faults

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use batch_engine::batch::{BatchConfig, BatchError, BatchProcessor};
use batch_engine::config::PoolConfig;
use batch_engine::environment::RuntimeEnvironment;
use batch_engine::metrics::EngineMetrics;
use batch_engine::pool::WorkerPool;
use parking_lot::Mutex;
use prometheus::Registry;
use tokio::time::Instant;

fn processor(environment: RuntimeEnvironment, workers: usize, config: BatchConfig) -> BatchProcessor {
    let pool = Arc::new(WorkerPool::new(PoolConfig {
        max_workers: Some(workers),
        queue_capacity: Some(64),
        ..PoolConfig::for_environment(environment)
    }));
    BatchProcessor::new(pool, config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_items_succeed() {
    let processor = processor(RuntimeEnvironment::Local, 4, BatchConfig::default());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();

    let ids: Vec<String> = (0..100).map(|i| format!("record-{i}")).collect();
    let result = processor
        .process_batch(
            ids,
            move |_, _id| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.total_count, 100);
    assert_eq!(result.success_count, 100);
    assert_eq!(result.failed_count, 0);
    assert!(result.errors.is_empty());
    assert!(result.is_complete_success());
    assert_eq!(seen.load(Ordering::SeqCst), 100);
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_are_isolated_and_reported() {
    let processor = processor(RuntimeEnvironment::ManagedContainer, 4, BatchConfig::default());

    let items: Vec<u64> = (0..20).collect();
    let result = processor
        .process_batch(
            items,
            |_, n: u64| async move {
                if n % 5 == 0 {
                    Err(anyhow!("item {n} rejected"))
                } else {
                    Ok(())
                }
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 16);
    assert_eq!(result.failed_count, 4);
    assert_eq!(result.unaccounted(), 0);

    let mut failed: Vec<&str> = result.errors.keys().map(String::as_str).collect();
    failed.sort();
    assert_eq!(failed, vec!["0", "10", "15", "5"]);
    assert_eq!(result.errors["10"].to_string(), "item 10 rejected");
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_returns_partial_result() {
    let config = BatchConfig {
        timeout_buffer: Some(Duration::ZERO),
        chunk_size: Some(4),
        ..BatchConfig::default()
    };
    let processor = processor(RuntimeEnvironment::Local, 4, config);

    let started = Instant::now();
    let items: Vec<u64> = (0..40).collect();
    let err = processor
        .process_batch(
            items,
            |_, _| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            },
            Some(Instant::now() + Duration::from_millis(300)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(err, BatchError::Timeout { .. }));

    let partial = err.partial_result();
    assert_eq!(partial.total_count, 40);
    assert!(partial.success_count > 0, "some chunks finish before the deadline");
    assert!(partial.success_count < 40);
    assert_eq!(partial.success_count + partial.failed_count, 40);
    assert!(partial
        .errors
        .values()
        .any(|e| e.to_string().contains("insufficient time")));
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_cancels_in_flight_items() {
    let config = BatchConfig {
        timeout_buffer: Some(Duration::ZERO),
        ..BatchConfig::default()
    };
    let processor = processor(RuntimeEnvironment::Local, 2, config);
    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();

    let err = processor
        .process_batch(
            vec!["slow".to_string()],
            move |cancel, _| {
                let flag = flag.clone();
                async move {
                    cancel.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Err(anyhow!("cancelled"))
                }
            },
            Some(Instant::now() + Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BatchError::Timeout { .. }));
    assert_eq!(err.partial_result().failed_count, 1);

    tokio::time::timeout(Duration::from_secs(2), processor.pool().wait())
        .await
        .expect("cancelled item should finish");
    assert!(observed.load(Ordering::SeqCst));
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_reruns_only_failed_items() {
    let config = BatchConfig {
        retry_base_delay: Duration::from_millis(10),
        ..BatchConfig::default()
    };
    let processor = processor(RuntimeEnvironment::Local, 4, config);
    let calls: Arc<Mutex<HashMap<u64, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let tracker = calls.clone();

    let items: Vec<u64> = (0..10).collect();
    let result = processor
        .process_batch_with_retry(
            items,
            move |_, n: u64| {
                let attempt = {
                    let mut calls = tracker.lock();
                    let count = calls.entry(n).or_insert(0);
                    *count += 1;
                    *count
                };
                async move {
                    if n % 2 == 1 && attempt == 1 {
                        Err(anyhow!("transient failure for {n}"))
                    } else {
                        Ok(())
                    }
                }
            },
            3,
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 10);
    assert_eq!(result.failed_count, 0);
    assert_eq!(result.total_count, 10);
    assert_eq!(result.attempts, 2);

    let calls = calls.lock();
    assert_eq!(calls.values().sum::<u32>(), 15);
    assert_eq!(calls[&1], 2);
    assert_eq!(calls[&2], 1);
    drop(calls);
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_gives_up_after_max_attempts() {
    let config = BatchConfig {
        retry_base_delay: Duration::from_millis(5),
        ..BatchConfig::default()
    };
    let processor = processor(RuntimeEnvironment::Local, 2, config);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result = processor
        .process_batch_with_retry(
            vec!["ok".to_string(), "broken".to_string()],
            move |_, id: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if id == "broken" {
                        Err(anyhow!("permanent"))
                    } else {
                        Ok(())
                    }
                }
            },
            3,
        )
        .await
        .unwrap();

    assert_eq!(result.attempts, 3);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.failed_count, 1);
    assert!(result.errors.contains_key("broken"));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serverless_never_retries() {
    let processor = processor(RuntimeEnvironment::ConstrainedServerless, 2, BatchConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let items: Vec<u64> = (0..10).collect();
    let result = processor
        .process_batch_with_retry(
            items,
            move |_, n: u64| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 3 {
                        Err(anyhow!("bad record"))
                    } else {
                        Ok(())
                    }
                }
            },
            5,
        )
        .await
        .unwrap();

    assert_eq!(result.attempts, 1);
    assert_eq!(result.success_count, 9);
    assert_eq!(result.failed_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_item_is_unaccounted() {
    let processor = processor(RuntimeEnvironment::Local, 2, BatchConfig::default());

    let items: Vec<u64> = (0..6).collect();
    let result = processor
        .process_batch(
            items,
            |_, n: u64| async move {
                if n == 3 {
                    panic!("corrupt record {n}");
                }
                Ok(())
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 5);
    assert_eq!(result.failed_count, 0);
    assert_eq!(result.unaccounted(), 1);
    assert!(!result.is_complete_success());
    processor.pool().stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_stop_cancels_batch() {
    let processor = Arc::new(processor(RuntimeEnvironment::Local, 1, BatchConfig::default()));

    let running = processor.clone();
    let batch = tokio::spawn(async move {
        running
            .process_batch(
                (0..5).collect::<Vec<u64>>(),
                |cancel, _| async move {
                    cancel.cancelled().await;
                    Ok(())
                },
                None,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    processor.pool().stop().await;

    let err = batch.await.unwrap().unwrap_err();
    assert!(matches!(err, BatchError::Cancelled { .. }));
    let partial = err.into_partial_result();
    assert_eq!(partial.success_count, 1);
    assert_eq!(partial.failed_count, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_metrics_recorded() {
    let registry = Registry::new();
    let metrics = Arc::new(EngineMetrics::new(&registry).unwrap());
    let pool = Arc::new(WorkerPool::with_metrics(
        PoolConfig {
            max_workers: Some(2),
            ..PoolConfig::for_environment(RuntimeEnvironment::Local)
        },
        metrics.clone(),
    ));
    let processor = BatchProcessor::new(pool.clone(), BatchConfig::default());

    processor
        .process_batch((0..4).collect::<Vec<u64>>(), |_, _| async { Ok(()) }, None)
        .await
        .unwrap();

    let exported = metrics.export();
    assert!(exported.contains("batch_engine_batch_items_total"));
    assert!(exported.contains("batch_engine_batch_duration_seconds"));
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_interrupts_blocked_submission() {
    let pool = Arc::new(WorkerPool::new(PoolConfig {
        max_workers: Some(1),
        queue_capacity: Some(1),
        ..PoolConfig::for_environment(RuntimeEnvironment::Local)
    }));
    let config = BatchConfig {
        timeout_buffer: Some(Duration::from_secs(1)),
        ..BatchConfig::default()
    };
    let processor = BatchProcessor::new(pool.clone(), config);

    let started = Instant::now();
    let deadline = started + Duration::from_millis(1200);
    let err = processor
        .process_batch(
            (0..5).collect::<Vec<u64>>(),
            |cancel, _| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => Ok(()),
                    _ = cancel.cancelled() => Err(anyhow!("cancelled")),
                }
            },
            Some(deadline),
        )
        .await
        .unwrap_err();

    assert!(Instant::now() < deadline, "batch overran the caller deadline");
    assert!(started.elapsed() < Duration::from_millis(700));
    assert!(matches!(err, BatchError::Timeout { .. }));

    let partial = err.partial_result();
    assert_eq!(partial.success_count, 0);
    assert_eq!(partial.failed_count, 5);
    assert!(partial
        .errors
        .values()
        .any(|e| e.to_string().contains("insufficient time")));
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serverless_stops_scheduling_inside_min_window() {
    let config = BatchConfig {
        timeout_buffer: Some(Duration::ZERO),
        chunk_size: Some(2),
        ..BatchConfig::default()
    };
    let processor = processor(RuntimeEnvironment::ConstrainedServerless, 2, config);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    // First chunk starts with 5.3s left and ends inside the 5s window
    let started = Instant::now();
    let err = processor
        .process_batch(
            (0..6).collect::<Vec<u64>>(),
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok(())
                }
            },
            Some(Instant::now() + Duration::from_millis(5300)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(err, BatchError::Timeout { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let partial = err.partial_result();
    assert_eq!(partial.success_count, 2);
    assert_eq!(partial.failed_count, 4);
    assert_eq!(partial.errors.len(), 4);
    assert!(partial
        .errors
        .values()
        .all(|e| e.to_string() == "skipped: insufficient time before deadline"));
    processor.pool().stop().await;
}

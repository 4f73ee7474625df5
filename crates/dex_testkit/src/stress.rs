//! Load helpers.
//!
//! Drive a database with many concurrent callers and report throughput.

use dex_core::Database;
use serde_json::json;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let secs = duration.as_secs_f64();
        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second: if secs > 0.0 { total as f64 / secs } else { 0.0 },
        }
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per caller.
    pub operations: usize,
    /// Number of concurrent callers.
    pub callers: usize,
    /// Number of distinct keys.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            callers: 4,
            key_count: 100,
        }
    }
}

fn key(i: usize, config: &StressConfig) -> String {
    format!("stress:{}", i % config.key_count.max(1))
}

async fn tally(handles: Vec<tokio::task::JoinHandle<(usize, usize)>>) -> (usize, usize) {
    let mut totals = (0, 0);
    for handle in handles {
        let (ok, failed) = handle.await.unwrap_or((0, 0));
        totals.0 += ok;
        totals.1 += failed;
    }
    totals
}

/// Runs concurrent writers, each issuing `set`s one after another.
pub async fn stress_concurrent_writes(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let handles = (0..config.callers)
        .map(|caller| {
            let db = db.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let (mut ok, mut failed) = (0, 0);
                for i in 0..config.operations {
                    match db.set(key(i, &config), json!({ "caller": caller, "i": i })).await {
                        Ok(_) => ok += 1,
                        Err(_) => failed += 1,
                    }
                }
                (ok, failed)
            })
        })
        .collect();

    let (ok, failed) = tally(handles).await;
    StressTestResult::new(ok, failed, start.elapsed())
}

/// Runs concurrent readers mixing `get` and `exists`.
pub async fn stress_concurrent_reads(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let handles = (0..config.callers)
        .map(|_| {
            let db = db.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let (mut ok, mut failed) = (0, 0);
                for i in 0..config.operations {
                    let result = if i % 2 == 0 {
                        db.get(key(i, &config)).await.map(drop)
                    } else {
                        db.exists(key(i, &config)).await.map(drop)
                    };
                    match result {
                        Ok(()) => ok += 1,
                        Err(_) => failed += 1,
                    }
                }
                (ok, failed)
            })
        })
        .collect();

    let (ok, failed) = tally(handles).await;
    StressTestResult::new(ok, failed, start.elapsed())
}

/// Issues one batch of `operations` writes.
pub async fn stress_batch(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut batch = db.batch();
    for i in 0..config.operations {
        batch = batch.set(key(i, config), json!(i));
    }
    let (ok, failed) = match batch.end().await {
        Ok(outcomes) => (outcomes.len(), 0),
        Err(_) => (0, config.operations),
    };
    StressTestResult::new(ok, failed, start.elapsed())
}

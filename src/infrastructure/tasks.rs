//! Task Orchestration
//!
//! The two concurrency shapes used throughout the orchestrator:
//!
//! - fan-out-join: one concurrent task per item, wait for all, collect every
//!   failure (never just the first) and fail the aggregate naming each one;
//! - bounded worker pool: at most K workers pulling items from a shared
//!   cursor, results merged under a lock in input order.

use crate::error::{Error, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

/// Run every labeled future concurrently and wait for all of them. If any
/// failed, return an aggregate error naming each failed item; otherwise
/// return the values in input order.
pub async fn fan_out_join<T, F>(items: Vec<(String, F)>) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    let total = items.len();
    let (labels, futures): (Vec<_>, Vec<_>) = items.into_iter().unzip();
    let results = join_all(futures).await;

    let mut values = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (label, result) in labels.into_iter().zip(results) {
        match result {
            Ok(value) => values.push(value),
            Err(err) => failures.push(format!("{}: {}", label, err)),
        }
    }

    if failures.is_empty() {
        Ok(values)
    } else {
        Err(Error::Aggregate { total, failures })
    }
}

/// Map `f` over `items` with at most `workers` concurrent workers. Workers
/// pull from a shared cursor until it is exhausted; per-item results come
/// back in input order, failures included.
pub async fn bounded_map<T, R, F, Fut>(items: Vec<T>, workers: usize, f: F) -> Vec<Result<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let queue: Arc<Mutex<VecDeque<(usize, T)>>> =
        Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
    let results: Arc<Mutex<Vec<(usize, Result<R>)>>> =
        Arc::new(Mutex::new(Vec::with_capacity(total)));

    let workers = workers.clamp(1, total);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let results = results.clone();
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let next = queue.lock().pop_front();
                match next {
                    Some((index, item)) => {
                        let result = f(item).await;
                        results.lock().push((index, result));
                    }
                    None => break,
                }
            }
        }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!("worker task panicked: {}", err);
        }
    }

    let mut collected = match Arc::try_unwrap(results) {
        Ok(mutex) => mutex.into_inner(),
        Err(arc) => std::mem::take(&mut *arc.lock()),
    };
    collected.sort_by_key(|(index, _)| *index);
    collected.into_iter().map(|(_, result)| result).collect()
}

/// Fold labeled per-item results into a single outcome, aggregating every
/// failure by name.
pub fn aggregate<T>(pairs: Vec<(String, Result<T>)>) -> Result<Vec<T>> {
    let total = pairs.len();
    let mut values = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (label, result) in pairs {
        match result {
            Ok(value) => values.push(value),
            Err(err) => failures.push(format!("{}: {}", label, err)),
        }
    }
    if failures.is_empty() {
        Ok(values)
    } else {
        Err(Error::Aggregate { total, failures })
    }
}

//! ParallelDispatcher (§4.7): fan-out/fan-in over a bounded pool, with
//! pluggable collectors. Built on Tokio task fan-out guarded by a
//! `Semaphore` (§5), not an OS thread pool.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use terrastore_core::RouteError;

/// Runs `task` over every item in `sources` concurrently (bounded by
/// `concurrency`), cancelling the remaining in-flight tasks as soon as any
/// one fails, and returning the first error (§4.7 "cooperative cancellation").
///
/// # Errors
/// The first [`RouteError`] raised by any task; the rest are dropped.
pub async fn fan_out<T, P, F, Fut>(sources: Vec<T>, concurrency: usize, task: F) -> Result<Vec<P>, RouteError>
where
    T: Send + 'static,
    P: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P, RouteError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let task = Arc::new(task);
    let mut set = JoinSet::new();

    for item in sources {
        let semaphore = Arc::clone(&semaphore);
        let task = Arc::clone(&task);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            task(item).await
        });
    }

    let mut partials = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(partial)) => partials.push(partial),
            Ok(Err(route_error)) => {
                set.abort_all();
                return Err(route_error);
            }
            Err(join_error) => {
                set.abort_all();
                return Err(RouteError::communication(std::io::Error::other(join_error.to_string())));
            }
        }
    }
    Ok(partials)
}

/// Union collector (§4.7): concatenates partial maps, later write wins on
/// key collision. Used where keys are guaranteed disjoint by prior routing.
#[must_use]
pub fn union<K: Ord, V>(partials: Vec<BTreeMap<K, V>>) -> BTreeMap<K, V> {
    let mut merged = BTreeMap::new();
    for partial in partials {
        merged.extend(partial);
    }
    merged
}

/// Sorted-merge collector (§4.7): k-way merges already-sorted partials by
/// key, last write wins on collision (a stand-in for the general
/// `comparator`-driven merge; §3's only ordering requirement is the key).
#[must_use]
pub fn sorted_merge<K: Ord + Clone, V>(partials: Vec<Vec<(K, V)>>) -> Vec<(K, V)> {
    let mut merged: BTreeMap<K, V> = BTreeMap::new();
    for partial in partials {
        for (key, value) in partial {
            merged.insert(key, value);
        }
    }
    merged.into_iter().collect()
}

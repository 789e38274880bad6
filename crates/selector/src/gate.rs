//! Bounded fan-out for upstream I/O.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};

/// Cooperative cancellation signal shared between the scheduler and
/// in-flight work.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Worker-pool primitive bounding in-flight upstream calls per API class.
pub struct Gate {
    limit: usize,
}

impl Gate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Drive `worker` over every item with at most `limit` invocations in
    /// flight. Items are submitted in input order; results come back in the
    /// same positions. Worker errors are swallowed into `None` — workers log
    /// their own failures. Once `cancel` fires, unstarted items resolve to
    /// `None` without invoking the worker; in-flight workers finish normally.
    pub async fn run_all<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancelFlag,
        worker: F,
    ) -> Vec<Option<R>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        stream::iter(items)
            .map(|item| {
                // Submission-time check; map runs as the buffer pulls items.
                let fut = (!cancel.is_cancelled()).then(|| worker(item));
                async move {
                    match fut {
                        Some(f) => f.await.ok(),
                        None => None,
                    }
                }
            })
            .buffered(self.limit)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_all_preserves_positions_and_swallows_errors() {
        let gate = Gate::new(3);
        let cancel = CancelFlag::new();
        let results = gate
            .run_all((0..6).collect(), &cancel, |n: i64| async move {
                if n % 2 == 1 {
                    anyhow::bail!("odd items fail");
                }
                Ok(n * 10)
            })
            .await;
        assert_eq!(
            results,
            vec![Some(0), None, Some(20), None, Some(40), None]
        );
    }

    #[tokio::test]
    async fn test_run_all_never_exceeds_limit() {
        let gate = Gate::new(2);
        let cancel = CancelFlag::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let results = gate
            .run_all((0..10).collect(), &cancel, |_n: i64| {
                let in_flight = in_flight.clone();
                let high_water = high_water.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(Option::is_some));
        assert!(
            high_water.load(Ordering::SeqCst) <= 2,
            "more than `limit` workers ran at once"
        );
    }

    #[tokio::test]
    async fn test_run_all_skips_unstarted_items_after_cancel() {
        let gate = Gate::new(1);
        let cancel = CancelFlag::new();
        let cancel_inner = cancel.clone();

        // First worker cancels the cycle; with limit 1 every later item is
        // submitted after the flag flips.
        let results = gate
            .run_all((0..4).collect(), &cancel, |n: i64| {
                let cancel = cancel_inner.clone();
                async move {
                    cancel.cancel();
                    Ok(n)
                }
            })
            .await;

        assert_eq!(results, vec![Some(0), None, None, None]);
    }

    #[tokio::test]
    async fn test_run_all_empty_input() {
        let gate = Gate::new(4);
        let cancel = CancelFlag::new();
        let results: Vec<Option<i64>> = gate
            .run_all(Vec::new(), &cancel, |n: i64| async move { Ok(n) })
            .await;
        assert!(results.is_empty());
    }

    #[test]
    fn test_gate_limit_floor_is_one() {
        assert_eq!(Gate::new(0).limit(), 1);
        assert_eq!(Gate::new(5).limit(), 5);
    }
}

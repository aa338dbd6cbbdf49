use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Collapses bursts of change notifications into at most one trigger per
/// interval.
///
/// Any number of [`mark`](Coalescer::mark) calls between two checks produce a
/// single trigger. The delay is fixed, not fixed-rate: the next check is
/// scheduled only after the previous trigger has completed, so a slow
/// broadcast never builds up a backlog.
#[derive(Debug)]
pub struct Coalescer {
    dirty: AtomicBool,
    interval: Duration,
}

impl Coalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            dirty: AtomicBool::new(false),
            interval,
        }
    }

    pub fn mark(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Read and clear the dirty flag
    pub fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, mut trigger: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if self.take() {
                trigger().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_yields_single_trigger() {
        let coalescer = Arc::new(Coalescer::new(Duration::from_millis(3000)));
        let fired = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let handle = {
            let coalescer = coalescer.clone();
            let fired = fired.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                coalescer
                    .run(shutdown, || {
                        let fired = fired.clone();
                        async move {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                    .await;
            })
        };

        for _ in 0..50 {
            coalescer.mark();
        }
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!coalescer.is_dirty());

        // Nothing marked, nothing fired
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        coalescer.mark();
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn marks_during_slow_trigger_fold_into_next_cycle() {
        let coalescer = Arc::new(Coalescer::new(Duration::from_millis(100)));
        let fired = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let handle = {
            let coalescer = coalescer.clone();
            let fired = fired.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let marker = coalescer.clone();
                coalescer
                    .run(shutdown, move || {
                        let fired = fired.clone();
                        let marker = marker.clone();
                        async move {
                            fired.fetch_add(1, Ordering::SeqCst);
                            // Changes arriving while the broadcast is in flight
                            for _ in 0..10 {
                                marker.mark();
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    })
                    .await;
            })
        };

        coalescer.mark();
        // First trigger at 100ms runs until 1100ms; the next check is at 1200ms
        tokio::time::sleep(Duration::from_millis(1150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

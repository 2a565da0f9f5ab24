use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

type EdgeCallback = Box<dyn Fn() + Send + Sync>;

/// Counts in-flight requests against the chain indexer.
///
/// Every outbound request takes a [`RequestToken`]; the token is released
/// when the response (or failure) has been fully processed. The `on_start`
/// callback fires on the 0→1 edge, `on_done` on the 1→0 edge. Work that
/// schedules follow-up requests must take the follow-up tokens before
/// releasing its own, so the idle edge only fires once the transitive
/// closure of requests has settled.
pub struct Synchronizer {
    counter: watch::Sender<usize>,
    on_start: EdgeCallback,
    on_done: EdgeCallback,
}

impl Synchronizer {
    pub fn new(
        on_start: impl Fn() + Send + Sync + 'static,
        on_done: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (counter, _) = watch::channel(0);
        Arc::new(Self {
            counter,
            on_start: Box::new(on_start),
            on_done: Box::new(on_done),
        })
    }

    /// Take a token for an outbound request.
    pub fn inc_requests(self: &Arc<Self>) -> RequestToken {
        let mut started = false;
        self.counter.send_modify(|count| {
            started = *count == 0;
            *count += 1;
        });
        // Edges are detected under the channel lock but the callbacks run
        // outside of it.
        if started {
            (self.on_start)();
        }
        RequestToken {
            synchronizer: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// Wait until no requests are in flight. Returns immediately if the
    /// counter is already zero.
    pub async fn wait_idle(&self) {
        let mut receiver = self.counter.subscribe();
        receiver
            .wait_for(|count| *count == 0)
            .await
            .expect("sender lives as long as the synchronizer");
    }

    pub fn is_idle(&self) -> bool {
        *self.counter.borrow() == 0
    }

    fn release(&self) {
        let mut idle = false;
        self.counter.send_modify(|count| {
            *count = count
                .checked_sub(1)
                .expect("every release is paired with a prior inc");
            idle = *count == 0;
        });
        if idle {
            (self.on_done)();
        }
    }
}

/// Deferred release handle returned by [`Synchronizer::inc_requests`].
///
/// Releasing is idempotent; dropping an unreleased token releases it, so an
/// early-returning error path cannot wedge the barrier.
pub struct RequestToken {
    synchronizer: Arc<Synchronizer>,
    released: AtomicBool,
}

impl RequestToken {
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.synchronizer.release();
        }
    }
}

impl Drop for RequestToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_synchronizer() -> (Arc<Synchronizer>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let dones = Arc::new(AtomicUsize::new(0));
        let synchronizer = {
            let starts = starts.clone();
            let dones = dones.clone();
            Synchronizer::new(
                move || {
                    starts.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    dones.fetch_add(1, Ordering::SeqCst);
                },
            )
        };
        (synchronizer, starts, dones)
    }

    #[tokio::test]
    async fn edges_fire_once_per_busy_period() {
        let (synchronizer, starts, dones) = counting_synchronizer();

        let first = synchronizer.inc_requests();
        let second = synchronizer.inc_requests();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(dones.load(Ordering::SeqCst), 0);

        first.release();
        assert_eq!(dones.load(Ordering::SeqCst), 0);
        second.release();
        assert_eq!(dones.load(Ordering::SeqCst), 1);

        // A new busy period raises a fresh pair of edges.
        let third = synchronizer.inc_requests();
        third.release();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(dones.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (synchronizer, _, dones) = counting_synchronizer();

        let token = synchronizer.inc_requests();
        token.release();
        token.release();
        drop(token);

        assert_eq!(dones.load(Ordering::SeqCst), 1);
        assert!(synchronizer.is_idle());
    }

    #[tokio::test]
    async fn dropping_a_token_releases_it() {
        let (synchronizer, _, dones) = counting_synchronizer();

        {
            let _token = synchronizer.inc_requests();
        }

        assert!(synchronizer.is_idle());
        assert_eq!(dones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_idle() {
        let (synchronizer, _, _) = counting_synchronizer();

        tokio::time::timeout(Duration::from_secs(1), synchronizer.wait_idle())
            .await
            .expect("wait_idle on an idle synchronizer must not block");
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_all_tokens_are_released() {
        let (synchronizer, _, _) = counting_synchronizer();

        let token = synchronizer.inc_requests();
        let waiter = {
            let synchronizer = synchronizer.clone();
            tokio::spawn(async move { synchronizer.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        token.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake up on the idle edge")
            .unwrap();
    }
}

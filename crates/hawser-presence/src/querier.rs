use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::PresenceError;

/// Source of peer URLs for an agent id. A partial list may accompany an
/// error.
#[async_trait]
pub trait UrlQuerier: Send + Sync {
    async fn urls_by_agent_id(&self, agent_id: i64) -> (Vec<String>, Option<PresenceError>);
}

/// Shares one poll loop per agent id among all concurrent subscribers and
/// keeps the last observed URL list around after the subscribers leave.
///
/// A transient delegate error with no data preserves the cached list; a
/// successful empty poll clears it. Stopped contexts without a cached list
/// are evicted by the sweeper after `gc_period`.
pub struct AggregatingQuerier<Q: ?Sized> {
    delegate: Arc<Q>,
    poll_period: Duration,
    gc_period: Duration,
    contexts: Mutex<HashMap<i64, Arc<PollingContext>>>,
}

struct PollingContext {
    inner: Mutex<PcInner>,
}

struct PcInner {
    consumers: Vec<Consumer>,
    next_consumer_id: u64,
    urls: Option<Arc<Vec<String>>>,
    state: PollState,
}

enum PollState {
    Running { cancel: CancellationToken },
    Stopped { at: Instant },
}

struct Consumer {
    id: u64,
    tx: mpsc::Sender<Arc<Vec<String>>>,
    cancelled: CancellationToken,
}

impl<Q> AggregatingQuerier<Q>
where
    Q: UrlQuerier + ?Sized + 'static,
{
    pub fn new(delegate: Arc<Q>, poll_period: Duration, gc_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            delegate,
            poll_period,
            gc_period,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribes to the agent's peer URLs until `cancel` fires. `cb` runs
    /// on this task, once per non-empty poll result; the shared poll loop
    /// is started on the first subscriber and stopped when the last one
    /// leaves.
    pub async fn poll_urls_by_agent_id<F>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        agent_id: i64,
        mut cb: F,
    ) where
        F: FnMut(Arc<Vec<String>>),
    {
        let (tx, mut rx) = mpsc::channel(1);
        let (ctx, consumer_id) = self.subscribe(agent_id, tx, cancel.clone());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(urls) => cb(urls),
                    None => break,
                },
            }
        }
        self.unsubscribe(&ctx, consumer_id);
    }

    /// Last list observed by the agent's poll loop, if any. Does not start
    /// polling.
    pub fn cached_urls_by_agent_id(&self, agent_id: i64) -> Option<Arc<Vec<String>>> {
        let contexts = self.contexts.lock();
        contexts.get(&agent_id)?.inner.lock().urls.clone()
    }

    /// Runs the context sweeper until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.gc_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    fn subscribe(
        self: &Arc<Self>,
        agent_id: i64,
        tx: mpsc::Sender<Arc<Vec<String>>>,
        cancelled: CancellationToken,
    ) -> (Arc<PollingContext>, u64) {
        let mut contexts = self.contexts.lock();
        let ctx = contexts
            .entry(agent_id)
            .or_insert_with(|| {
                Arc::new(PollingContext {
                    inner: Mutex::new(PcInner {
                        consumers: Vec::new(),
                        next_consumer_id: 0,
                        urls: None,
                        state: PollState::Stopped { at: Instant::now() },
                    }),
                })
            })
            .clone();
        let mut inner = ctx.inner.lock();
        let id = inner.next_consumer_id;
        inner.next_consumer_id += 1;
        inner.consumers.push(Consumer { id, tx, cancelled });
        if let PollState::Stopped { .. } = inner.state {
            let cancel = CancellationToken::new();
            inner.state = PollState::Running { cancel: cancel.clone() };
            tokio::spawn(Self::poll_loop(self.clone(), ctx.clone(), agent_id, cancel));
        }
        drop(inner);
        (ctx, id)
    }

    fn unsubscribe(&self, ctx: &Arc<PollingContext>, consumer_id: u64) {
        // The registry lock orders this against a concurrent subscribe, so
        // a poll cannot be started for a context we are about to stop.
        let _contexts = self.contexts.lock();
        let mut inner = ctx.inner.lock();
        inner.consumers.retain(|c| c.id != consumer_id);
        if inner.consumers.is_empty() {
            if let PollState::Running { cancel } = &inner.state {
                cancel.cancel();
            }
            inner.state = PollState::Stopped { at: Instant::now() };
        }
    }

    async fn poll_loop(
        querier: Arc<Self>,
        ctx: Arc<PollingContext>,
        agent_id: i64,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(querier.poll_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let (urls, err) = querier.delegate.urls_by_agent_id(agent_id).await;
            if let Some(err) = err {
                tracing::warn!(agent_id, error = %err, "presence poll failed");
                if urls.is_empty() {
                    // Transient failure with no data: keep the cached list.
                    continue;
                }
            }
            let (value, consumers) = {
                let mut inner = ctx.inner.lock();
                if urls.is_empty() {
                    inner.urls = None;
                    continue;
                }
                let value = Arc::new(urls);
                inner.urls = Some(value.clone());
                let consumers: Vec<_> = inner
                    .consumers
                    .iter()
                    .map(|c| (c.tx.clone(), c.cancelled.clone()))
                    .collect();
                (value, consumers)
            };
            for (tx, cancelled) in consumers {
                // A consumer that left after the snapshot still gets a
                // send attempt; its context guards against blocking on it.
                tokio::select! {
                    _ = cancelled.cancelled() => {}
                    res = tx.send(value.clone()) => { let _ = res; }
                }
            }
        }
    }

    fn sweep(&self) {
        let gc_period = self.gc_period;
        let mut contexts = self.contexts.lock();
        contexts.retain(|_, ctx| {
            let inner = ctx.inner.lock();
            match &inner.state {
                PollState::Running { .. } => true,
                PollState::Stopped { at } => {
                    at.elapsed() < gc_period || inner.urls.is_some()
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Plays back `(urls, is_err)` entries, repeating the last one forever.
    struct ScriptedQuerier {
        polls: AtomicUsize,
        script: Mutex<Vec<(Vec<String>, bool)>>,
    }

    impl ScriptedQuerier {
        fn new(script: Vec<(Vec<String>, bool)>) -> Arc<Self> {
            Arc::new(Self {
                polls: AtomicUsize::new(0),
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl UrlQuerier for ScriptedQuerier {
        async fn urls_by_agent_id(&self, _agent_id: i64) -> (Vec<String>, Option<PresenceError>) {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            let (urls, is_err) = if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().cloned().unwrap_or((Vec::new(), false))
            };
            let err = is_err.then(|| PresenceError::TxAttemptsExceeded { attempts: 2 });
            (urls, err)
        }
    }

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn two_consumers_share_one_poll_loop() {
        let delegate = ScriptedQuerier::new(vec![(urls(&["https://p1"]), false)]);
        let q = AggregatingQuerier::new(delegate.clone(), Duration::from_secs(1), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let got_a = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move {
                let mut seen = Vec::new();
                q.poll_urls_by_agent_id(cancel, 7, |u| seen.push(u)).await;
                seen
            }
        });
        let got_b = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move {
                let mut seen = Vec::new();
                q.poll_urls_by_agent_id(cancel, 7, |u| seen.push(u)).await;
                seen
            }
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        let seen_a = got_a.await.unwrap();
        let seen_b = got_b.await.unwrap();
        assert!(!seen_a.is_empty());
        assert!(!seen_b.is_empty());
        assert_eq!(seen_a[0].as_slice(), &["https://p1".to_string()]);
        assert_eq!(seen_b[0].as_slice(), &["https://p1".to_string()]);
        // One shared loop: poll count tracks elapsed ticks, not consumers.
        assert!(delegate.polls.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn error_with_empty_list_preserves_cache() {
        let delegate = ScriptedQuerier::new(vec![
            (urls(&["https://p1"]), false),
            (Vec::new(), true),
        ]);
        let q = AggregatingQuerier::new(delegate, Duration::from_secs(1), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move { q.poll_urls_by_agent_id(cancel, 7, |_| ()).await }
        });
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(
            q.cached_urls_by_agent_id(7).as_deref(),
            Some(&urls(&["https://p1"]))
        );
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn successful_empty_poll_clears_cache() {
        let delegate = ScriptedQuerier::new(vec![
            (urls(&["https://p1"]), false),
            (Vec::new(), false),
        ]);
        let q = AggregatingQuerier::new(delegate, Duration::from_secs(1), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move { q.poll_urls_by_agent_id(cancel, 7, |_| ()).await }
        });
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(q.cached_urls_by_agent_id(7).is_none());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cache_survives_consumer_restart() {
        let delegate = ScriptedQuerier::new(vec![(urls(&["https://p1"]), false)]);
        let q = AggregatingQuerier::new(delegate, Duration::from_secs(1), Duration::from_secs(3600));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move { q.poll_urls_by_agent_id(cancel, 7, |_| ()).await }
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        handle.await.unwrap();

        // All consumers gone, the cached list remains until the sweeper's
        // grace period passes.
        assert_eq!(
            q.cached_urls_by_agent_id(7).as_deref(),
            Some(&urls(&["https://p1"]))
        );

        // A fresh subscriber sees the same list again after the restarted
        // poll's first cycle.
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move {
                let mut seen = Vec::new();
                q.poll_urls_by_agent_id(cancel, 7, |u| seen.push(u)).await;
                seen
            }
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        let seen = handle.await.unwrap();
        assert_eq!(seen[0].as_slice(), &["https://p1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_when_the_last_consumer_leaves() {
        let delegate = ScriptedQuerier::new(vec![(urls(&["https://p1"]), false)]);
        let q = AggregatingQuerier::new(delegate.clone(), Duration::from_secs(1), Duration::from_secs(3600));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move { q.poll_urls_by_agent_id(cancel, 7, |_| ()).await }
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let polls_at_stop = delegate.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(delegate.polls.load(Ordering::SeqCst), polls_at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_stopped_contexts_without_cache() {
        let delegate = ScriptedQuerier::new(vec![(Vec::new(), false)]);
        let q = AggregatingQuerier::new(delegate, Duration::from_secs(1), Duration::from_secs(10));

        let shutdown = CancellationToken::new();
        tokio::spawn(q.clone().run(shutdown.clone()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let q = q.clone();
            let cancel = cancel.clone();
            async move { q.poll_urls_by_agent_id(cancel, 7, |_| ()).await }
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(q.contexts.lock().contains_key(&7));

        // Past the GC period with no cached value, the context goes away.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!q.contexts.lock().contains_key(&7));
        shutdown.cancel();
    }
}

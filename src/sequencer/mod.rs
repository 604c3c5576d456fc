//! Per-key ordering of asynchronous actions.
//!
//! Two actions sharing at least one key run strictly in submission order;
//! actions over disjoint keys run in parallel. No thread ever waits: a blocked
//! action is stored as a not-yet-spawned task and spawned by whichever
//! predecessor completes last.
//!
//! ```text
//!   k1: [A] → B → D          A holds k1,k2,k3 → runs
//!   k2: [A]                   B waits for A on k1
//!   k3: [A] → C               C waits for A on k3
//!   k4:  C  → D               D waits for B (k1) and C (k4)
//! ```
//!
//! Each action counts the queues it is not yet heading. When an action
//! finishes it is popped from every queue it heads; the new heads decrement
//! their counts and those reaching zero are spawned.

mod handle;

pub use handle::ActionHandle;

use crate::error::Result;
use crate::metrics::CoreMetrics;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::trace;

type ActionId = u64;
type ActionTask = Pin<Box<dyn Future<Output = ()> + Send>>;
type StartFn = Box<dyn FnOnce() -> ActionTask + Send>;

/// Diagnostic counters of a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerStats {
    /// Distinct keys with at least one pending action.
    pub tracked_keys: usize,
    /// Actions submitted but not yet completed.
    pub pending_actions: usize,
}

struct PendingAction<K> {
    keys: Vec<K>,
    /// Number of queues this action is not heading yet.
    blocked_on: usize,
    /// Present until the action is spawned.
    start: Option<StartFn>,
}

struct State<K> {
    queues: HashMap<K, VecDeque<ActionId>>,
    actions: HashMap<ActionId, PendingAction<K>>,
    next_id: ActionId,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    metrics: Option<Arc<CoreMetrics>>,
}

/// Orders asynchronous actions by the keys they touch.
pub struct ActionSequencer<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for ActionSequencer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> ActionSequencer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty sequencer.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a sequencer that reports into `metrics`.
    pub fn with_metrics(metrics: Arc<CoreMetrics>) -> Self {
        Self::build(Some(metrics))
    }

    fn build(metrics: Option<Arc<CoreMetrics>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queues: HashMap::new(),
                    actions: HashMap::new(),
                    next_id: 0,
                }),
                metrics,
            }),
        }
    }

    /// Run `action` once every earlier action sharing one of `keys` has
    /// completed.
    ///
    /// Duplicate keys count once. An empty key set runs immediately. A failed
    /// or panicking action still releases its keys.
    ///
    /// Must be called from within a tokio runtime.
    pub fn order_on_keys<I, F, Fut, R>(&self, keys: I, action: F) -> ActionHandle<R>
    where
        I: IntoIterator<Item = K>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let mut seen = HashSet::new();
        let keys: Vec<K> = keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();
        let (tx, rx) = oneshot::channel();

        if keys.is_empty() {
            tokio::spawn(async move {
                let _ = tx.send(action().await);
            });
            return ActionHandle::new(rx);
        }

        let ready = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let id = state.next_id;
            state.next_id += 1;

            let completion = CompletionGuard {
                sequencer: Arc::downgrade(&self.inner),
                id,
            };
            let start: StartFn = Box::new(move || {
                Box::pin(async move {
                    // Dropped last, after the result is delivered, so successors
                    // observe this action's effects.
                    let _completion = completion;
                    let result = action().await;
                    let _ = tx.send(result);
                })
            });

            let mut blocked_on = 0;
            for key in &keys {
                let queue = state.queues.entry(key.clone()).or_default();
                if !queue.is_empty() {
                    blocked_on += 1;
                }
                queue.push_back(id);
            }
            trace!(action = id, keys = keys.len(), blocked_on, "Action submitted");

            let (ready, start) = if blocked_on == 0 {
                (Some(start), None)
            } else {
                (None, Some(start))
            };
            state.actions.insert(
                id,
                PendingAction {
                    keys,
                    blocked_on,
                    start,
                },
            );
            ready
        };

        if let Some(metrics) = &self.inner.metrics {
            metrics.sequencer_submitted.inc();
            metrics.sequencer_pending.inc();
        }
        if let Some(start) = ready {
            tokio::spawn(start());
        }
        ActionHandle::new(rx)
    }

    /// Single-key form of [`order_on_keys`](Self::order_on_keys).
    pub fn order_on_key<F, Fut, R>(&self, key: K, action: F) -> ActionHandle<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.order_on_keys(std::iter::once(key), action)
    }

    /// Distinct keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.inner.state.lock().queues.len()
    }

    /// Actions submitted but not yet completed.
    pub fn pending_actions(&self) -> usize {
        self.inner.state.lock().actions.len()
    }

    pub fn stats(&self) -> SequencerStats {
        let state = self.inner.state.lock();
        SequencerStats {
            tracked_keys: state.queues.len(),
            pending_actions: state.actions.len(),
        }
    }
}

impl<K> Default for ActionSequencer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for ActionSequencer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ActionSequencer")
            .field("tracked_keys", &state.queues.len())
            .field("pending_actions", &state.actions.len())
            .finish()
    }
}

impl<K> Inner<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn complete(&self, id: ActionId) {
        let mut ready = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(action) = state.actions.remove(&id) else {
                return;
            };

            for key in action.keys {
                let Some(queue) = state.queues.get_mut(&key) else {
                    continue;
                };
                debug_assert_eq!(queue.front(), Some(&id));
                queue.pop_front();
                match queue.front().copied() {
                    Some(next) => {
                        if let Some(successor) = state.actions.get_mut(&next) {
                            successor.blocked_on -= 1;
                            if successor.blocked_on == 0 {
                                if let Some(start) = successor.start.take() {
                                    trace!(action = next, "Action unblocked");
                                    ready.push(start);
                                }
                            }
                        }
                    }
                    None => {
                        state.queues.remove(&key);
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.sequencer_completed.inc();
            metrics.sequencer_pending.dec();
        }
        for start in ready {
            tokio::spawn(start());
        }
    }
}

/// Releases an action's keys when dropped, including on panic.
struct CompletionGuard<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    sequencer: Weak<Inner<K>>,
    id: ActionId,
}

impl<K> Drop for CompletionGuard<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(inner) = self.sequencer.upgrade() {
            inner.complete(self.id);
        }
    }
}

//! In-flight request records.
//!
//! ```text
//!            ┌──────────── MultiTargetRequest ─────────────┐
//!  response ─►  slot[node-1] Pending → Responded            │
//!  view     ─►  slot[node-2] Pending → Left (Leaver)        ├─► collector ─► RpcFuture
//!  timeout  ─►  slot[node-3] Pending                        │
//!            └─────────────────────────────────────────────┘
//! ```
//!
//! Completion is guarded by an atomic flag: the first of collector
//! short-circuit, last response, failure or timeout wins, and the loser is a
//! no-op. Completing cancels the timeout task and unregisters the request.

use crate::error::{Error, ProtocolError, Result};
use crate::metrics::CoreMetrics;
use crate::rpc::collector::ResponseCollector;
use crate::rpc::message::Response;
use crate::types::Address;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Type-erased view of an in-flight request, as held by the repository.
pub trait RequestHandle: Send + Sync {
    fn request_id(&self) -> u64;

    /// Deliver a target's response.
    fn on_response(&self, sender: Address, response: Response);

    /// Mark pending targets missing from `members` as leavers.
    fn on_view_change(&self, members: &[Address]);

    /// Deadline reached.
    fn on_timeout(&self, as_leaver: bool);

    /// Fail the request.
    fn fail(&self, error: Error);

    fn is_done(&self) -> bool;
}

/// Requests awaiting responses, keyed by request id.
pub struct RequestRepository {
    requests: DashMap<u64, Arc<dyn RequestHandle>>,
    next_request_id: AtomicU64,
}

impl RequestRepository {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add(&self, request: Arc<dyn RequestHandle>) {
        self.requests.insert(request.request_id(), request);
    }

    pub fn get(&self, request_id: u64) -> Option<Arc<dyn RequestHandle>> {
        // Clone out so no shard lock is held while the request runs.
        self.requests.get(&request_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, request_id: u64) {
        self.requests.remove(&request_id);
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Propagate a membership change to every in-flight request.
    pub fn on_view_change(&self, members: &[Address]) {
        let requests: Vec<_> = self
            .requests
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for request in requests {
            request.on_view_change(members);
        }
    }
}

impl Default for RequestRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Responded,
    Left,
}

struct RequestState<C> {
    slots: Vec<(Address, Slot)>,
    missing: usize,
    /// Taken by `finish`; `None` afterwards.
    collector: Option<C>,
}

/// A request to one or more targets whose responses feed one collector.
pub struct MultiTargetRequest<T, C> {
    request_id: u64,
    state: Mutex<RequestState<C>>,
    done: AtomicBool,
    result_tx: Mutex<Option<oneshot::Sender<Result<T>>>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    repository: Weak<RequestRepository>,
    unusable_response: Option<Arc<Notify>>,
    metrics: Option<Arc<CoreMetrics>>,
    started: Instant,
}

impl<T, C> MultiTargetRequest<T, C>
where
    T: Send + 'static,
    C: ResponseCollector<T> + 'static,
{
    /// Create a request. Duplicate targets are merged.
    pub fn new(
        request_id: u64,
        targets: &[Address],
        collector: C,
        repository: &Arc<RequestRepository>,
    ) -> (Arc<Self>, RpcFuture<T>) {
        Self::build(request_id, targets, collector, repository, None, None)
    }

    pub(crate) fn build(
        request_id: u64,
        targets: &[Address],
        collector: C,
        repository: &Arc<RequestRepository>,
        unusable_response: Option<Arc<Notify>>,
        metrics: Option<Arc<CoreMetrics>>,
    ) -> (Arc<Self>, RpcFuture<T>) {
        let mut slots: Vec<(Address, Slot)> = Vec::with_capacity(targets.len());
        for target in targets {
            if !slots.iter().any(|(addr, _)| addr == target) {
                slots.push((*target, Slot::Pending));
            }
        }
        let missing = slots.len();
        let (tx, rx) = oneshot::channel();

        let request = Arc::new(Self {
            request_id,
            state: Mutex::new(RequestState {
                slots,
                missing,
                collector: Some(collector),
            }),
            done: AtomicBool::new(false),
            result_tx: Mutex::new(Some(tx)),
            timeout_task: Mutex::new(None),
            repository: Arc::downgrade(repository),
            unusable_response,
            metrics,
            started: Instant::now(),
        });
        (request, RpcFuture::new(rx))
    }

    /// Attach the timeout task; aborted at once if the request already completed.
    pub fn set_timeout_task(&self, task: JoinHandle<()>) {
        let mut slot = self.timeout_task.lock();
        if self.is_done() {
            task.abort();
        } else {
            *slot = Some(task);
        }
    }

    /// Targets still awaiting a response.
    pub fn pending_targets(&self) -> Vec<Address> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|(_, slot)| *slot == Slot::Pending)
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Complete a request that has no targets at all.
    pub fn finish_if_no_targets(&self) {
        let result = {
            let mut state = self.state.lock();
            if !state.slots.is_empty() {
                return;
            }
            Self::finish_collector(&mut state)
        };
        self.complete(result);
    }

    fn finish_collector(state: &mut RequestState<C>) -> Result<T> {
        match state.collector.take() {
            Some(mut collector) => collector.finish(),
            None => Err(ProtocolError::FinishedTwice.into()),
        }
    }

    fn complete(&self, result: Result<T>) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }
        if let Some(repository) = self.repository.upgrade() {
            repository.remove(self.request_id);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_rpc(self.started.elapsed());
            if matches!(result, Err(Error::Protocol(_))) {
                metrics.rpc_protocol_violations.inc();
            }
        }

        match &result {
            Ok(_) => trace!(request_id = self.request_id, "Request completed"),
            Err(e) => debug!(request_id = self.request_id, error = %e, "Request failed"),
        }
        if let Some(tx) = self.result_tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl<T, C> RequestHandle for MultiTargetRequest<T, C>
where
    T: Send + 'static,
    C: ResponseCollector<T> + 'static,
{
    fn request_id(&self) -> u64 {
        self.request_id
    }

    fn on_response(&self, sender: Address, response: Response) {
        if self.is_done() {
            trace!(request_id = self.request_id, %sender, "Dropping response to completed request");
            return;
        }

        let is_leaver = response.is_leaver();
        let outcome = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let position = state.slots.iter().position(|(addr, _)| *addr == sender);

            match position.map(|i| (i, state.slots[i].1)) {
                None => Some(Err(ProtocolError::UnexpectedSender {
                    request_id: self.request_id,
                    sender,
                }
                .into())),
                Some((_, Slot::Left)) => {
                    trace!(request_id = self.request_id, %sender, "Ignoring response from leaver");
                    None
                }
                Some((_, Slot::Responded)) if is_leaver => None,
                Some((_, Slot::Responded)) => Some(Err(ProtocolError::DuplicateResponse {
                    request_id: self.request_id,
                    sender,
                }
                .into())),
                Some((i, Slot::Pending)) => {
                    state.slots[i].1 = if is_leaver { Slot::Left } else { Slot::Responded };
                    state.missing -= 1;

                    let added = match state.collector.as_mut() {
                        Some(collector) => collector.add_response(sender, response),
                        None => Err(ProtocolError::FinishedTwice.into()),
                    };
                    match added {
                        Err(e) => Some(Err(e)),
                        Ok(Some(value)) => Some(Ok(value)),
                        Ok(None) if state.missing == 0 => Some(Self::finish_collector(state)),
                        Ok(None) => None,
                    }
                }
            }
        };

        match outcome {
            Some(result) => self.complete(result),
            None => {
                if let Some(notify) = &self.unusable_response {
                    notify.notify_one();
                }
            }
        }
    }

    fn on_view_change(&self, members: &[Address]) {
        let leavers: Vec<Address> = self
            .pending_targets()
            .into_iter()
            .filter(|target| !members.contains(target))
            .collect();
        for leaver in leavers {
            debug!(request_id = self.request_id, %leaver, "Target left during request");
            if let Some(metrics) = &self.metrics {
                metrics.rpc_leaver_responses.inc();
            }
            self.on_response(leaver, Response::Leaver);
        }
    }

    fn on_timeout(&self, as_leaver: bool) {
        if self.is_done() {
            return;
        }
        let missing = self.pending_targets();
        if as_leaver {
            debug!(request_id = self.request_id, ?missing, "Request timed out, treating missing targets as leavers");
            for target in missing {
                if let Some(metrics) = &self.metrics {
                    metrics.rpc_leaver_responses.inc();
                }
                self.on_response(target, Response::Leaver);
            }
        } else {
            warn!(request_id = self.request_id, ?missing, "Request timed out");
            if let Some(metrics) = &self.metrics {
                metrics.rpc_timeouts.inc();
            }
            self.complete(Err(Error::Timeout {
                request_id: self.request_id,
                missing,
            }));
        }
    }

    fn fail(&self, error: Error) {
        self.complete(Err(error));
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Resolves with a request's aggregate result.
#[derive(Debug)]
pub struct RpcFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> RpcFuture<T> {
    fn new(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// A future that is already failed.
    pub fn failed(error: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self::new(rx)
    }
}

impl<T> Future for RpcFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

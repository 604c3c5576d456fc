//! Issues commands to targets and routes their responses.
//!
//! Every invocation registers a [`MultiTargetRequest`] in the
//! [`RequestRepository`] before anything is sent, pairs it with a timeout task,
//! and returns an [`RpcFuture`] immediately. Inbound responses are routed by
//! request id; membership changes turn pending targets into leavers.

use crate::config::RpcConfig;
use crate::error::Result;
use crate::metrics::CoreMetrics;
use crate::rpc::collector::ResponseCollector;
use crate::rpc::interceptor::{run_after, run_before, InvocationContext, RpcInterceptor};
use crate::rpc::message::{Response, RpcMessage};
use crate::rpc::request::{MultiTargetRequest, RequestHandle, RequestRepository, RpcFuture};
use crate::rpc::transport::Transport;
use crate::types::{Address, Command, DeliverOrder};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Per-invocation settings. Unset values fall back to [`RpcConfig`].
#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub timeout: Option<Duration>,
    pub timeout_as_leaver: Option<bool>,
    pub deliver_order: DeliverOrder,
    /// Marks a read-only replay; see [`InvocationContext::replay`].
    pub replay: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            timeout_as_leaver: None,
            deliver_order: DeliverOrder::None,
            replay: false,
        }
    }
}

impl RpcOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_as_leaver(mut self, enabled: bool) -> Self {
        self.timeout_as_leaver = Some(enabled);
        self
    }

    pub fn with_deliver_order(mut self, order: DeliverOrder) -> Self {
        self.deliver_order = order;
        self
    }

    pub fn as_replay(mut self) -> Self {
        self.replay = true;
        self
    }
}

/// Request/response manager on top of a [`Transport`].
pub struct RpcManager {
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    repository: Arc<RequestRepository>,
    interceptors: RwLock<Vec<Arc<dyn RpcInterceptor>>>,
    metrics: Arc<CoreMetrics>,
}

impl RpcManager {
    pub fn new(transport: Arc<dyn Transport>, config: RpcConfig, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            transport,
            config,
            repository: Arc::new(RequestRepository::new()),
            interceptors: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// This node's address.
    pub fn address(&self) -> Address {
        self.transport.address()
    }

    /// Members of the current view.
    pub fn members(&self) -> Vec<Address> {
        self.transport.members()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.metrics
    }

    /// Append an interceptor to the chain.
    pub fn add_interceptor(&self, interceptor: Arc<dyn RpcInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    /// Requests still awaiting completion.
    pub fn pending_requests(&self) -> usize {
        self.repository.len()
    }

    /// Send `command` to `targets` and collect their responses.
    pub fn invoke_command<T, C>(
        &self,
        targets: &[Address],
        command: Command,
        collector: C,
        options: RpcOptions,
    ) -> RpcFuture<T>
    where
        T: Send + 'static,
        C: ResponseCollector<T> + 'static,
    {
        let (ctx, chain) = match self.intercept(command, dedup(targets), options.replay) {
            Ok(intercepted) => intercepted,
            Err(e) => return RpcFuture::failed(e),
        };

        let (request, future) = self.register(&ctx.targets, collector, &options, None);
        let members = self.transport.members();
        let (live, gone): (Vec<Address>, Vec<Address>) = ctx
            .targets
            .iter()
            .copied()
            .partition(|target| members.contains(target));
        for target in gone {
            record_leaver(&self.metrics, request.as_ref(), target);
        }
        if !live.is_empty() {
            let message = RpcMessage::request(request.request_id(), ctx.command.clone());
            if let Err(e) = self
                .transport
                .multicast(&live, message, options.deliver_order)
            {
                warn!(request_id = request.request_id(), targets = ?live, error = %e, "Failed to send request");
                request.fail(e);
            }
        }
        request.finish_if_no_targets();

        run_after(&chain, &ctx);
        future
    }

    /// Send `command` to every other member.
    pub fn invoke_command_on_all<T, C>(&self, command: Command, collector: C, options: RpcOptions) -> RpcFuture<T>
    where
        T: Send + 'static,
        C: ResponseCollector<T> + 'static,
    {
        let targets = self.other_members();
        self.invoke_command(&targets, command, collector, options)
    }

    /// Contact `targets` one at a time.
    ///
    /// The next target is contacted after the stagger delay, or as soon as a
    /// response arrives that does not complete the request.
    pub fn invoke_command_staggered<T, C>(
        &self,
        targets: &[Address],
        command: Command,
        collector: C,
        options: RpcOptions,
    ) -> RpcFuture<T>
    where
        T: Send + 'static,
        C: ResponseCollector<T> + 'static,
    {
        let (ctx, chain) = match self.intercept(command, dedup(targets), options.replay) {
            Ok(intercepted) => intercepted,
            Err(e) => return RpcFuture::failed(e),
        };

        let notify = Arc::new(Notify::new());
        let (request, future) =
            self.register(&ctx.targets, collector, &options, Some(Arc::clone(&notify)));
        request.finish_if_no_targets();

        let members = self.transport.members();
        let mut targets = ctx.targets.clone().into_iter();
        if let Some(first) = targets.next() {
            send_request(
                self.transport.as_ref(),
                &self.metrics,
                request.as_ref(),
                &members,
                first,
                ctx.command.clone(),
                options.deliver_order,
            );
        }

        let rest: Vec<Address> = targets.collect();
        if !rest.is_empty() {
            let delay = self.config.effective_stagger_delay();
            let transport = Arc::clone(&self.transport);
            let metrics = Arc::clone(&self.metrics);
            let command = ctx.command.clone();
            let order = options.deliver_order;
            tokio::spawn(async move {
                for target in rest {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = notify.notified() => {}
                    }
                    if request.is_done() {
                        break;
                    }
                    trace!(request_id = request.request_id(), %target, "Contacting next staggered target");
                    let members = transport.members();
                    send_request(
                        transport.as_ref(),
                        &metrics,
                        request.as_ref(),
                        &members,
                        target,
                        command.clone(),
                        order,
                    );
                }
            });
        }

        run_after(&chain, &ctx);
        future
    }

    /// Send a per-target command to each target; all responses feed the same
    /// collector.
    pub fn invoke_commands<T, C, G>(
        &self,
        targets: &[Address],
        generator: G,
        collector: C,
        options: RpcOptions,
    ) -> RpcFuture<T>
    where
        T: Send + 'static,
        C: ResponseCollector<T> + 'static,
        G: Fn(Address) -> Command,
    {
        let targets = dedup(targets);
        let chain = self.interceptors.read().clone();
        let (request, future) = self.register(&targets, collector, &options, None);
        let members = self.transport.members();

        for target in targets {
            let mut ctx = InvocationContext::new(self.address(), generator(target), vec![target]);
            ctx.replay = options.replay;
            if let Err(e) = run_before(&chain, &mut ctx) {
                request.fail(e);
                break;
            }
            send_request(
                self.transport.as_ref(),
                &self.metrics,
                request.as_ref(),
                &members,
                target,
                ctx.command.clone(),
                options.deliver_order,
            );
            run_after(&chain, &ctx);
        }
        request.finish_if_no_targets();
        future
    }

    /// Fire-and-forget send to one target.
    pub fn send_to(&self, target: Address, command: Command, order: DeliverOrder) -> Result<()> {
        self.send_to_many(&[target], command, order)
    }

    /// Fire-and-forget send to several targets.
    pub fn send_to_many(&self, targets: &[Address], command: Command, order: DeliverOrder) -> Result<()> {
        let (ctx, chain) = self.intercept(command, dedup(targets), false)?;
        self.transport
            .multicast(&ctx.targets, RpcMessage::one_way(ctx.command.clone()), order)?;
        run_after(&chain, &ctx);
        Ok(())
    }

    /// Fire-and-forget send to every other member.
    pub fn send_to_all(&self, command: Command, order: DeliverOrder) -> Result<()> {
        let targets = self.other_members();
        self.send_to_many(&targets, command, order)
    }

    /// Answer a request received from `target`.
    pub fn reply(&self, target: Address, request_id: u64, response: Response) -> Result<()> {
        self.transport.send(
            target,
            RpcMessage::response(request_id, response),
            DeliverOrder::None,
        )
    }

    /// Route an inbound response to its request.
    pub fn handle_response(&self, sender: Address, request_id: u64, response: Response) {
        match self.repository.get(request_id) {
            Some(request) => request.on_response(sender, response),
            None => trace!(request_id, %sender, "Response for unknown or completed request"),
        }
    }

    /// Turn pending targets that left into leaver responses.
    pub fn on_view_change(&self, members: &[Address]) {
        debug!(members = ?members, pending = self.repository.len(), "RPC layer installing view");
        self.repository.on_view_change(members);
    }

    fn other_members(&self) -> Vec<Address> {
        let local = self.address();
        self.transport
            .members()
            .into_iter()
            .filter(|member| *member != local)
            .collect()
    }

    fn intercept(
        &self,
        command: Command,
        targets: Vec<Address>,
        replay: bool,
    ) -> Result<(InvocationContext, Vec<Arc<dyn RpcInterceptor>>)> {
        let chain = self.interceptors.read().clone();
        let mut ctx = InvocationContext::new(self.address(), command, targets);
        ctx.replay = replay;
        run_before(&chain, &mut ctx)?;
        Ok((ctx, chain))
    }

    fn register<T, C>(
        &self,
        targets: &[Address],
        collector: C,
        options: &RpcOptions,
        unusable_response: Option<Arc<Notify>>,
    ) -> (Arc<MultiTargetRequest<T, C>>, RpcFuture<T>)
    where
        T: Send + 'static,
        C: ResponseCollector<T> + 'static,
    {
        let request_id = self.repository.next_request_id();
        let (request, future) = MultiTargetRequest::build(
            request_id,
            targets,
            collector,
            &self.repository,
            unusable_response,
            Some(Arc::clone(&self.metrics)),
        );
        self.repository.add(request.clone());
        self.metrics.rpc_requests.inc();

        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let as_leaver = options.timeout_as_leaver.unwrap_or(self.config.timeout_as_leaver);
        let weak = Arc::downgrade(&request);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(request) = weak.upgrade() {
                request.on_timeout(as_leaver);
            }
        });
        request.set_timeout_task(task);

        (request, future)
    }
}

impl std::fmt::Debug for RpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcManager")
            .field("address", &self.address())
            .field("pending_requests", &self.repository.len())
            .finish()
    }
}

fn dedup(targets: &[Address]) -> Vec<Address> {
    let mut unique = Vec::with_capacity(targets.len());
    for target in targets {
        if !unique.contains(target) {
            unique.push(*target);
        }
    }
    unique
}

/// Send one request message, or record a leaver if the target is not a member.
fn record_leaver(metrics: &CoreMetrics, request: &dyn RequestHandle, target: Address) {
    debug!(request_id = request.request_id(), %target, "Target not in view, recording leaver");
    metrics.rpc_leaver_responses.inc();
    request.on_response(target, Response::Leaver);
}

fn send_request(
    transport: &dyn Transport,
    metrics: &CoreMetrics,
    request: &dyn RequestHandle,
    members: &[Address],
    target: Address,
    command: Command,
    order: DeliverOrder,
) {
    if !members.contains(&target) {
        record_leaver(metrics, request, target);
        return;
    }
    let message = RpcMessage::request(request.request_id(), command);
    if let Err(e) = transport.send(target, message, order) {
        warn!(request_id = request.request_id(), %target, error = %e, "Failed to send request");
        request.fail(e);
    }
}

//! A full-duplex client that keeps one connection alive and correlates many
//! outstanding requests by sequence number.
//!
//! 全双工客户端：保持一个连接存活，并通过序列号关联多个未完成的请求。
//!
//! The client reconnects with a linear backoff (`attempt * backoff_unit`)
//! after a failed connect or a dropped connection. A dropped connection fails
//! every outstanding request with [`Error::ConnectionLost`] first.

mod connection;
mod sequence;

pub use connection::{Connection, ConnectionFactory, TcpConnector};
pub use sequence::{Incrementing, RandomSequence, SequenceStrategy};

use super::pending::{PendingRequest, ResponseReceiver};
use crate::{
    config::SequencedConfig,
    error::{Error, Result},
    lifecycle::{Lifecycle, LifecycleCore, ListenerHandle, State, StateListener},
    sync::AtomicSlot,
};
use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::AbortHandle,
};
use tracing::{debug, info, trace, warn};

/// How many fresh sequence numbers a request draws before giving up on a
/// table where every candidate is still outstanding.
const MAX_SEQUENCE_DRAWS: usize = 64;

/// Protocol hooks of a [`SequencedClient`].
///
/// 序列化客户端的协议钩子。
#[async_trait]
pub trait SequencedCodec: Send + Sync + 'static {
    type Seq: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Outbound: Send + 'static;
    type Inbound: Send + 'static;

    /// Derives the next sequence number. Applied atomically to the previous
    /// value; see [`SequenceStrategy`] for ready-made strategies.
    /// 推导下一个序列号。
    fn next_sequence(&self, previous: Option<Self::Seq>) -> Self::Seq;

    /// Tags `request` with `seq` for the wire.
    /// 使用 `seq` 标记 `request` 以便发送。
    fn encode(&self, seq: Self::Seq, request: Self::Request) -> Result<Self::Outbound>;

    /// Extracts the sequence number and response from an inbound message.
    /// `None` discards the message.
    /// 从入站消息中提取序列号和响应。返回 `None` 时丢弃该消息。
    fn decode(&self, inbound: Self::Inbound) -> Option<(Self::Seq, Self::Response)>;

    /// Runs on every new connection before it carries requests, e.g. to log in.
    /// 在每个新连接承载请求之前执行，例如登录。
    async fn after_connect(&self, _outbound: &mpsc::Sender<Self::Outbound>) -> Result<()> {
        Ok(())
    }

    /// Whether to reconnect after the given failure.
    /// 给定失败之后是否重连。
    fn should_reconnect(&self, _last_error: Option<&Error>) -> bool {
        true
    }
}

struct Link<O> {
    id: u64,
    outbound: mpsc::Sender<O>,
}

/// One connect attempt; every waiter observes the same outcome.
struct Connecting {
    outcome: watch::Sender<Option<Result<()>>>,
}

type Pending<C> =
    PendingRequest<<C as SequencedCodec>::Seq, <C as SequencedCodec>::Response>;

struct Shared<F, C>
where
    F: ConnectionFactory,
    C: SequencedCodec<Outbound = F::Outbound, Inbound = F::Inbound>,
{
    label: String,
    factory: F,
    codec: C,
    config: SequencedConfig,
    core: LifecycleCore,
    sequence: AtomicSlot<C::Seq>,
    pending: DashMap<C::Seq, Arc<Pending<C>>>,
    link: AtomicSlot<Link<C::Outbound>>,
    connecting: AtomicSlot<Connecting>,
    retries: AtomicU32,
    // The one pending backoff timer; on-demand connects never add another.
    reconnect_timer: Mutex<Option<AbortHandle>>,
    next_link_id: AtomicU64,
    last_error: Mutex<Option<Error>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// A reconnecting, sequence-correlated request/response client.
///
/// `start()` opens the first connection in the background. Requests issued
/// while no connection is up wait for the next one. Dropping the client
/// disposes it.
///
/// 自动重连、按序列号关联的请求/响应客户端。`start()` 在后台打开第一个连接。
/// 没有连接时发出的请求会等待下一个连接。丢弃客户端会释放它。
pub struct SequencedClient<F, C>
where
    F: ConnectionFactory,
    C: SequencedCodec<Outbound = F::Outbound, Inbound = F::Inbound>,
{
    shared: Arc<Shared<F, C>>,
}

/// Removes a request from the sequence table when the caller goes away.
struct Registration<'a, S: Eq + Hash, T> {
    table: &'a DashMap<S, Arc<PendingRequest<S, T>>>,
    seq: S,
    request: Arc<PendingRequest<S, T>>,
}

impl<S: Eq + Hash, T> Drop for Registration<'_, S, T> {
    fn drop(&mut self) {
        self.table
            .remove_if(&self.seq, |_, current| Arc::ptr_eq(current, &self.request));
        self.request.cancel();
    }
}

impl<F, C> SequencedClient<F, C>
where
    F: ConnectionFactory,
    C: SequencedCodec<Outbound = F::Outbound, Inbound = F::Inbound>,
{
    pub fn new(label: impl Into<String>, factory: F, codec: C, config: SequencedConfig) -> Self {
        let label = label.into();
        Self {
            shared: Arc::new(Shared {
                core: LifecycleCore::new(label.clone()),
                label,
                factory,
                codec,
                config,
                sequence: AtomicSlot::empty(),
                pending: DashMap::new(),
                link: AtomicSlot::empty(),
                connecting: AtomicSlot::empty(),
                retries: AtomicU32::new(0),
                reconnect_timer: Mutex::new(None),
                next_link_id: AtomicU64::new(0),
                last_error: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn codec(&self) -> &C {
        &self.shared.codec
    }

    /// Number of requests awaiting a response.
    /// 等待响应的请求数量。
    pub fn outstanding(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.link.is_empty()
    }

    /// Consecutive failed reconnect attempts since the last connect.
    /// 自上次连接以来连续失败的重连次数。
    pub fn retries(&self) -> u32 {
        self.shared.retries.load(Ordering::Acquire)
    }

    /// The last connect or connection failure, if any.
    /// 最近一次连接失败的原因（如果有）。
    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error.lock().clone()
    }

    /// Waits until a connection is up, joining an attempt already in
    /// progress rather than starting a second one.
    ///
    /// 等待连接建立。如果已有连接尝试正在进行，则加入它而不是发起新的尝试。
    pub async fn connect(&self) -> Result<()> {
        self.shared.ensure_connected().await.map(|_| ())
    }

    /// Sends `request` and waits for the response carrying its sequence
    /// number. Dropping the future withdraws the request.
    ///
    /// 发送 `request` 并等待携带相同序列号的响应。丢弃该 future 会撤回请求。
    pub async fn request(&self, request: C::Request) -> Result<C::Response> {
        let shared = &self.shared;
        if shared.core.is_disposed() {
            return Err(shared.closed());
        }
        let (seq, pending, mut receiver) = shared.register()?;
        let _registration = Registration {
            table: &shared.pending,
            seq,
            request: pending,
        };
        let outbound = shared.codec.encode(seq, request)?;

        let exchange = async {
            let link = shared.ensure_connected().await?;
            trace!(client = %shared.label, ?seq, link = link.id, "Sending request");
            if link.outbound.send(outbound).await.is_err() {
                shared.on_disconnect(&link, Error::ConnectionLost);
                return Err(Error::ConnectionLost);
            }
            receiver.recv().await.unwrap_or(Err(Error::ConnectionLost))
        };

        match shared.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
                warn!(client = %shared.label, ?seq, "Request timed out");
                Error::Timeout {
                    target: shared.label.clone(),
                }
            })?,
            None => exchange.await,
        }
    }
}

impl<F, C> Shared<F, C>
where
    F: ConnectionFactory,
    C: SequencedCodec<Outbound = F::Outbound, Inbound = F::Inbound>,
{
    fn closed(&self) -> Error {
        Error::AlreadyClosed(self.label.clone())
    }

    fn next_sequence(&self) -> C::Seq {
        loop {
            let previous = self.sequence.load();
            let next = Arc::new(self.codec.next_sequence(previous.as_deref().copied()));
            if self.sequence.compare_and_set(previous.as_ref(), Some(next.clone())) {
                return *next;
            }
        }
    }

    fn register(&self) -> Result<(C::Seq, Arc<Pending<C>>, ResponseReceiver<C::Response>)> {
        for _ in 0..MAX_SEQUENCE_DRAWS {
            let seq = self.next_sequence();
            if let Entry::Vacant(slot) = self.pending.entry(seq) {
                let (request, receiver) =
                    PendingRequest::new(seq, self.config.request_timeout, Some(1));
                slot.insert(request.clone());
                return Ok((seq, request, receiver));
            }
            trace!(client = %self.label, ?seq, "Sequence number still outstanding, drawing another");
        }
        Err(Error::QueueFull {
            capacity: self.pending.len(),
        })
    }

    fn track(&self, task: AbortHandle) {
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }
        if self.core.is_disposed() {
            self.abort_tasks();
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn fail_outstanding(&self, error: &Error) -> usize {
        let mut failed = 0;
        self.pending.retain(|_, request| {
            if request.fail(error.clone()) {
                failed += 1;
            }
            false
        });
        failed
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<Arc<Link<C::Outbound>>> {
        loop {
            if self.core.is_disposed() {
                return Err(self.closed());
            }
            if let Some(link) = self.link.load() {
                return Ok(link);
            }
            let mut outcome = self.connect_now().outcome.subscribe();
            let finished = outcome
                .wait_for(Option::is_some)
                .await
                .map(|done| (*done).clone());
            match finished {
                Ok(Some(Ok(()))) => continue,
                Ok(Some(Err(e))) => return Err(e),
                // The attempt was abandoned by a dispose.
                Ok(None) | Err(_) => return Err(Error::ConnectionLost),
            }
        }
    }

    /// Returns the connect attempt in progress, starting one if there is none.
    fn connect_now(self: &Arc<Self>) -> Arc<Connecting> {
        loop {
            if let Some(current) = self.connecting.load() {
                return current;
            }
            let (outcome, _) = watch::channel(None);
            let attempt = Arc::new(Connecting { outcome });
            if self.connecting.compare_and_set(None, Some(attempt.clone())) {
                let task = tokio::spawn(self.clone().run_connect(attempt.clone()));
                self.track(task.abort_handle());
                return attempt;
            }
        }
    }

    async fn run_connect(self: Arc<Self>, attempt: Arc<Connecting>) {
        let outcome = if self.link.is_empty() {
            self.establish().await
        } else {
            Ok(())
        };
        self.connecting.compare_and_set(Some(&attempt), None);
        if let Err(e) = &outcome {
            warn!(client = %self.label, retries = self.retries.load(Ordering::Acquire), error = %e, "连接失败 | Connect failed");
            *self.last_error.lock() = Some(e.clone());
            if !self.core.is_disposed() {
                self.core.change_state(State::Running, State::ConnectionClosed);
                self.schedule_reconnect();
            }
        }
        attempt.outcome.send_replace(Some(outcome));
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        debug!(client = %self.label, "Connecting");
        let connection = self.factory.connect().await?;
        self.codec.after_connect(&connection.outbound).await?;
        if self.core.is_disposed() {
            return Err(self.closed());
        }

        let link = Arc::new(Link {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            outbound: connection.outbound,
        });
        self.link.swap(Some(link.clone()));
        self.cancel_reconnect();
        self.retries.store(0, Ordering::Release);
        let reader = tokio::spawn(self.clone().read_loop(link.clone(), connection.inbound));
        self.track(reader.abort_handle());
        if self.core.is_disposed() {
            self.link.swap(None);
            return Err(self.closed());
        }

        self.core.change_state(State::ConnectionClosed, State::Running);
        info!(client = %self.label, link = link.id, "已连接 | Connected");
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, link: Arc<Link<C::Outbound>>, mut inbound: mpsc::Receiver<C::Inbound>) {
        while let Some(message) = inbound.recv().await {
            match self.codec.decode(message) {
                Some((seq, response)) => match self.pending.remove(&seq) {
                    Some((_, request)) => {
                        trace!(client = %self.label, ?seq, "Response matched");
                        request.emit(response);
                    }
                    None => {
                        trace!(client = %self.label, ?seq, "No request for sequence number, discarding response");
                    }
                },
                None => debug!(client = %self.label, "Discarding undecodable message"),
            }
        }
        self.on_disconnect(&link, Error::ConnectionLost);
    }

    fn on_disconnect(self: &Arc<Self>, link: &Arc<Link<C::Outbound>>, cause: Error) {
        if !self.link.compare_and_set(Some(link), None) {
            return;
        }
        let failed = self.fail_outstanding(&Error::ConnectionLost);
        warn!(client = %self.label, link = link.id, failed, "连接已断开 | Connection lost");
        *self.last_error.lock() = Some(cause);
        if self.core.is_disposed() {
            return;
        }
        self.core.change_state(State::Running, State::ConnectionClosed);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.core.is_disposed() {
            return;
        }
        let last_error = self.last_error.lock().clone();
        if !self.codec.should_reconnect(last_error.as_ref()) {
            info!(client = %self.label, "Reconnect declined");
            return;
        }

        let mut timer = self.reconnect_timer.lock();
        if timer.as_ref().is_some_and(|timer| !timer.is_finished()) {
            debug!(client = %self.label, "Reconnect already scheduled");
            return;
        }
        let failures = self.retries.load(Ordering::Acquire);
        if self.config.reconnect.exhausted(failures) {
            drop(timer);
            warn!(client = %self.label, attempts = failures, "重连次数耗尽 | Giving up reconnecting");
            *self.last_error.lock() = Some(Error::RetriesExhausted { attempts: failures });
            if let Err(e) = self.dispose() {
                warn!(client = %self.label, error = %e, "Dispose failed");
            }
            return;
        }

        let attempt = self.retries.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = self.config.reconnect.delay_for(attempt);
        info!(client = %self.label, attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.reconnect_timer.lock().take();
            if this.core.is_disposed() || !this.link.is_empty() {
                return;
            }
            this.connect_now();
        });
        let handle = task.abort_handle();
        *timer = Some(handle.clone());
        drop(timer);
        self.track(handle);
    }

    fn cancel_reconnect(&self) {
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
    }

    fn start_connecting(self: &Arc<Self>) -> Result<()> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Hook(format!("no async runtime to connect {}: {e}", self.label)))?;
        self.connect_now();
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        self.core.dispose(|| {
            self.abort_tasks();
            self.link.swap(None);
            if let Some(attempt) = self.connecting.swap(None) {
                attempt.outcome.send_replace(Some(Err(self.closed())));
            }
            let failed = self.fail_outstanding(&Error::ConnectionLost);
            info!(client = %self.label, failed, "Client disposed");
            Ok(())
        })
    }
}

#[async_trait]
impl<F, C> Lifecycle for SequencedClient<F, C>
where
    F: ConnectionFactory,
    C: SequencedCodec<Outbound = F::Outbound, Inbound = F::Inbound>,
{
    fn state(&self) -> State {
        self.shared.core.state()
    }

    fn start(&self) -> Result<()> {
        self.shared.core.start(|| self.shared.start_connecting())
    }

    fn pause(&self) {
        self.shared.core.pause();
    }

    fn dispose(&self) -> Result<()> {
        self.shared.dispose()
    }

    fn is_disposed(&self) -> bool {
        self.shared.core.is_disposed()
    }

    fn on_state_changed(&self, listener: StateListener) -> ListenerHandle {
        self.shared.core.on_state_changed(listener)
    }
}

impl<F, C> Drop for SequencedClient<F, C>
where
    F: ConnectionFactory,
    C: SequencedCodec<Outbound = F::Outbound, Inbound = F::Inbound>,
{
    fn drop(&mut self) {
        let _ = self.shared.dispose();
    }
}

impl<F, C> std::fmt::Debug for SequencedClient<F, C>
where
    F: ConnectionFactory,
    C: SequencedCodec<Outbound = F::Outbound, Inbound = F::Inbound>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencedClient")
            .field("label", &self.shared.label)
            .field("state", &self.shared.core.state())
            .field("connected", &!self.shared.link.is_empty())
            .field("outstanding", &self.shared.pending.len())
            .finish()
    }
}

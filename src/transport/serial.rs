//! A single-flight request queue over a half-duplex port.
//!
//! Many callers submit requests concurrently; one request at a time is in
//! flight on the wire. Responses are matched purely by arrival order.
//!
//! 半双工端口上的单飞请求队列。多个调用者并发提交请求；线路上同一时间只有
//! 一个请求在途。响应完全按到达顺序匹配。

mod actor;

use self::actor::{PortActor, PortCommand, PortIo};
use super::{
    parser::FrameParser,
    pending::{PendingRequest, ResponseReceiver},
};
use crate::{
    config::{SerialConfig, TimeoutPolicy},
    error::{Error, Result},
    lifecycle::{Lifecycle, LifecycleCore, ListenerHandle, State, StateListener},
    sync::AtomicSlot,
};
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::{
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::Instant,
};
use tracing::{debug, info, trace, warn};

pub(crate) type SerialRequest = PendingRequest<Bytes, Bytes>;

/// A snapshot of the traffic counters of a [`SerialClient`].
///
/// [`SerialClient`] 流量计数器的快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialMetrics {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub completed: u64,
    pub timed_out: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) bytes_received: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) timed_out: AtomicU64,
}

/// State shared between the client handle, its port actor and its timers.
pub(crate) struct Shared {
    pub(crate) path: String,
    pub(crate) config: SerialConfig,
    pub(crate) core: LifecycleCore,
    queue: ArrayQueue<Arc<SerialRequest>>,
    pub(crate) in_flight: AtomicSlot<SerialRequest>,
    wip: AtomicUsize,
    commands: mpsc::UnboundedSender<PortCommand>,
    // Port and command receiver, until `start()` hands them to the actor.
    idle_port: Mutex<Option<(PortIo, mpsc::UnboundedReceiver<PortCommand>)>>,
    pub(crate) counters: Counters,
}

/// A half-duplex client, e.g. for a serial bus.
///
/// Requests queue in FIFO order; dispatch happens on a single port task that
/// owns the reader, the writer and the frame parser. The port is not touched
/// until [`Lifecycle::start`] is called. Dropping the client disposes it.
///
/// 半双工客户端，例如用于串口总线。请求按先进先出排队；分发在持有读端、写端和
/// 帧解析器的单个端口任务上进行。调用 [`Lifecycle::start`] 之前不会访问端口。
/// 丢弃客户端会释放它。
pub struct SerialClient {
    shared: Arc<Shared>,
}

/// The responses to one request, ending on timeout, on reaching the maximum
/// count, or on disposal. A timeout before the first frame yields
/// [`Error::Timeout`] under [`TimeoutPolicy::Fail`]. Dropping the stream
/// cancels the request.
///
/// 一个请求的响应流。丢弃该流会取消请求。
pub struct ResponseStream {
    receiver: ResponseReceiver<Bytes>,
    request: Arc<SerialRequest>,
    shared: Weak<Shared>,
}

impl SerialClient {
    /// Creates a client over `reader` / `writer`. `path` names the port in
    /// errors and logs.
    ///
    /// 在 `reader` / `writer` 之上创建客户端。`path` 用于在错误和日志中标识端口。
    pub fn new<R, W, P>(
        path: impl Into<String>,
        reader: R,
        writer: W,
        parser: P,
        config: SerialConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        P: FrameParser,
    {
        let path = path.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let port = PortIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
            parser: Box::new(parser),
        };
        let shared = Arc::new(Shared {
            core: LifecycleCore::new(path.clone()),
            queue: ArrayQueue::new(config.max_queue_size.max(1)),
            in_flight: AtomicSlot::empty(),
            wip: AtomicUsize::new(0),
            commands,
            idle_port: Mutex::new(Some((port, command_rx))),
            counters: Counters::default(),
            path,
            config,
        });
        Self { shared }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Whether the port is open and serving.
    /// 端口是否已打开并正在服务。
    pub fn is_connected(&self) -> bool {
        !self.shared.core.is_disposed() && self.shared.core.state() == State::Running
    }

    pub fn metrics(&self) -> SerialMetrics {
        let counters = &self.shared.counters;
        SerialMetrics {
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Registers an action to run when the client is disposed.
    /// 注册客户端释放时执行的动作。
    pub fn on_closed(&self, action: impl FnOnce() + Send + 'static) {
        self.shared.core.do_on_stop(action);
    }

    /// Sends `payload` and streams back every frame received until `timeout`
    /// expires or `max_responses` frames arrived.
    ///
    /// Submission never blocks: a full queue or a disposed client surfaces as
    /// the first item of the stream.
    ///
    /// 发送 `payload`，并以流的形式返回在 `timeout` 到期或收到 `max_responses`
    /// 帧之前收到的所有帧。提交从不阻塞。
    pub fn send_and_receive_multi(
        &self,
        payload: Bytes,
        timeout: Duration,
        max_responses: Option<usize>,
    ) -> ResponseStream {
        let (request, receiver) = PendingRequest::new(payload, Some(timeout), max_responses);
        self.shared.submit(request.clone());
        ResponseStream {
            receiver,
            request,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Sends `payload` and waits for a single response frame.
    ///
    /// Returns `Ok(None)` when the request ended without a frame, which only
    /// happens under [`TimeoutPolicy::Complete`].
    ///
    /// 发送 `payload` 并等待单个响应帧。
    pub async fn send_and_receive(&self, payload: Bytes, timeout: Duration) -> Result<Option<Bytes>> {
        let mut responses = self.send_and_receive_multi(payload, timeout, Some(1));
        responses.next().await.transpose()
    }

    /// Number of requests waiting behind the in-flight one.
    /// 排在在途请求之后等待的请求数量。
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Shared {
    fn closed(&self) -> Error {
        Error::AlreadyClosed(self.path.clone())
    }

    fn submit(self: &Arc<Self>, request: Arc<SerialRequest>) {
        if self.core.is_disposed() {
            request.fail(self.closed());
            return;
        }
        if let Err(request) = self.queue.push(request) {
            debug!(path = %self.path, "Request queue is full");
            request.fail(Error::QueueFull {
                capacity: self.queue.capacity(),
            });
            return;
        }
        // Lost a race with dispose: nothing will drain this queue any more.
        if self.core.is_disposed() {
            self.fail_queued();
            return;
        }
        self.drain();
    }

    /// Moves queued requests into the in-flight slot, one at a time.
    ///
    /// Whoever raises `wip` from zero owns the loop; everyone else only bumps
    /// the counter so the owner re-checks for work before leaving.
    pub(crate) fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            while self.in_flight.is_empty() {
                let Some(request) = self.queue.pop() else {
                    break;
                };
                if request.is_gone() {
                    trace!(path = %self.path, "Skipping cancelled request");
                    continue;
                }
                if self.core.is_disposed() {
                    request.fail(self.closed());
                    continue;
                }
                if self.in_flight.compare_and_set(None, Some(request.clone())) {
                    self.dispatch(request);
                } else {
                    if let Err(request) = self.queue.push(request) {
                        request.fail(Error::QueueFull {
                            capacity: self.queue.capacity(),
                        });
                    }
                    break;
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, request: Arc<SerialRequest>) {
        debug!(path = %self.path, "Dispatching request");
        self.arm_timeout(&request);
        if let Err(mpsc::error::SendError(PortCommand::Write(request))) =
            self.commands.send(PortCommand::Write(request))
        {
            request.fail(self.closed());
            self.in_flight.compare_and_set(Some(&request), None);
        }
    }

    /// Starts the timeout clock of a request that just went in flight.
    ///
    /// Outside an async runtime the clock is deferred to the port task,
    /// which arms it when it picks the request up.
    ///
    /// 为刚进入在途状态的请求启动超时计时。没有异步运行时时，由端口任务在取到
    /// 请求时补充启动。
    pub(crate) fn arm_timeout(self: &Arc<Self>, request: &Arc<SerialRequest>) {
        let Some(timeout) = request.timeout() else {
            return;
        };
        if request.deadline().is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!(path = %self.path, "No runtime at dispatch, deferring timeout");
            return;
        };
        let deadline = Instant::now() + timeout;
        let shared = self.clone();
        let timed = request.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            shared.on_timeout(&timed);
        });
        request.arm_timer(deadline, timer.abort_handle());
    }

    /// Frees the in-flight slot if `request` still holds it, then drains.
    /// 如果 `request` 仍占据在途槽位则释放它，然后继续分发。
    pub(crate) fn release(self: &Arc<Self>, request: &Arc<SerialRequest>) {
        if self.in_flight.compare_and_set(Some(request), None) {
            self.drain();
        }
    }

    pub(crate) fn on_timeout(self: &Arc<Self>, request: &Arc<SerialRequest>) {
        if !self.in_flight.holds(request) {
            return;
        }
        // A stuck partial frame must not leak into the next response.
        let _ = self.commands.send(PortCommand::ResetParser);
        // A stream that already produced frames simply ends.
        let ended = match self.config.timeout_policy {
            TimeoutPolicy::Fail if !request.responded() => request.fail(Error::Timeout {
                target: self.path.clone(),
            }),
            _ => request.complete(),
        };
        if ended {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(path = %self.path, timeout = ?request.timeout(), "Request timed out");
        }
        self.release(request);
    }

    fn start_port(self: &Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Hook(format!("no async runtime to open {}: {e}", self.path)))?;
        let Some((port, command_rx)) = self.idle_port.lock().take() else {
            // Restarting after a pause: the port task is still running.
            return Ok(());
        };
        let actor = PortActor::new(self.clone(), port, command_rx);
        let task = runtime.spawn(actor.run());
        let abort = task.abort_handle();
        self.core.do_on_stop(move || abort.abort());
        info!(path = %self.path, "Port opened");
        Ok(())
    }

    fn fail_queued(&self) {
        while let Some(request) = self.queue.pop() {
            request.fail(self.closed());
        }
    }

    pub(crate) fn dispose(&self) -> Result<()> {
        self.core.dispose(|| {
            if let Some((mut port, _)) = self.idle_port.lock().take() {
                port.parser.close();
            }
            if let Some(request) = self.in_flight.swap(None) {
                request.fail(self.closed());
            }
            self.fail_queued();
            info!(path = %self.path, "Port closed");
            Ok(())
        })
    }
}

#[async_trait]
impl Lifecycle for SerialClient {
    fn state(&self) -> State {
        self.shared.core.state()
    }

    fn start(&self) -> Result<()> {
        self.shared.core.start(|| self.shared.start_port())
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

impl Drop for SerialClient {
    fn drop(&mut self) {
        let _ = self.shared.dispose();
    }
}

impl std::fmt::Debug for SerialClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialClient")
            .field("path", &self.shared.path)
            .field("state", &self.shared.core.state())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.request.cancel() {
            if let Some(shared) = self.shared.upgrade() {
                trace!(path = %shared.path, "Request cancelled by caller");
                shared.release(&self.request);
            }
        }
    }
}

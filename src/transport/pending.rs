//! The correlation record between one outbound write and its response(s).
//!
//! 一次出站写入与其响应之间的关联记录。
//!
//! A [`PendingRequest`] is "gone" once its payload has been released. That
//! single slot answers every "is this still actionable?" question: emitting a
//! frame, failing, completing and cancelling all race on it, and exactly one
//! of the terminal operations wins.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::AbortHandle, time::Instant};

/// The result of delivering a response to a [`PendingRequest`].
/// 向 [`PendingRequest`] 交付响应的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    /// Delivered; the request wants more responses.
    /// 已交付；请求还需要更多响应。
    More,
    /// Delivered, and that was the last one the request accepts.
    /// 已交付，且这是请求接受的最后一个响应。
    Done,
    /// The request was already gone; nothing was delivered.
    /// 请求已不存在；未交付任何内容。
    Gone,
}

struct Active<P, T> {
    payload: P,
    sink: mpsc::UnboundedSender<Result<T>>,
}

/// A request awaiting its response(s).
///
/// 等待响应的请求。
pub struct PendingRequest<P, T> {
    active: Mutex<Option<Active<P, T>>>,
    remaining: AtomicUsize,
    responded: AtomicBool,
    timeout: Option<Duration>,
    timer: Mutex<Option<AbortHandle>>,
    deadline: Mutex<Option<Instant>>,
}

/// The receiving half handed to the caller.
/// 交给调用者的接收端。
pub type ResponseReceiver<T> = mpsc::UnboundedReceiver<Result<T>>;

impl<P, T> PendingRequest<P, T> {
    /// Creates a request accepting up to `max_responses` responses (`None`
    /// for unbounded; `Some(0)` is treated as one).
    ///
    /// 创建最多接受 `max_responses` 个响应的请求（`None` 表示不限）。
    pub fn new(
        payload: P,
        timeout: Option<Duration>,
        max_responses: Option<usize>,
    ) -> (Arc<Self>, ResponseReceiver<T>) {
        let (sink, receiver) = mpsc::unbounded_channel();
        let remaining = max_responses.map_or(usize::MAX, |max| max.max(1));
        let request = Arc::new(Self {
            active: Mutex::new(Some(Active { payload, sink })),
            remaining: AtomicUsize::new(remaining),
            responded: AtomicBool::new(false),
            timeout,
            timer: Mutex::new(None),
            deadline: Mutex::new(None),
        });
        (request, receiver)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether the request has reached a terminal outcome or been cancelled.
    /// 请求是否已到达终止结果或已被取消。
    pub fn is_gone(&self) -> bool {
        self.active.lock().is_none()
    }

    /// Whether at least one response was delivered.
    /// 是否至少交付过一个响应。
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Returns a copy of the payload while the request is still actionable.
    /// 在请求仍可处理时返回负载的副本。
    pub fn payload(&self) -> Option<P>
    where
        P: Clone,
    {
        self.active.lock().as_ref().map(|active| active.payload.clone())
    }

    /// Delivers one response.
    /// 交付一个响应。
    pub fn emit(&self, value: T) -> Emit {
        let mut guard = self.active.lock();
        let Some(active) = guard.as_ref() else {
            return Emit::Gone;
        };
        if active.sink.send(Ok(value)).is_err() {
            // The caller stopped listening.
            guard.take();
            drop(guard);
            self.stop_timer();
            return Emit::Gone;
        }
        self.responded.store(true, Ordering::Release);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            guard.take();
            drop(guard);
            self.stop_timer();
            return Emit::Done;
        }
        Emit::More
    }

    /// Fails the request with `error`. Returns `false` if it was already gone.
    /// 以 `error` 结束请求。若请求已不存在则返回 `false`。
    pub fn fail(&self, error: Error) -> bool {
        match self.release() {
            Some(active) => {
                let _ = active.sink.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Ends the response stream without an error.
    /// 无错误地结束响应流。
    pub fn complete(&self) -> bool {
        self.release().is_some()
    }

    /// Cancels the request on behalf of its caller.
    /// 代表调用者取消请求。
    pub fn cancel(&self) -> bool {
        self.release().is_some()
    }

    /// When the armed timeout fires, if a timer was armed.
    /// 已关联的超时计时器的到期时刻。
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Attaches the timeout timer expiring at `deadline` so a terminal
    /// outcome can stop it.
    ///
    /// 关联在 `deadline` 到期的超时计时器，以便终止结果可以停止它。
    pub fn arm_timer(&self, deadline: Instant, timer: AbortHandle) {
        *self.deadline.lock() = Some(deadline);
        *self.timer.lock() = Some(timer);
        if self.is_gone() {
            self.stop_timer();
        }
    }

    fn release(&self) -> Option<Active<P, T>> {
        let active = self.active.lock().take();
        if active.is_some() {
            self.stop_timer();
        }
        active
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

impl<P, T> std::fmt::Debug for PendingRequest<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("gone", &self.is_gone())
            .field("timeout", &self.timeout)
            .finish()
    }
}

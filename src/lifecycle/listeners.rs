//! State-change listener registration.
//!
//! 状态变化监听器的注册。

use super::state::State;
use parking_lot::Mutex;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};
use tracing::trace;

/// A callback receiving `(before, after)` on every state change.
///
/// 每次状态变化时接收 `(before, after)` 的回调。
pub type StateListener = Arc<dyn Fn(State, State) + Send + Sync>;

type Entries = Mutex<Option<Vec<(u64, StateListener)>>>;

/// An ordered observer list. The list itself is dropped when the last
/// listener is removed.
///
/// 有序的观察者列表。最后一个监听器被移除时，列表本身也会被释放。
pub struct ListenerRegistry {
    entries: Arc<Entries>,
    next_id: AtomicU64,
}

/// De-registration handle returned by [`ListenerRegistry::register`].
///
/// Dropping the handle keeps the listener registered; call
/// [`ListenerHandle::dispose`] to remove it.
///
/// 由 [`ListenerRegistry::register`] 返回的注销句柄。丢弃句柄不会注销监听器，
/// 需要调用 [`ListenerHandle::dispose`]。
#[derive(Debug)]
pub struct ListenerHandle {
    entries: Weak<Entries>,
    id: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Appends a listener.
    /// 追加一个监听器。
    pub fn register(&self, listener: StateListener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .get_or_insert_with(Vec::new)
            .push((id, listener));
        ListenerHandle {
            entries: Arc::downgrade(&self.entries),
            id,
        }
    }

    /// Invokes every listener in registration order. Listeners run outside
    /// the registry lock, so they may register or dispose listeners.
    ///
    /// 按注册顺序调用所有监听器。监听器在锁外执行。
    pub fn fire(&self, before: State, after: State) {
        let snapshot: Vec<StateListener> = match &*self.entries.lock() {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };
        trace!(%before, %after, listeners = snapshot.len(), "Firing state listeners");
        for listener in snapshot {
            listener(before, after);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_released(&self) -> bool {
        self.entries.lock().is_none()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerHandle {
    /// Removes the listener. Idempotent.
    /// 移除监听器。幂等。
    pub fn dispose(&self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut guard = entries.lock();
        if let Some(list) = guard.as_mut() {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                *guard = None;
            }
        }
    }
}

//! Defines the finite state model shared by every managed resource.
//!
//! 定义所有受管资源共享的有限状态模型。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// The state of a managed resource.
/// 受管资源的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Created but never started.
    /// 已创建但从未启动。
    Initializing = 0,
    /// The start hook is running.
    /// 启动钩子正在执行。
    Starting = 1,
    /// Started and serving.
    /// 已启动并正在服务。
    Running = 2,
    /// Paused by its owner.
    /// 被所有者暂停。
    Paused = 3,
    /// Disposed. Terminal.
    /// 已释放。终止状态。
    Stopped = 4,
    /// The host platform shut the resource down.
    /// 宿主平台关闭了该资源。
    Shutdown = 5,
    /// The underlying connection dropped; a reconnect may follow.
    /// 底层连接已断开，之后可能会重连。
    ConnectionClosed = 6,
}

impl State {
    /// The identifier of the state.
    /// 状态标识。
    pub const fn name(self) -> &'static str {
        match self {
            State::Initializing => "initializing",
            State::Starting => "starting",
            State::Running => "running",
            State::Paused => "paused",
            State::Stopped => "stopped",
            State::Shutdown => "shutdown",
            State::ConnectionClosed => "connectionClosed",
        }
    }

    /// A human-readable label.
    /// 人类可读的标签。
    pub const fn text(self) -> &'static str {
        match self {
            State::Initializing => "Initializing",
            State::Starting => "Starting",
            State::Running => "Running",
            State::Paused => "Paused",
            State::Stopped => "Stopped",
            State::Shutdown => "Shut down",
            State::ConnectionClosed => "Connection closed",
        }
    }

    /// Whether `start()` may move a resource out of this state.
    /// `start()` 是否可以让资源离开此状态。
    pub const fn is_startable(self) -> bool {
        matches!(
            self,
            State::Initializing | State::Paused | State::Stopped
        )
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Initializing,
            1 => State::Starting,
            2 => State::Running,
            3 => State::Paused,
            4 => State::Stopped,
            5 => State::Shutdown,
            _ => State::ConnectionClosed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A `State` cell whose transitions are atomic.
///
/// 状态转换为原子操作的 `State` 单元。
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub const fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Sets `new` only if the current state is `expect`.
    /// 仅当当前状态为 `expect` 时才设置为 `new`。
    pub fn compare_and_set(&self, expect: State, new: State) -> bool {
        self.0
            .compare_exchange(expect as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sets `new` unconditionally and returns the previous state.
    /// 无条件设置为 `new` 并返回之前的状态。
    pub fn swap(&self, new: State) -> State {
        State::from_u8(self.0.swap(new as u8, Ordering::AcqRel))
    }
}

/// An optional `State` cell, empty until something is stored.
///
/// 可选的 `State` 单元，在写入前为空。
#[derive(Debug)]
pub(crate) struct OptionalState(AtomicU8);

impl OptionalState {
    const UNSET: u8 = u8::MAX;

    pub(crate) const fn empty() -> Self {
        Self(AtomicU8::new(Self::UNSET))
    }

    pub(crate) fn load(&self) -> Option<State> {
        match self.0.load(Ordering::Acquire) {
            Self::UNSET => None,
            raw => Some(State::from_u8(raw)),
        }
    }

    pub(crate) fn store(&self, state: Option<State>) {
        let raw = state.map_or(Self::UNSET, |s| s as u8);
        self.0.store(raw, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_raw() {
        for state in [
            State::Initializing,
            State::Starting,
            State::Running,
            State::Paused,
            State::Stopped,
            State::Shutdown,
            State::ConnectionClosed,
        ] {
            let cell = AtomicState::new(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn test_compare_and_set() {
        let cell = AtomicState::new(State::Initializing);
        assert!(cell.compare_and_set(State::Initializing, State::Starting));
        assert!(!cell.compare_and_set(State::Initializing, State::Running));
        assert_eq!(cell.load(), State::Starting);
        assert_eq!(cell.swap(State::Paused), State::Starting);
    }

    #[test]
    fn test_startable_states() {
        assert!(State::Initializing.is_startable());
        assert!(State::Paused.is_startable());
        assert!(State::Stopped.is_startable());
        assert!(!State::Running.is_startable());
        assert!(!State::Starting.is_startable());
        assert_eq!(State::ConnectionClosed.to_string(), "connectionClosed");
    }

    #[test]
    fn test_optional_state() {
        let cell = OptionalState::empty();
        assert_eq!(cell.load(), None);
        cell.store(Some(State::Running));
        assert_eq!(cell.load(), Some(State::Running));
        cell.store(None);
        assert_eq!(cell.load(), None);
    }
}

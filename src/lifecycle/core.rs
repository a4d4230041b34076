//! The lifecycle core embedded by every runtime: current state, teardown
//! registry and listener list.
//!
//! 每个运行时内嵌的生命周期核心：当前状态、释放动作注册表和监听器列表。

use super::{
    listeners::{ListenerHandle, ListenerRegistry, StateListener},
    state::{AtomicState, State},
};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

/// A disposal-time cleanup action.
/// 释放时执行的清理动作。
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Start / pause / dispose semantics over an atomic [`State`].
///
/// Transitions are CAS guarded; listeners fire once per successful transition.
/// Disposal runs exactly once no matter how many threads call it.
///
/// 基于原子 [`State`] 的启动/暂停/释放语义。转换由 CAS 保护；每次成功转换
/// 监听器触发一次。无论多少线程调用，释放只执行一次。
pub struct LifecycleCore {
    label: String,
    state: AtomicState,
    disposed: AtomicBool,
    // `None` once disposal has begun.
    teardown: Mutex<Option<Vec<Teardown>>>,
    listeners: ListenerRegistry,
}

impl LifecycleCore {
    /// Creates a core in [`State::Initializing`]. `label` names the resource
    /// in log output.
    ///
    /// 创建处于 [`State::Initializing`] 的核心。`label` 用于日志中标识资源。
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: AtomicState::new(State::Initializing),
            disposed: AtomicBool::new(false),
            teardown: Mutex::new(Some(Vec::new())),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> State {
        self.state.load()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// CAS transition from `expect` to `new`. Fires listeners on success.
    /// 从 `expect` 到 `new` 的 CAS 转换。成功时触发监听器。
    pub fn change_state(&self, expect: State, new: State) -> bool {
        if self.state.compare_and_set(expect, new) {
            debug!(resource = %self.label, from = %expect, to = %new, "State changed");
            self.listeners.fire(expect, new);
            true
        } else {
            false
        }
    }

    /// Unconditional transition. Fires listeners only if the value changed.
    /// 无条件转换。仅当值发生变化时触发监听器。
    pub fn set_state(&self, new: State) -> bool {
        let before = self.state.swap(new);
        if before != new {
            debug!(resource = %self.label, from = %before, to = %new, "State changed");
            self.listeners.fire(before, new);
            true
        } else {
            false
        }
    }

    /// Moves a startable resource to `Starting`, runs `hook`, then moves it to
    /// `Running`. A no-op once disposed or when already starting/running.
    ///
    /// If the hook fails the state is restored to what it was before, so a
    /// later `start()` may try again, and the error is returned.
    ///
    /// 将可启动的资源切换到 `Starting`，执行 `hook`，然后切换到 `Running`。
    /// 钩子失败时恢复原状态并返回错误。
    pub fn start(&self, hook: impl FnOnce() -> Result<()>) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let mut before = self.state();
        loop {
            if !before.is_startable() {
                trace!(resource = %self.label, state = %before, "Start ignored");
                return Ok(());
            }
            if self.change_state(before, State::Starting) {
                break;
            }
            before = self.state();
        }
        // Disposed while we moved to `Starting`.
        if self.is_disposed() {
            self.change_state(State::Starting, State::Stopped);
            return Ok(());
        }

        if let Err(e) = hook() {
            warn!(resource = %self.label, error = %e, "Start hook failed");
            self.change_state(State::Starting, before);
            return Err(e);
        }

        self.change_state(State::Starting, State::Running);
        Ok(())
    }

    /// Sets `Paused` unconditionally, unless disposed.
    /// 除非已释放，否则无条件设置为 `Paused`。
    pub fn pause(&self) {
        if self.is_disposed() {
            return;
        }
        self.set_state(State::Paused);
        if self.is_disposed() {
            self.change_state(State::Paused, State::Stopped);
        }
    }

    /// Runs every teardown action, then `hook`, then sets `Stopped`.
    ///
    /// Only the first call does anything. The hook's error is returned after
    /// the state has been set to `Stopped`.
    ///
    /// 执行所有释放动作，然后执行 `hook`，最后设置为 `Stopped`。只有第一次调用生效。
    pub fn dispose(&self, hook: impl FnOnce() -> Result<()>) -> Result<()> {
        let actions = {
            let mut guard = self.teardown.lock();
            match guard.take() {
                Some(actions) => {
                    self.disposed.store(true, Ordering::Release);
                    actions
                }
                None => return Ok(()),
            }
        };

        debug!(resource = %self.label, teardown = actions.len(), "Disposing");
        for action in actions {
            action();
        }
        let result = hook();
        self.set_state(State::Stopped);
        result
    }

    /// Registers a teardown action. Runs it at once if already disposed.
    /// 注册释放动作。若已释放则立即执行。
    pub fn do_on_stop(&self, action: impl FnOnce() + Send + 'static) {
        let mut guard = self.teardown.lock();
        match guard.as_mut() {
            Some(actions) => actions.push(Box::new(action)),
            None => {
                drop(guard);
                action();
            }
        }
    }

    pub fn on_state_changed(&self, listener: StateListener) -> ListenerHandle {
        self.listeners.register(listener)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}

impl std::fmt::Debug for LifecycleCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCore")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .field("listeners", &self.listeners)
            .finish()
    }
}

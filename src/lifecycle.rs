//! Lifecycle management for long-lived runtimes.
//!
//! Every transport and the hot-reload controller expose the same [`Lifecycle`]
//! contract: a CAS-guarded [`State`], start / pause / dispose and state-change
//! listeners. [`LifecycleCore`] holds the shared machinery; runtimes embed it.
//!
//! 长生命周期运行时的生命周期管理。
//!
//! 所有传输和热重载控制器都暴露相同的 [`Lifecycle`] 约定：受 CAS 保护的
//! [`State`]、启动/暂停/释放以及状态变化监听器。[`LifecycleCore`] 持有共享的
//! 机制，由各运行时内嵌。

pub mod controller;
pub mod core;
pub mod listeners;
pub mod state;

use crate::error::Result;
use async_trait::async_trait;

pub use self::core::{LifecycleCore, Teardown};
pub use controller::{LifecycleController, LifecycleHooks};
pub use listeners::{ListenerHandle, ListenerRegistry, StateListener};
pub use state::{AtomicState, State};

/// The contract of a managed runtime.
///
/// 受管运行时的约定。
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// The current state.
    /// 当前状态。
    fn state(&self) -> State;

    /// Probes the live resource. Defaults to [`Lifecycle::state`].
    /// 探测实际资源的状态。默认返回 [`Lifecycle::state`]。
    async fn check_state(&self) -> State {
        self.state()
    }

    /// Starts the runtime. A no-op once disposed.
    /// 启动运行时。释放后调用无效。
    fn start(&self) -> Result<()>;

    /// Pauses the runtime. A no-op once disposed.
    /// 暂停运行时。释放后调用无效。
    fn pause(&self);

    /// Disposes the runtime. Only the first call has any effect.
    /// 释放运行时。只有第一次调用生效。
    fn dispose(&self) -> Result<()>;

    fn is_disposed(&self) -> bool;

    /// Registers a `(before, after)` listener.
    /// 注册一个 `(before, after)` 监听器。
    fn on_state_changed(&self, listener: StateListener) -> ListenerHandle;
}

//! A ready-made [`Lifecycle`] assembled from start / stop hooks.
//!
//! 由启动/停止钩子组装而成的现成 [`Lifecycle`]。

use super::{Lifecycle, LifecycleCore, ListenerHandle, State, StateListener};
use crate::error::Result;
use async_trait::async_trait;

/// The hooks a [`LifecycleController`] runs around its transitions.
///
/// 由 [`LifecycleController`] 在状态转换前后执行的钩子。
#[async_trait]
pub trait LifecycleHooks: Send + Sync + 'static {
    /// Runs while the state is `Starting`. The core is passed so the hook can
    /// register teardown actions.
    /// 在状态为 `Starting` 时执行。传入核心以便钩子注册释放动作。
    fn start0(&self, core: &LifecycleCore) -> Result<()>;

    /// Runs once during disposal, after the teardown actions.
    /// 在释放期间、释放动作之后执行一次。
    fn stop0(&self) -> Result<()> {
        Ok(())
    }

    /// Probes the live resource. `current` is the recorded state.
    /// 探测实际资源。`current` 为记录的状态。
    async fn check_state0(&self, current: State) -> State {
        current
    }
}

/// A runtime whose behaviour lives entirely in its [`LifecycleHooks`].
///
/// 行为完全由 [`LifecycleHooks`] 决定的运行时。
#[derive(Debug)]
pub struct LifecycleController<H> {
    core: LifecycleCore,
    hooks: H,
}

impl<H: LifecycleHooks> LifecycleController<H> {
    pub fn new(label: impl Into<String>, hooks: H) -> Self {
        Self {
            core: LifecycleCore::new(label),
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn core(&self) -> &LifecycleCore {
        &self.core
    }
}

#[async_trait]
impl<H: LifecycleHooks> Lifecycle for LifecycleController<H> {
    fn state(&self) -> State {
        self.core.state()
    }

    async fn check_state(&self) -> State {
        if self.core.is_disposed() {
            return State::Stopped;
        }
        self.hooks.check_state0(self.core.state()).await
    }

    fn start(&self) -> Result<()> {
        self.core.start(|| self.hooks.start0(&self.core))
    }

    fn pause(&self) {
        self.core.pause();
    }

    fn dispose(&self) -> Result<()> {
        self.core.dispose(|| self.hooks.stop0())
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    fn on_state_changed(&self, listener: StateListener) -> ListenerHandle {
        self.core.on_state_changed(listener)
    }
}

//! Hot reload: swap a running instance for one built from new configuration,
//! rolling back when the replacement fails.
//!
//! 热重载：用根据新配置构建的实例替换正在运行的实例，替换失败时回滚。
//!
//! A reload records the new configuration at once, builds the replacement in
//! the background, swaps it into the slot by CAS, disposes the superseded
//! instance and starts the new one. A failed build or start restores the
//! previous configuration and instance. When the restored instance can no
//! longer serve (it was already disposed by the swap), one more attempt runs
//! with the restored configuration; that attempt never retries again.

use crate::{
    config::ReloadConfig,
    error::{Error, Result},
    lifecycle::{Lifecycle, ListenerHandle, ListenerRegistry, State, StateListener, state::OptionalState},
    sync::{AtomicSlot, compare_and_set_arc},
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Builds instances for a [`HotReload`] controller.
///
/// 为 [`HotReload`] 控制器构建实例。
#[async_trait]
pub trait Loader: Send + Sync + 'static {
    /// Configuration of the runtime itself.
    type Runtime: Send + Sync + 'static;
    /// Configuration owned by the managing platform.
    type Managed: Send + Sync + 'static;
    type Instance: Lifecycle;

    /// Builds a new, not yet started instance. `Ok(None)` completes the reload
    /// without replacing anything.
    ///
    /// Building must have no side effects that outlive the returned value:
    /// a value that loses the swap is disposed without being started.
    ///
    /// 构建一个尚未启动的新实例。返回 `Ok(None)` 时重载完成但不替换任何实例。
    async fn build(
        &self,
        runtime: &Self::Runtime,
        managed: &Self::Managed,
    ) -> Result<Option<Arc<Self::Instance>>>;

    /// Receives every failed load after it was rolled back.
    /// 接收每一次回滚之后的加载失败。
    fn on_load_error(&self, error: &Error) {
        warn!(error = %error, "加载失败 | Load failed");
    }
}

struct Snapshot<L: Loader> {
    old_runtime: Arc<L::Runtime>,
    old_managed: Arc<L::Managed>,
    new_runtime: Arc<L::Runtime>,
    new_managed: Arc<L::Managed>,
    old_loaded: Option<Arc<L::Instance>>,
}

struct Gate<L: Loader> {
    terminated: bool,
    snapshot: Option<Snapshot<L>>,
    built: Option<Arc<L::Instance>>,
}

/// One in-flight reload. Its terminal handling (success, rollback, or being
/// superseded) happens under `gate`, exactly once.
struct Attempt<L: Loader> {
    id: u64,
    gate: Mutex<Gate<L>>,
    cancel: watch::Sender<bool>,
}

/// What `settle` decided under the gate.
enum Outcome<L: Loader> {
    // A newer reload or dispose already rolled the attempt back.
    Superseded(Option<Arc<L::Instance>>),
    Discard(Option<Arc<L::Instance>>),
    Swapped {
        old: Option<Arc<L::Instance>>,
        instance: Arc<L::Instance>,
    },
    Failed(Error),
}

struct Restore<L: Loader> {
    restored: Option<Arc<L::Instance>>,
    runtime: Arc<L::Runtime>,
    managed: Arc<L::Managed>,
    discarded: Option<Arc<L::Instance>>,
    swapped_back: bool,
}

struct Failure<L: Loader> {
    error: Error,
    restored: Option<Arc<L::Instance>>,
    runtime: Arc<L::Runtime>,
    managed: Arc<L::Managed>,
}

/// A [`Lifecycle`] that proxies a reloadable inner instance.
///
/// State changes of the loaded instance are forwarded to the controller's
/// own listeners.
///
/// 代理可重载内部实例的 [`Lifecycle`]。已加载实例的状态变化会转发给控制器
/// 自身的监听器。
pub struct HotReload<L: Loader> {
    label: String,
    loader: L,
    config: ReloadConfig,
    runtime: ArcSwap<L::Runtime>,
    managed: ArcSwap<L::Managed>,
    loaded: AtomicSlot<L::Instance>,
    loading: AtomicSlot<Attempt<L>>,
    // Flips to `true` on the first load, or on dispose.
    settled: watch::Sender<bool>,
    disposed: AtomicBool,
    paused: AtomicBool,
    managed_state: OptionalState,
    listeners: ListenerRegistry,
    forward: Mutex<Option<ListenerHandle>>,
    next_attempt: AtomicU64,
    this: Weak<Self>,
}

impl<L: Loader> HotReload<L> {
    /// Creates a controller holding `runtime` / `managed` as the current
    /// configuration. Nothing is built until the first reload.
    ///
    /// 创建以 `runtime` / `managed` 为当前配置的控制器。第一次重载之前不会构建任何实例。
    pub fn new(
        label: impl Into<String>,
        loader: L,
        runtime: L::Runtime,
        managed: L::Managed,
        config: ReloadConfig,
    ) -> Arc<Self> {
        let (settled, _) = watch::channel(false);
        Arc::new_cyclic(|this| Self {
            label: label.into(),
            loader,
            config,
            runtime: ArcSwap::from_pointee(runtime),
            managed: ArcSwap::from_pointee(managed),
            loaded: AtomicSlot::empty(),
            loading: AtomicSlot::empty(),
            settled,
            disposed: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            managed_state: OptionalState::empty(),
            listeners: ListenerRegistry::new(),
            forward: Mutex::new(None),
            next_attempt: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn runtime_config(&self) -> Arc<L::Runtime> {
        self.runtime.load_full()
    }

    pub fn managed_config(&self) -> Arc<L::Managed> {
        self.managed.load_full()
    }

    /// The currently loaded instance, if any.
    /// 当前已加载的实例（如果有）。
    pub fn loaded(&self) -> Option<Arc<L::Instance>> {
        self.loaded.load()
    }

    pub fn is_loading(&self) -> bool {
        !self.loading.is_empty()
    }

    /// Reloads with new configuration and waits for the attempt to finish.
    ///
    /// The configuration is visible through [`HotReload::runtime_config`]
    /// right away. A failure is rolled back and reported to
    /// [`Loader::on_load_error`]; it is never returned. Dropping the future
    /// does not cancel the reload. A no-op once disposed.
    ///
    /// 使用新配置重载并等待本次尝试结束。失败会被回滚并报告给
    /// [`Loader::on_load_error`]，不会返回给调用者。
    pub async fn reload(&self, runtime: L::Runtime, managed: L::Managed) {
        self.reload_arcs(Arc::new(runtime), Arc::new(managed)).await;
    }

    /// Rebuilds the instance from the current configuration.
    /// 使用当前配置重新构建实例。
    pub async fn reload_current(&self) {
        self.reload_arcs(self.runtime.load_full(), self.managed.load_full())
            .await;
    }

    async fn reload_arcs(&self, runtime: Arc<L::Runtime>, managed: Arc<L::Managed>) {
        if self.disposed.load(Ordering::Acquire) {
            debug!(controller = %self.label, "Reload ignored, controller disposed");
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let task = tokio::spawn(this.run_reload(runtime, managed));
        if let Err(e) = task.await {
            warn!(controller = %self.label, error = %e, "Reload task ended abnormally");
        }
    }

    /// Records an explicit managed state, reported by
    /// [`HotReload::managed_state`] ahead of the instance's own state.
    ///
    /// 记录显式的托管状态，[`HotReload::managed_state`] 会优先报告它。
    pub fn set_managed_state(&self, state: Option<State>) {
        self.managed_state.store(state);
    }

    /// The state reported to the managing platform.
    ///
    /// `Stopped` once disposed, `Paused` once paused, then the explicit
    /// managed state, then the loaded instance's state, then `Starting`.
    ///
    /// 报告给管理平台的状态。
    pub fn managed_state(&self) -> State {
        if self.disposed.load(Ordering::Acquire) {
            return State::Stopped;
        }
        if self.paused.load(Ordering::Acquire) {
            return State::Paused;
        }
        match self.managed_state.load() {
            Some(state) => state,
            None => self.state(),
        }
    }

    /// Returns the loaded instance, waiting up to
    /// [`ReloadConfig::first_load_wait`] for the first load. Falls back to
    /// whatever is loaded when the wait expires.
    ///
    /// 返回已加载的实例，最多等待 [`ReloadConfig::first_load_wait`] 直到首次加载完成。
    pub async fn await_loaded(&self) -> Option<Arc<L::Instance>> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        if let Some(instance) = self.loaded.load() {
            return Some(instance);
        }
        let mut settled = self.settled.subscribe();
        let waited = tokio::time::timeout(self.config.first_load_wait, async {
            settled.wait_for(|settled| *settled).await.is_ok()
        })
        .await;
        if waited.is_err() {
            debug!(controller = %self.label, "No instance after the first-load wait");
        }
        self.loaded.load()
    }

    /// Runs `f` against the loaded instance, deferring until the first load
    /// when nothing is loaded yet.
    ///
    /// 对已加载的实例执行 `f`；若尚未加载，则推迟到首次加载完成。
    pub async fn execute<R, Fut>(&self, f: impl FnOnce(Arc<L::Instance>) -> Fut) -> Result<R>
    where
        Fut: Future<Output = Result<R>>,
    {
        let instance = self.await_loaded().await.ok_or(Error::NotLoaded)?;
        f(instance).await
    }

    async fn run_reload(self: Arc<Self>, runtime: Arc<L::Runtime>, managed: Arc<L::Managed>) {
        let mut retry_allowed = self.config.retry_after_rollback;
        let (mut runtime, mut managed) = (runtime, managed);
        loop {
            let Some(attempt) = self.begin(runtime.clone(), managed.clone()) else {
                return;
            };
            let mut cancelled = attempt.cancel.subscribe();
            let built = tokio::select! {
                biased;
                _ = cancelled.wait_for(|cancelled| *cancelled) => {
                    debug!(controller = %self.label, attempt = attempt.id, "Reload superseded");
                    return;
                }
                built = self.loader.build(&runtime, &managed) => built,
            };

            let Some(failure) = self.settle(&attempt, built) else {
                return;
            };
            self.loader.on_load_error(&failure.error);

            let restored_is_dead = failure
                .restored
                .as_ref()
                .is_some_and(|instance| instance.is_disposed() && self.loaded.holds(instance));
            if !(retry_allowed && restored_is_dead) {
                return;
            }
            info!(controller = %self.label, "Retrying with the restored configuration");
            retry_allowed = false;
            runtime = failure.runtime;
            managed = failure.managed;
        }
    }

    fn begin(
        &self,
        runtime: Arc<L::Runtime>,
        managed: Arc<L::Managed>,
    ) -> Option<Arc<Attempt<L>>> {
        let (cancel, _) = watch::channel(false);
        let attempt = Arc::new(Attempt {
            id: self.next_attempt.fetch_add(1, Ordering::Relaxed),
            gate: Mutex::new(Gate {
                terminated: false,
                snapshot: None,
                built: None,
            }),
            cancel,
        });
        if let Some(previous) = self.loading.swap(Some(attempt.clone())) {
            self.abandon(&previous);
        }

        let mut gate = attempt.gate.lock();
        if gate.terminated {
            return None;
        }
        let old_runtime = self.runtime.load_full();
        let old_managed = self.managed.load_full();
        compare_and_set_arc(&self.runtime, &old_runtime, runtime.clone());
        compare_and_set_arc(&self.managed, &old_managed, managed.clone());
        gate.snapshot = Some(Snapshot {
            old_runtime,
            old_managed,
            new_runtime: runtime,
            new_managed: managed,
            old_loaded: self.loaded.load(),
        });
        drop(gate);

        debug!(controller = %self.label, attempt = attempt.id, "Reload started");
        Some(attempt)
    }

    /// Applies the build result. Returns the failure to report, if any.
    ///
    /// Only bookkeeping happens under the gate; instances and listeners are
    /// touched after it is released, so they may call back into the
    /// controller.
    fn settle(
        &self,
        attempt: &Arc<Attempt<L>>,
        built: Result<Option<Arc<L::Instance>>>,
    ) -> Option<Failure<L>> {
        let outcome = {
            let mut gate = attempt.gate.lock();
            if gate.terminated {
                Outcome::Superseded(built.ok().flatten())
            } else {
                gate.terminated = true;
                match built {
                    Ok(Some(instance)) => self.claim(&mut gate, instance),
                    Ok(None) => Outcome::Discard(None),
                    Err(e) => Outcome::Failed(e),
                }
            }
        };

        let error = match outcome {
            Outcome::Superseded(instance) => {
                if let Some(instance) = instance {
                    self.discard(&instance);
                }
                return None;
            }
            Outcome::Discard(instance) => {
                if let Some(instance) = instance {
                    self.discard(&instance);
                }
                None
            }
            Outcome::Swapped { old, instance } => self.activate(old, &instance).err(),
            Outcome::Failed(e) => Some(e),
        };
        let failure = error.and_then(|error| {
            let restore = self.rollback(&mut attempt.gate.lock())?;
            self.undo(&restore);
            Some(Failure {
                error,
                restored: restore.restored,
                runtime: restore.runtime,
                managed: restore.managed,
            })
        });

        self.loading.compare_and_set(Some(attempt), None);
        if !self.loaded.is_empty() {
            self.settled.send_replace(true);
        }
        match &failure {
            None => info!(controller = %self.label, attempt = attempt.id, "重载完成 | Reload complete"),
            Some(failure) => {
                warn!(controller = %self.label, attempt = attempt.id, error = %failure.error, "Reload failed, rolled back")
            }
        }
        failure
    }

    /// Swaps `instance` into the slot if the slot still holds what the
    /// attempt began with.
    fn claim(&self, gate: &mut Gate<L>, instance: Arc<L::Instance>) -> Outcome<L> {
        if self.disposed.load(Ordering::Acquire) {
            return Outcome::Discard(Some(instance));
        }
        let old = gate
            .snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.old_loaded.clone());
        if !self
            .loaded
            .compare_and_set(old.as_ref(), Some(instance.clone()))
        {
            debug!(controller = %self.label, "Another reload won the swap, discarding instance");
            return Outcome::Discard(Some(instance));
        }
        gate.built = Some(instance.clone());
        Outcome::Swapped { old, instance }
    }

    /// Retires `old` and starts the freshly swapped-in `instance`.
    fn activate(&self, old: Option<Arc<L::Instance>>, instance: &Arc<L::Instance>) -> Result<()> {
        self.detach_forward();
        if let Some(old) = old {
            self.discard(&old);
        }
        if self.disposed.load(Ordering::Acquire) {
            // Disposed between the swap and now.
            self.loaded.compare_and_set(Some(instance), None);
            self.discard(instance);
            return Ok(());
        }
        if !self.loaded.holds(instance) {
            debug!(controller = %self.label, "Instance replaced before it started");
            return Ok(());
        }
        self.attach_forward(instance);
        instance.start()
    }

    /// Restores the configuration and instance slot captured when `gate`'s
    /// attempt began. The returned [`Restore`] is applied with
    /// [`HotReload::undo`] once the gate is released.
    fn rollback(&self, gate: &mut Gate<L>) -> Option<Restore<L>> {
        let snapshot = gate.snapshot.as_ref()?;
        compare_and_set_arc(
            &self.runtime,
            &snapshot.new_runtime,
            snapshot.old_runtime.clone(),
        );
        compare_and_set_arc(
            &self.managed,
            &snapshot.new_managed,
            snapshot.old_managed.clone(),
        );
        let discarded = gate.built.take();
        let swapped_back = discarded.as_ref().is_some_and(|built| {
            self.loaded
                .compare_and_set(Some(built), snapshot.old_loaded.clone())
        });
        Some(Restore {
            restored: snapshot.old_loaded.clone(),
            runtime: snapshot.old_runtime.clone(),
            managed: snapshot.old_managed.clone(),
            discarded,
            swapped_back,
        })
    }

    fn undo(&self, restore: &Restore<L>) {
        if restore.swapped_back {
            self.detach_forward();
            if let Some(old) = restore.restored.as_ref().filter(|old| !old.is_disposed()) {
                self.attach_forward(old);
            }
        }
        if let Some(built) = &restore.discarded {
            self.discard(built);
        }
    }

    /// Rolls back an attempt that a newer reload (or dispose) replaced.
    fn abandon(&self, attempt: &Arc<Attempt<L>>) {
        let restore = {
            let mut gate = attempt.gate.lock();
            if gate.terminated {
                return;
            }
            gate.terminated = true;
            self.rollback(&mut gate)
        };
        if let Some(restore) = restore {
            self.undo(&restore);
        }
        attempt.cancel.send_replace(true);
        debug!(controller = %self.label, attempt = attempt.id, "Superseded reload rolled back");
    }

    fn discard(&self, instance: &Arc<L::Instance>) {
        if let Err(e) = instance.dispose() {
            warn!(controller = %self.label, error = %e, "Disposing instance failed");
        }
    }

    fn attach_forward(&self, instance: &Arc<L::Instance>) {
        let this = self.this.clone();
        let handle = instance.on_state_changed(Arc::new(move |before, after| {
            if let Some(controller) = this.upgrade() {
                controller.listeners.fire(before, after);
            }
        }));
        let previous = self.forward.lock().replace(handle);
        if let Some(previous) = previous {
            previous.dispose();
        }
    }

    fn detach_forward(&self) {
        let previous = self.forward.lock().take();
        if let Some(previous) = previous {
            previous.dispose();
        }
    }
}

#[async_trait]
impl<L: Loader> Lifecycle for HotReload<L> {
    /// `Stopped` once disposed, `Starting` before anything is loaded, else
    /// the loaded instance's state.
    fn state(&self) -> State {
        if self.disposed.load(Ordering::Acquire) {
            return State::Stopped;
        }
        match self.loaded.load() {
            Some(instance) => instance.state(),
            None => State::Starting,
        }
    }

    async fn check_state(&self) -> State {
        if self.disposed.load(Ordering::Acquire) {
            return State::Stopped;
        }
        match self.await_loaded().await {
            Some(instance) => instance.check_state().await,
            None => State::Starting,
        }
    }

    fn start(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.paused.store(false, Ordering::Release);
        match self.loaded.load() {
            Some(instance) => instance.start(),
            None => Ok(()),
        }
    }

    fn pause(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        self.paused.store(true, Ordering::Release);
        if let Some(instance) = self.loaded.load() {
            instance.pause();
            return;
        }
        // Nothing loaded yet: pause the first instance once it arrives.
        let (Some(this), Ok(runtime)) = (self.this.upgrade(), tokio::runtime::Handle::try_current())
        else {
            return;
        };
        runtime.spawn(async move {
            if let Some(instance) = this.await_loaded().await {
                if this.paused.load(Ordering::Acquire) {
                    instance.pause();
                }
            }
        });
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let before = self
            .loaded
            .load()
            .map_or(State::Starting, |instance| instance.state());
        if let Some(attempt) = self.loading.swap(None) {
            self.abandon(&attempt);
        }
        self.detach_forward();
        let result = match self.loaded.swap(None) {
            Some(instance) => instance.dispose(),
            None => Ok(()),
        };
        self.settled.send_replace(true);
        if before != State::Stopped {
            self.listeners.fire(before, State::Stopped);
        }
        info!(controller = %self.label, "Controller disposed");
        result
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn on_state_changed(&self, listener: StateListener) -> ListenerHandle {
        self.listeners.register(listener)
    }
}

impl<L: Loader> std::fmt::Debug for HotReload<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReload")
            .field("label", &self.label)
            .field("loaded", &!self.loaded.is_empty())
            .field("loading", &!self.loading.is_empty())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleController, LifecycleCore, LifecycleHooks};

    struct Noop;

    impl LifecycleHooks for Noop {
        fn start0(&self, _core: &LifecycleCore) -> Result<()> {
            Ok(())
        }
    }

    /// Builds nothing for even generations.
    struct Alternating;

    #[async_trait]
    impl Loader for Alternating {
        type Runtime = u32;
        type Managed = ();
        type Instance = LifecycleController<Noop>;

        async fn build(&self, runtime: &u32, _managed: &()) -> Result<Option<Arc<Self::Instance>>> {
            if runtime % 2 == 0 {
                return Ok(None);
            }
            Ok(Some(Arc::new(LifecycleController::new(
                format!("gen-{runtime}"),
                Noop,
            ))))
        }
    }

    #[tokio::test]
    async fn test_empty_build_completes_without_swap() {
        let controller = HotReload::new("alt", Alternating, 0, (), ReloadConfig::default());
        controller.reload(2, ()).await;
        assert!(controller.loaded().is_none());
        assert_eq!(*controller.runtime_config(), 2);

        controller.reload(3, ()).await;
        let first = controller.loaded().unwrap();
        controller.reload(4, ()).await;
        assert!(Arc::ptr_eq(&first, &controller.loaded().unwrap()));
        assert_eq!(first.state(), State::Running);
        assert_eq!(*controller.runtime_config(), 4);
    }

    #[tokio::test]
    async fn test_reload_current_rebuilds_from_current_config() {
        let controller = HotReload::new("alt", Alternating, 5, (), ReloadConfig::default());
        controller.reload_current().await;
        let first = controller.loaded().unwrap();
        controller.reload_current().await;
        let second = controller.loaded().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_disposed());
        assert_eq!(second.core().label(), "gen-5");
    }
}

//! Compare-and-swap slots shared by the lifecycle, transport and reload modules.
//!
//! 生命周期、传输和重载模块共用的比较并交换槽位。
//!
//! A slot holds an `Arc` (or nothing) and only changes through
//! [`AtomicSlot::compare_and_set`] or [`AtomicSlot::swap`], so exactly one writer
//! wins any given transition. Identity is pointer identity.

use arc_swap::{ArcSwap, ArcSwapOption};
use std::sync::Arc;

/// An optional `Arc` that is read lock-free and written by CAS.
///
/// 一个可选的 `Arc`，无锁读取，通过 CAS 写入。
pub struct AtomicSlot<T> {
    inner: ArcSwapOption<T>,
}

impl<T> AtomicSlot<T> {
    /// Creates an empty slot.
    /// 创建一个空槽位。
    pub fn empty() -> Self {
        Self {
            inner: ArcSwapOption::empty(),
        }
    }

    /// Creates a slot holding `value`.
    pub fn new(value: Option<Arc<T>>) -> Self {
        Self {
            inner: ArcSwapOption::new(value),
        }
    }

    /// Returns the current value.
    /// 返回当前值。
    pub fn load(&self) -> Option<Arc<T>> {
        self.inner.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_none()
    }

    /// Returns whether the slot currently holds exactly `value`.
    /// 槽位当前是否恰好持有 `value`。
    pub fn holds(&self, value: &Arc<T>) -> bool {
        matches!(&*self.inner.load(), Some(current) if Arc::ptr_eq(current, value))
    }

    /// Unconditionally replaces the value, returning the previous one.
    /// 无条件替换值，并返回旧值。
    pub fn swap(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        self.inner.swap(value)
    }

    /// Replaces the value with `new` only if it is still `current`.
    ///
    /// Returns `true` when this call won the transition.
    ///
    /// 仅当当前值仍为 `current` 时才替换为 `new`。赢得此次转换时返回 `true`。
    pub fn compare_and_set(&self, current: Option<&Arc<T>>, new: Option<Arc<T>>) -> bool {
        let previous = match current {
            Some(current) => self.inner.compare_and_swap(current, new),
            None => self.inner.compare_and_swap(&None::<Arc<T>>, new),
        };
        same((*previous).as_ref(), current)
    }
}

impl<T> Default for AtomicSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> std::fmt::Debug for AtomicSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicSlot")
            .field("occupied", &!self.is_empty())
            .finish()
    }
}

/// CAS on a non-optional `ArcSwap`, by pointer identity.
///
/// 在非可选的 `ArcSwap` 上按指针身份执行 CAS。
pub fn compare_and_set_arc<T>(slot: &ArcSwap<T>, current: &Arc<T>, new: Arc<T>) -> bool {
    let previous = slot.compare_and_swap(current, new);
    Arc::ptr_eq(&previous, current)
}

/// Pointer identity over optional `Arc`s.
pub fn same<T>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

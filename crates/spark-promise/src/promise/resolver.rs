//! 解决器对与解决值。

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use super::{Promise, PromiseCell, Settled};
use crate::error::Rejection;

/// 解决 Promise 的能力。
///
/// # 契约说明（What）
/// - 同一“解决器对”（由同一次创建得到的全部克隆）中，`resolve`、`resolve_with`、`reject` 只有第一次生效；
/// - 采纳 thenable 时会为适配器生成新的解决器对，与原解决器互不影响；
/// - 持有解决器会让对应 Promise 保持存活。
pub struct Resolver<T: 'static> {
    cell: Rc<PromiseCell<T>>,
    resolved: Rc<Cell<bool>>,
}

impl<T: 'static> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
            resolved: Rc::clone(&self.resolved),
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub(crate) fn fresh(cell: Rc<PromiseCell<T>>) -> Self {
        Self {
            cell,
            resolved: Rc::new(Cell::new(false)),
        }
    }

    /// 被解决的 Promise。
    pub fn promise(&self) -> Promise<T> {
        Promise::from_cell(Rc::clone(&self.cell))
    }

    /// 该解决器对是否已经使用过。
    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    pub fn resolve(&self, value: T) {
        if self.resolved.replace(true) {
            return;
        }
        self.cell.fulfill(value);
    }

    /// 以值、Promise 或 thenable 解决。
    pub fn resolve_with(&self, resolution: impl Into<Resolution<T>>) {
        if self.resolved.replace(true) {
            return;
        }
        match resolution.into() {
            Resolution::Value(value) => self.cell.fulfill(value),
            Resolution::Follow(target) => self.cell.follow(Rc::clone(target.cell())),
            Resolution::Adopt(thenable) => self.cell.adopt(thenable),
        }
    }

    pub fn reject(&self, reason: impl Into<Rejection>) {
        if self.resolved.replace(true) {
            return;
        }
        self.cell.reject(reason.into());
    }

    pub fn settle(&self, settled: Settled<T>) {
        match settled {
            Ok(value) => self.resolve(value),
            Err(reason) => self.reject(reason),
        }
    }

    /// 报告进度；只在 Promise 挂起期间有效，监听器在稍后的轮次收到通知。
    pub fn progress(&self, value: f64) {
        self.cell.notify_progress(value);
    }
}

impl<T: Clone + 'static> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("promise", &self.cell.id())
            .field("resolved", &self.resolved.get())
            .finish()
    }
}

/// 外部“类 Promise”对象的适配器。
///
/// 适配器在稍后的轮次被调用，并得到一个新的解决器对；返回 `Err` 时，
/// 若该解决器对尚未使用则以此拒绝。
pub trait Thenable<T: 'static> {
    fn then(self: Box<Self>, resolver: Resolver<T>) -> Result<(), Rejection>;
}

impl<T, F> Thenable<T> for F
where
    T: 'static,
    F: FnOnce(Resolver<T>) -> Result<(), Rejection>,
{
    fn then(self: Box<Self>, resolver: Resolver<T>) -> Result<(), Rejection> {
        (*self)(resolver)
    }
}

/// 解决 Promise 所用的值。
///
/// - `Value`：直接兑现；
/// - `Follow`：跟随另一个 Promise 的终态；
/// - `Adopt`：通过 [`Thenable`] 适配器采纳外部对象的结果。
pub enum Resolution<T: 'static> {
    Value(T),
    Follow(Promise<T>),
    Adopt(Box<dyn Thenable<T>>),
}

impl<T: Clone + 'static> Resolution<T> {
    pub fn adopt(thenable: impl Thenable<T> + 'static) -> Self {
        Resolution::Adopt(Box::new(thenable))
    }
}

impl<T: 'static> From<Promise<T>> for Resolution<T> {
    fn from(promise: Promise<T>) -> Self {
        Resolution::Follow(promise)
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Resolution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Follow(promise) => f.debug_tuple("Follow").field(promise).finish(),
            Resolution::Adopt(_) => f.write_str("Adopt(..)"),
        }
    }
}

//! 回调适配层：把回调风格的 API 接入 Promise，并把 Promise 交还给回调与 `async` 世界。
//!
//! # 设计背景（Why）
//! - 许多宿主 API 以“完成回调”报告结果：第一个参数是错误，其后是成功值；
//!   [`Engine::promisify`] 及其变体把这类函数包装为返回 Promise 的函数；
//! - 反方向上，[`Promise::as_callback`] 把结果交给普通回调，[`PromiseFuture`] 让 `async` 代码
//!   可以 `.await` 一个 Promise。
//!
//! # 契约说明（What）
//! - [`Callback`] 只有第一次调用生效，之后的调用静默忽略；
//! - 回调收到错误时以 `Operational` 拒绝，错误本身保留为拒绝原因的 `source`；
//! - 被包装函数发生 panic 时，若回调尚未被调用，以 `Panicked` 拒绝。
//!
//! # 风险提示（Trade-offs）
//! - [`PromiseFuture`] 不会驱动引擎；宿主必须在轮询之间运行 tick，否则 Future 永远不会就绪。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::engine::Engine;
use crate::error::{Rejection, panic_message};
use crate::promise::{Promise, Resolver, Settled};

/// 完成回调：交给回调风格 API 的一次性结果出口。
pub struct Callback<T: 'static> {
    resolver: Resolver<T>,
}

impl<T: 'static> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
        }
    }
}

impl<T: Clone + 'static> Callback<T> {
    /// 以“错误优先”约定报告结果。
    ///
    /// - `error` 存在：以 `Operational` 拒绝，忽略 `value`；
    /// - 否则以 `value` 兑现；两者都缺失时以 `Type` 错误拒绝。
    pub fn call<E>(&self, error: Option<E>, value: Option<T>)
    where
        E: Into<Box<dyn StdError>>,
    {
        match (error, value) {
            (Some(error), _) => self.resolver.reject(Rejection::operational(error)),
            (None, Some(value)) => self.resolver.resolve(value),
            (None, None) => self
                .resolver
                .reject(Rejection::type_error("callback invoked without error or value")),
        }
    }

    pub fn succeed(&self, value: T) {
        self.resolver.resolve(value);
    }

    /// 以任意原因拒绝；与 `call` 不同，原因不会被包装为 `Operational`。
    pub fn fail(&self, reason: impl Into<Rejection>) {
        self.resolver.reject(reason);
    }

    /// 回调是否已被调用过。
    pub fn is_called(&self) -> bool {
        self.resolver.is_resolved()
    }
}

impl<T: Clone + 'static> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("resolver", &self.resolver)
            .finish()
    }
}

/// 报告多个成功值的完成回调，兑现为 `Vec<T>`。
pub struct MultiCallback<T: 'static> {
    inner: Callback<Vec<T>>,
}

impl<T: 'static> Clone for MultiCallback<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> MultiCallback<T> {
    pub fn call<E>(&self, error: Option<E>, values: Vec<T>)
    where
        E: Into<Box<dyn StdError>>,
    {
        match error {
            Some(error) => self.inner.call(Some(error), None),
            None => self.inner.succeed(values),
        }
    }

    pub fn succeed(&self, values: Vec<T>) {
        self.inner.succeed(values);
    }

    pub fn fail(&self, reason: impl Into<Rejection>) {
        self.inner.fail(reason);
    }

    pub fn is_called(&self) -> bool {
        self.inner.is_called()
    }
}

impl<T: Clone + 'static> Resolver<T> {
    /// 以该解决器对为后端的完成回调。
    pub fn callback(&self) -> Callback<T> {
        Callback {
            resolver: self.clone(),
        }
    }
}

/// 调用被包装函数，panic 转为拒绝。
fn invoke_adapted<T: Clone + 'static>(resolver: &Resolver<T>, call: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(call)) {
        resolver.reject(Rejection::panicked(panic_message(payload.as_ref())));
    }
}

impl Engine {
    /// 把 `f(args, callback)` 包装为 `Fn(args) -> Promise<T>`。
    #[track_caller]
    pub fn promisify<A, T, F>(&self, f: F) -> impl Fn(A) -> Promise<T> + use<A, T, F>
    where
        A: 'static,
        T: Clone + 'static,
        F: Fn(A, Callback<T>) + 'static,
    {
        let engine = self.clone();
        let location = Location::caller();
        move |args: A| {
            let (promise, resolver) = engine.deferred_at("promisify", location);
            let callback = resolver.callback();
            invoke_adapted(&resolver, || f(args, callback));
            promise
        }
    }

    /// 同 [`Engine::promisify`]，回调报告多个成功值。
    #[track_caller]
    pub fn promisify_multi<A, T, F>(&self, f: F) -> impl Fn(A) -> Promise<Vec<T>> + use<A, T, F>
    where
        A: 'static,
        T: Clone + 'static,
        F: Fn(A, MultiCallback<T>) + 'static,
    {
        let engine = self.clone();
        let location = Location::caller();
        move |args: A| {
            let (promise, resolver) = engine.deferred_at("promisify", location);
            let callback = MultiCallback {
                inner: resolver.callback(),
            };
            invoke_adapted(&resolver, || f(args, callback));
            promise
        }
    }

    /// 以 `target` 为接收者，按名称登记回调风格方法，见 [`Promisified`]。
    pub fn promisify_all<O, A, T>(&self, target: Rc<O>) -> Promisified<O, A, T>
    where
        O: 'static,
        A: 'static,
        T: Clone + 'static,
    {
        Promisified {
            engine: self.clone(),
            target,
            methods: BTreeMap::new(),
        }
    }
}

type Method<O, A, T> = Rc<dyn Fn(&O, A, Callback<T>)>;

/// 一组按名称调用、返回 Promise 的方法。
///
/// # 契约说明（What）
/// - 方法以 `&O` 作为接收者，`A` 作为参数，通过 [`Callback`] 报告结果；
/// - 以未登记的名称调用时，返回以 `Type` 错误拒绝的 Promise。
pub struct Promisified<O: 'static, A: 'static, T: 'static> {
    engine: Engine,
    target: Rc<O>,
    methods: BTreeMap<String, Method<O, A, T>>,
}

impl<O: 'static, A: 'static, T: Clone + 'static> Promisified<O, A, T> {
    /// 登记方法；同名方法被替换。
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&O, A, Callback<T>) + 'static,
    {
        self.methods.insert(name.into(), Rc::new(f));
        self
    }

    pub fn target(&self) -> &Rc<O> {
        &self.target
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    #[track_caller]
    pub fn call_async(&self, name: &str, args: A) -> Promise<T> {
        let location = Location::caller();
        let Some(method) = self.methods.get(name) else {
            tracing::debug!(method = name, "promisified method not found");
            let (promise, resolver) = self.engine.deferred_at("promisify", location);
            resolver.reject(Rejection::type_error(format!("no promisified method named `{name}`")));
            return promise;
        };
        let (promise, resolver) = self.engine.deferred_at("promisify", location);
        let callback = resolver.callback();
        invoke_adapted(&resolver, || method(&self.target, args, callback));
        promise
    }
}

impl<O: 'static, A: 'static, T: 'static> fmt::Debug for Promisified<O, A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promisified")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// 结算后把结果交给 `f`，返回同一 Promise。
    ///
    /// `f` 发生 panic 时不会被吞掉：它作为致命错误交给宿主。
    pub fn as_callback<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Settled<T>) + 'static,
    {
        let engine = self.engine().clone();
        self.cell().subscribe(Box::new(move |settled| {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || f(settled))) {
                let reason = Rejection::panicked(panic_message(payload.as_ref()));
                engine.scheduler().invoke_later(move || Err(reason));
            }
        }));
        self.clone()
    }
}

struct FutureSlot<T> {
    outcome: Option<Settled<T>>,
    waker: Option<Waker>,
}

/// `.await` 一个 Promise 得到的 Future，输出为 [`Settled`]。
pub struct PromiseFuture<T: 'static> {
    promise: Promise<T>,
    slot: Rc<RefCell<FutureSlot<T>>>,
}

impl<T: Clone + 'static> PromiseFuture<T> {
    fn new(promise: Promise<T>) -> Self {
        let slot = Rc::new(RefCell::new(FutureSlot {
            outcome: None,
            waker: None,
        }));
        let sink = Rc::clone(&slot);
        promise.cell().subscribe(Box::new(move |settled| {
            let waker = {
                let mut slot = sink.borrow_mut();
                slot.outcome = Some(settled);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }));
        Self { promise, slot }
    }

    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }
}

impl<T: Clone + 'static> Future for PromiseFuture<T> {
    type Output = Settled<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T: Clone + 'static> IntoFuture for Promise<T> {
    type Output = Settled<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> PromiseFuture<T> {
        PromiseFuture::new(self)
    }
}

impl<T: Clone + 'static> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture")
            .field("promise", &self.promise)
            .field("ready", &self.slot.borrow().outcome.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_callback_calls_are_ignored() {
        let engine = Engine::new();
        let (promise, resolver) = engine.deferred::<u32>();
        let callback = resolver.callback();
        callback.succeed(1);
        callback.call(Some("late failure"), None);
        callback.succeed(2);
        engine.run_until_idle().expect("idle");
        assert_eq!(promise.value(), Some(1));
        assert!(callback.is_called());
    }

    #[test]
    fn callback_error_is_operational() {
        let engine = Engine::new();
        let (promise, resolver) = engine.deferred::<u32>();
        let _handled = promise.catch(|_| Ok(crate::Resolution::Value(0)));
        resolver.callback().call(Some("disk full"), None);
        engine.run_until_idle().expect("idle");
        let reason = promise.reason().expect("rejected");
        assert_eq!(reason.kind(), crate::ErrorKind::Operational);
        assert!(reason.to_string().contains("disk full"));
    }

    #[test]
    fn empty_callback_is_a_type_error() {
        let engine = Engine::new();
        let (promise, resolver) = engine.deferred::<u32>();
        let _handled = promise.catch(|_| Ok(crate::Resolution::Value(0)));
        resolver.callback().call(None::<String>, None);
        engine.run_until_idle().expect("idle");
        assert_eq!(promise.reason().map(|r| r.kind()), Some(crate::ErrorKind::Type));
    }
}

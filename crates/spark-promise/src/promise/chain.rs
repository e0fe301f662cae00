//! 链式延续：`then` 家族。
//!
//! # 契约说明（What）
//! - 每个方法都返回新的下游 Promise；处理器在上游结算后的某个 tick 中运行，绝不在附加调用内同步运行；
//! - 处理器返回 `Ok(Resolution)` 时以之解决下游，返回 `Err` 或 panic 时拒绝下游；
//! - 未提供对应处理器的一侧原样透传，拒绝原因保持同一性；
//! - 上游可取消时，下游同样可取消，并以上游为取消父节点；上游的进度沿链向下转发。

use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::rc::Rc;

use super::{Bound, Promise, PromiseCell, Resolution, Resolver, Settled};
use crate::error::{ErrorFilter, Rejection, panic_message};

impl<T: Clone + 'static> Promise<T> {
    /// 兑现时调用 `on_fulfilled`；拒绝透传。
    #[track_caller]
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U>, Rejection> + 'static,
    {
        self.chain_at("then", Location::caller(), None, move |settled| match settled {
            Ok(value) => on_fulfilled(value),
            Err(reason) => Err(reason),
        })
    }

    /// 同时提供兑现与拒绝处理器。
    #[track_caller]
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U>, Rejection> + 'static,
        R: FnOnce(Rejection) -> Result<Resolution<U>, Rejection> + 'static,
    {
        self.chain_at("then", Location::caller(), None, move |settled| match settled {
            Ok(value) => on_fulfilled(value),
            Err(reason) => on_rejected(reason),
        })
    }

    /// 兑现、拒绝与进度三个处理器。
    #[track_caller]
    pub fn then_with_progress<U, F, R, P>(
        &self,
        on_fulfilled: F,
        on_rejected: R,
        on_progress: P,
    ) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U>, Rejection> + 'static,
        R: FnOnce(Rejection) -> Result<Resolution<U>, Rejection> + 'static,
        P: FnMut(f64) + 'static,
    {
        self.chain_at(
            "then",
            Location::caller(),
            Some(Box::new(on_progress)),
            move |settled| match settled {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            },
        )
    }

    /// 同步变换兑现值。
    #[track_caller]
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.chain_at("map", Location::caller(), None, move |settled| {
            settled.map(|value| Resolution::Value(f(value)))
        })
    }

    /// 以返回的 Promise 继续。
    #[track_caller]
    pub fn and_then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        self.chain_at("and_then", Location::caller(), None, move |settled| {
            settled.map(|value| Resolution::Follow(f(value)))
        })
    }

    /// 处理任意拒绝；兑现透传。
    #[track_caller]
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T>
    where
        R: FnOnce(Rejection) -> Result<Resolution<T>, Rejection> + 'static,
    {
        self.chain_at("catch", Location::caller(), None, move |settled| match settled {
            Ok(value) => Ok(Resolution::Value(value)),
            Err(reason) => on_rejected(reason),
        })
    }

    /// 只处理匹配 `filter` 的拒绝，其余原样透传。
    #[track_caller]
    pub fn catch_if<R>(&self, filter: impl Into<ErrorFilter>, on_rejected: R) -> Promise<T>
    where
        R: FnOnce(Rejection) -> Result<Resolution<T>, Rejection> + 'static,
    {
        let filter = filter.into();
        self.chain_at("catch", Location::caller(), None, move |settled| match settled {
            Ok(value) => Ok(Resolution::Value(value)),
            Err(reason) if filter.matches(&reason) => on_rejected(reason),
            Err(reason) => Err(reason),
        })
    }

    /// 无论结果如何都运行 `f`，随后透传原结果。
    ///
    /// `f` 返回 Promise 时先等待它；`f` 失败或其 Promise 被拒绝时，以新的原因取代原结果。
    #[track_caller]
    pub fn finally<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() -> Result<Resolution<()>, Rejection> + 'static,
    {
        let location = Location::caller();
        let engine = self.engine().clone();
        self.chain_at("finally", location, None, move |settled| match f()? {
            Resolution::Value(()) => settled.map(Resolution::Value),
            gate => {
                let gate = engine.resolve_with(gate);
                let resumed = gate.chain_at("finally", location, None, move |outcome| {
                    outcome.and(settled.map(Resolution::Value))
                });
                Ok(Resolution::Follow(resumed))
            }
        })
    }

    /// 以只读方式观察兑现值；`f` 失败时拒绝下游。
    #[track_caller]
    pub fn tap<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(&T) -> Result<(), Rejection> + 'static,
    {
        self.chain_at("tap", Location::caller(), None, move |settled| {
            let value = settled?;
            f(&value)?;
            Ok(Resolution::Value(value))
        })
    }

    /// 附加进度处理器；结果透传。
    #[track_caller]
    pub fn progressed<P>(&self, on_progress: P) -> Promise<T>
    where
        P: FnMut(f64) + 'static,
    {
        self.chain_at(
            "progressed",
            Location::caller(),
            Some(Box::new(on_progress)),
            |settled| settled.map(Resolution::Value),
        )
    }

    /// 终结链路：之后的拒绝不会被静默吞掉，而是作为致命错误交给宿主。
    #[track_caller]
    pub fn done(&self) {
        self.done_at(Location::caller(), |_| Ok(()), Err);
    }

    /// 带处理器的终结；处理器返回的错误同样成为致命错误。
    #[track_caller]
    pub fn done_with<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) -> Result<(), Rejection> + 'static,
        R: FnOnce(Rejection) -> Result<(), Rejection> + 'static,
    {
        self.done_at(Location::caller(), on_fulfilled, on_rejected);
    }

    fn done_at<F, R>(&self, location: &'static Location<'static>, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) -> Result<(), Rejection> + 'static,
        R: FnOnce(Rejection) -> Result<(), Rejection> + 'static,
    {
        let last: Promise<()> = self.chain_at("done", location, None, move |settled| {
            let outcome = match settled {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            };
            outcome.map(Resolution::Value)
        });
        last.cell.mark_final();
    }

    /// 绑定上下文：之后的处理器以 `&C` 作为首个参数。
    pub fn bind<C: 'static>(&self, context: C) -> Bound<T, C> {
        Bound::new(self.clone(), Rc::new(context))
    }

    /// 所有链式方法的公共实现。
    pub(crate) fn chain_at<U, H>(
        &self,
        label: &'static str,
        location: &'static Location<'static>,
        on_progress: Option<Box<dyn FnMut(f64)>>,
        handler: H,
    ) -> Promise<U>
    where
        U: Clone + 'static,
        H: FnOnce(Settled<T>) -> Result<Resolution<U>, Rejection> + 'static,
    {
        let child = PromiseCell::<U>::create(self.engine(), label, location, self.cell.trace());
        child.inherit_cancellation(&self.cell);
        self.cell.forward_progress(&child, on_progress);

        let resolver = Resolver::fresh(Rc::clone(&child));
        self.cell.subscribe(Box::new(move |settled| {
            match catch_unwind(AssertUnwindSafe(move || handler(settled))) {
                Ok(Ok(resolution)) => resolver.resolve_with(resolution),
                Ok(Err(reason)) => resolver.reject(reason),
                Err(payload) => {
                    resolver.reject(Rejection::panicked(panic_message(payload.as_ref())));
                }
            }
        }));
        Promise::from_cell(child)
    }
}

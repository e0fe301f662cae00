//! 绑定上下文的 Promise 视图。

use std::panic::Location;
use std::rc::Rc;

use super::{Promise, Resolution};
use crate::error::Rejection;

/// 携带共享上下文 `C` 的 Promise。
///
/// 处理器以 `&C` 作为首个参数；由 `then`/`catch` 派生出的下游继续绑定同一上下文。
pub struct Bound<T: 'static, C: 'static> {
    promise: Promise<T>,
    context: Rc<C>,
}

impl<T: 'static, C: 'static> Clone for Bound<T, C> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            context: Rc::clone(&self.context),
        }
    }
}

impl<T: Clone + 'static, C: 'static> Bound<T, C> {
    pub(crate) fn new(promise: Promise<T>, context: Rc<C>) -> Self {
        Self { promise, context }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    /// 解除绑定。
    pub fn into_promise(self) -> Promise<T> {
        self.promise
    }

    #[track_caller]
    pub fn then<U, F>(&self, on_fulfilled: F) -> Bound<U, C>
    where
        U: Clone + 'static,
        F: FnOnce(&C, T) -> Result<Resolution<U>, Rejection> + 'static,
    {
        let context = Rc::clone(&self.context);
        let next = self
            .promise
            .chain_at("then", Location::caller(), None, move |settled| {
                on_fulfilled(&context, settled?)
            });
        Bound::new(next, Rc::clone(&self.context))
    }

    #[track_caller]
    pub fn catch<R>(&self, on_rejected: R) -> Bound<T, C>
    where
        R: FnOnce(&C, Rejection) -> Result<Resolution<T>, Rejection> + 'static,
    {
        let context = Rc::clone(&self.context);
        let next = self
            .promise
            .chain_at("catch", Location::caller(), None, move |settled| match settled {
                Ok(value) => Ok(Resolution::Value(value)),
                Err(reason) => on_rejected(&context, reason),
            });
        Bound::new(next, Rc::clone(&self.context))
    }
}

//! Race：第一个结算的输入决定结果。

use std::marker::PhantomData;

use super::{Combinator, Ctx, Verdict};
use crate::error::Rejection;

/// 空输入时永远挂起。
pub(crate) struct Race<T> {
    _value: PhantomData<fn() -> T>,
}

impl<T> Race<T> {
    pub(crate) fn new() -> Self {
        Self {
            _value: PhantomData,
        }
    }
}

impl<T: Clone + 'static> Combinator for Race<T> {
    type Item = T;
    type Event = T;
    type Output = T;

    fn lift(item: T) -> T {
        item
    }

    fn init(&mut self, _len: usize, _ctx: &Ctx<Self>) -> Verdict<T> {
        Verdict::Pending
    }

    fn fulfilled(&mut self, _index: usize, value: T, _ctx: &Ctx<Self>) -> Verdict<T> {
        Verdict::Fulfill(value)
    }

    fn rejected(&mut self, _index: usize, reason: Rejection, _ctx: &Ctx<Self>) -> Verdict<T> {
        Verdict::Reject(reason)
    }
}

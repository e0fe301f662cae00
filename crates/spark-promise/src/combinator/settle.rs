//! Settle：等待全部输入结算，以快照列表兑现，从不拒绝。

use super::{Combinator, Ctx, Verdict};
use crate::error::Rejection;
use crate::promise::Inspection;

pub(crate) struct Settle<T> {
    results: Vec<Option<Inspection<T>>>,
    remaining: usize,
}

impl<T> Settle<T> {
    pub(crate) fn new() -> Self {
        Self {
            results: Vec::new(),
            remaining: 0,
        }
    }

    fn record(&mut self, index: usize, inspection: Inspection<T>) -> Verdict<Vec<Inspection<T>>> {
        let slot = &mut self.results[index];
        if slot.is_none() {
            self.remaining -= 1;
        }
        *slot = Some(inspection);
        if self.remaining > 0 {
            return Verdict::Pending;
        }
        Verdict::Fulfill(std::mem::take(&mut self.results).into_iter().flatten().collect())
    }
}

impl<T: Clone + 'static> Combinator for Settle<T> {
    type Item = T;
    type Event = T;
    type Output = Vec<Inspection<T>>;

    fn lift(item: T) -> T {
        item
    }

    fn init(&mut self, len: usize, _ctx: &Ctx<Self>) -> Verdict<Vec<Inspection<T>>> {
        self.results = std::iter::repeat_with(|| None).take(len).collect();
        self.remaining = len;
        if len == 0 {
            Verdict::Fulfill(Vec::new())
        } else {
            Verdict::Pending
        }
    }

    fn fulfilled(&mut self, index: usize, value: T, _ctx: &Ctx<Self>) -> Verdict<Vec<Inspection<T>>> {
        self.record(index, Inspection::Fulfilled(value))
    }

    fn rejected(
        &mut self,
        index: usize,
        reason: Rejection,
        _ctx: &Ctx<Self>,
    ) -> Verdict<Vec<Inspection<T>>> {
        self.record(index, Inspection::Rejected(reason))
    }
}

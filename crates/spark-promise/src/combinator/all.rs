//! All 与其键控变体 Props。

use std::collections::BTreeMap;

use super::{Combinator, Ctx, Verdict};
use crate::error::Rejection;

/// 全部兑现后按输入顺序给出结果；第一个拒绝决定失败原因。
pub(crate) struct All<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T> All<T> {
    pub(crate) fn new() -> Self {
        Self {
            values: Vec::new(),
            remaining: 0,
        }
    }

    fn start(&mut self, len: usize) -> Option<Vec<T>> {
        self.values = std::iter::repeat_with(|| None).take(len).collect();
        self.remaining = len;
        (len == 0).then(Vec::new)
    }

    fn record(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        let slot = &mut self.values[index];
        if slot.is_none() {
            self.remaining -= 1;
        }
        *slot = Some(value);
        if self.remaining > 0 {
            return None;
        }
        Some(std::mem::take(&mut self.values).into_iter().flatten().collect())
    }
}

impl<T: Clone + 'static> Combinator for All<T> {
    type Item = T;
    type Event = T;
    type Output = Vec<T>;

    fn lift(item: T) -> T {
        item
    }

    fn init(&mut self, len: usize, _ctx: &Ctx<Self>) -> Verdict<Vec<T>> {
        match self.start(len) {
            Some(empty) => Verdict::Fulfill(empty),
            None => Verdict::Pending,
        }
    }

    fn fulfilled(&mut self, index: usize, value: T, _ctx: &Ctx<Self>) -> Verdict<Vec<T>> {
        match self.record(index, value) {
            Some(values) => Verdict::Fulfill(values),
            None => Verdict::Pending,
        }
    }

    fn rejected(&mut self, _index: usize, reason: Rejection, _ctx: &Ctx<Self>) -> Verdict<Vec<T>> {
        Verdict::Reject(reason)
    }
}

/// 键控 All：输入顺序与 `keys` 对应，结果重建为有序映射。
pub(crate) struct Props<K, T> {
    keys: Vec<K>,
    all: All<T>,
}

impl<K: Ord, T> Props<K, T> {
    pub(crate) fn new(keys: Vec<K>) -> Self {
        Self {
            keys,
            all: All::new(),
        }
    }

    fn assemble(&mut self, values: Vec<T>) -> BTreeMap<K, T> {
        std::mem::take(&mut self.keys).into_iter().zip(values).collect()
    }
}

impl<K, T> Combinator for Props<K, T>
where
    K: Ord + Clone + 'static,
    T: Clone + 'static,
{
    type Item = T;
    type Event = T;
    type Output = BTreeMap<K, T>;

    fn lift(item: T) -> T {
        item
    }

    fn init(&mut self, len: usize, _ctx: &Ctx<Self>) -> Verdict<BTreeMap<K, T>> {
        match self.all.start(len) {
            Some(empty) => Verdict::Fulfill(self.assemble(empty)),
            None => Verdict::Pending,
        }
    }

    fn fulfilled(&mut self, index: usize, value: T, _ctx: &Ctx<Self>) -> Verdict<BTreeMap<K, T>> {
        match self.all.record(index, value) {
            Some(values) => Verdict::Fulfill(self.assemble(values)),
            None => Verdict::Pending,
        }
    }

    fn rejected(
        &mut self,
        _index: usize,
        reason: Rejection,
        _ctx: &Ctx<Self>,
    ) -> Verdict<BTreeMap<K, T>> {
        Verdict::Reject(reason)
    }
}

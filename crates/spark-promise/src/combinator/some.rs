//! Some(k)：收集前 k 个兑现值；Any 建立在 `Some(1)` 之上。

use super::{Combinator, Ctx, Verdict};
use crate::error::Rejection;

/// # 契约说明（What）
/// - `count > len`：立即以 `Range` 错误拒绝；`count == 0`：立即兑现空向量；
/// - 兑现值按到达顺序收集，满 `count` 个即兑现；
/// - 拒绝数超过 `len - count` 时已不可能凑满，以 `Aggregate` 携带全部已收集的原因拒绝。
pub(crate) struct SomeOf<T> {
    count: usize,
    len: usize,
    values: Vec<T>,
    reasons: Vec<Rejection>,
}

impl<T> SomeOf<T> {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count,
            len: 0,
            values: Vec::new(),
            reasons: Vec::new(),
        }
    }
}

impl<T: Clone + 'static> Combinator for SomeOf<T> {
    type Item = T;
    type Event = T;
    type Output = Vec<T>;

    fn lift(item: T) -> T {
        item
    }

    fn init(&mut self, len: usize, _ctx: &Ctx<Self>) -> Verdict<Vec<T>> {
        self.len = len;
        if self.count > len {
            return Verdict::Reject(Rejection::range_error(format!(
                "expected at least {} input(s) but got {len}",
                self.count
            )));
        }
        if self.count == 0 {
            return Verdict::Fulfill(Vec::new());
        }
        self.values.reserve(self.count);
        Verdict::Pending
    }

    fn fulfilled(&mut self, _index: usize, value: T, _ctx: &Ctx<Self>) -> Verdict<Vec<T>> {
        self.values.push(value);
        if self.values.len() == self.count {
            Verdict::Fulfill(std::mem::take(&mut self.values))
        } else {
            Verdict::Pending
        }
    }

    fn rejected(&mut self, _index: usize, reason: Rejection, _ctx: &Ctx<Self>) -> Verdict<Vec<T>> {
        self.reasons.push(reason);
        if self.reasons.len() > self.len - self.count {
            Verdict::Reject(Rejection::aggregate(std::mem::take(&mut self.reasons)))
        } else {
            Verdict::Pending
        }
    }
}

//! Map：逐个映射输入，结果保持输入顺序；可限制同时挂起的映射结果数。

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use super::{Combinator, Ctx, Verdict};
use crate::error::{Rejection, panic_message};
use crate::promise::Resolution;

/// `map_with` 的选项。
///
/// `concurrency` 为 0 表示不限；否则映射器返回的未结算 Promise 数不超过该值，
/// 其余已兑现的输入排队等待。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapOptions {
    pub concurrency: usize,
}

impl MapOptions {
    pub fn concurrency(limit: usize) -> Self {
        Self { concurrency: limit }
    }
}

type Mapper<T, U> = Rc<dyn Fn(T, usize, usize) -> Result<Resolution<U>, Rejection>>;

pub(crate) enum MapEvent<T, U> {
    Input(T),
    Mapped(U),
}

pub(crate) struct Map<T: 'static, U: 'static> {
    mapper: Mapper<T, U>,
    limit: usize,
    len: usize,
    in_flight: usize,
    queue: VecDeque<(usize, T)>,
    results: Vec<Option<U>>,
    remaining: usize,
}

impl<T: Clone + 'static, U: Clone + 'static> Map<T, U> {
    pub(crate) fn new<F>(mapper: Rc<F>, options: MapOptions) -> Self
    where
        F: Fn(T, usize, usize) -> Result<Resolution<U>, Rejection> + 'static,
    {
        Self {
            mapper,
            limit: options.concurrency,
            len: 0,
            in_flight: 0,
            queue: VecDeque::new(),
            results: Vec::new(),
            remaining: 0,
        }
    }

    fn record(&mut self, index: usize, mapped: U) {
        let slot = &mut self.results[index];
        if slot.is_none() {
            self.remaining -= 1;
        }
        *slot = Some(mapped);
    }

    /// 在并发上限内调用映射器，直到队列清空或额度用完。
    fn pump(&mut self, ctx: &Ctx<Self>) -> Verdict<Vec<U>> {
        while self.limit == 0 || self.in_flight < self.limit {
            let Some((index, value)) = self.queue.pop_front() else {
                break;
            };
            let mapper = Rc::clone(&self.mapper);
            let len = self.len;
            let produced = catch_unwind(AssertUnwindSafe(move || mapper(value, index, len)))
                .unwrap_or_else(|payload| Err(Rejection::panicked(panic_message(payload.as_ref()))));
            let resolution = match produced {
                Ok(resolution) => resolution,
                Err(reason) => return Verdict::Reject(reason),
            };
            match ctx.split(resolution) {
                Ok(mapped) => self.record(index, mapped),
                Err(pending) => {
                    self.in_flight += 1;
                    ctx.watch(index, &pending, MapEvent::Mapped);
                }
            }
        }
        if self.remaining == 0 {
            Verdict::Fulfill(std::mem::take(&mut self.results).into_iter().flatten().collect())
        } else {
            Verdict::Pending
        }
    }
}

impl<T: Clone + 'static, U: Clone + 'static> Combinator for Map<T, U> {
    type Item = T;
    type Event = MapEvent<T, U>;
    type Output = Vec<U>;

    fn lift(item: T) -> MapEvent<T, U> {
        MapEvent::Input(item)
    }

    fn init(&mut self, len: usize, _ctx: &Ctx<Self>) -> Verdict<Vec<U>> {
        self.len = len;
        self.results = std::iter::repeat_with(|| None).take(len).collect();
        self.remaining = len;
        if len == 0 {
            Verdict::Fulfill(Vec::new())
        } else {
            Verdict::Pending
        }
    }

    fn fulfilled(&mut self, index: usize, event: MapEvent<T, U>, ctx: &Ctx<Self>) -> Verdict<Vec<U>> {
        match event {
            MapEvent::Input(value) => self.queue.push_back((index, value)),
            MapEvent::Mapped(mapped) => {
                self.in_flight -= 1;
                self.record(index, mapped);
            }
        }
        self.pump(ctx)
    }

    fn rejected(&mut self, _index: usize, reason: Rejection, _ctx: &Ctx<Self>) -> Verdict<Vec<U>> {
        Verdict::Reject(reason)
    }
}

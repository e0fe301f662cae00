//! Reduce：顺序左折叠。
//!
//! 每一步同时等待上一步的累加值与下一个输入；归约器返回 Promise 时，
//! 折叠暂停直到它兑现。输入可以乱序兑现，折叠顺序始终是输入顺序。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use super::{Combinator, Ctx, Verdict};
use crate::error::{Rejection, panic_message};
use crate::promise::Resolution;

type Reducer<T, A> = Rc<dyn Fn(A, T, usize, usize) -> Result<Resolution<A>, Rejection>>;

pub(crate) enum ReduceEvent<T, A> {
    Input(T),
    Accumulated(A),
}

pub(crate) struct Reduce<T: 'static, A: 'static> {
    reducer: Reducer<T, A>,
    initial: Option<Resolution<A>>,
    /// 无初始值时，把第一个输入转换为累加值。
    seed: Option<fn(T) -> A>,
    acc: Option<A>,
    busy: bool,
    next: usize,
    len: usize,
    values: Vec<Option<T>>,
}

impl<T: Clone + 'static, A: Clone + 'static> Reduce<T, A> {
    pub(crate) fn with_initial<F>(reducer: Rc<F>, initial: Resolution<A>) -> Self
    where
        F: Fn(A, T, usize, usize) -> Result<Resolution<A>, Rejection> + 'static,
    {
        Self::build(reducer, Some(initial), None)
    }

    fn build(
        reducer: Reducer<T, A>,
        initial: Option<Resolution<A>>,
        seed: Option<fn(T) -> A>,
    ) -> Self {
        Self {
            reducer,
            initial,
            seed,
            acc: None,
            busy: false,
            next: 0,
            len: 0,
            values: Vec::new(),
        }
    }

    fn advance(&mut self, ctx: &Ctx<Self>) -> Verdict<A> {
        loop {
            if self.busy {
                return Verdict::Pending;
            }
            if self.next == self.len {
                return match self.acc.take() {
                    Some(acc) => Verdict::Fulfill(acc),
                    None => Verdict::Reject(empty_input()),
                };
            }
            let Some(value) = self.values[self.next].take() else {
                return Verdict::Pending;
            };
            let index = self.next;
            self.next += 1;

            let Some(acc) = self.acc.take() else {
                match self.seed {
                    Some(seed) => {
                        self.acc = Some(seed(value));
                        continue;
                    }
                    None => return Verdict::Reject(empty_input()),
                }
            };
            let reducer = Rc::clone(&self.reducer);
            let len = self.len;
            let produced = catch_unwind(AssertUnwindSafe(move || reducer(acc, value, index, len)))
                .unwrap_or_else(|payload| Err(Rejection::panicked(panic_message(payload.as_ref()))));
            match produced.map(|resolution| ctx.split(resolution)) {
                Err(reason) => return Verdict::Reject(reason),
                Ok(Ok(acc)) => self.acc = Some(acc),
                Ok(Err(pending)) => {
                    self.busy = true;
                    ctx.watch(index, &pending, ReduceEvent::Accumulated);
                }
            }
        }
    }
}

impl<T: Clone + 'static> Reduce<T, T> {
    pub(crate) fn seeded_by_first<F>(reducer: Rc<F>) -> Self
    where
        F: Fn(T, T, usize, usize) -> Result<Resolution<T>, Rejection> + 'static,
    {
        Self::build(reducer, None, Some(|first| first))
    }
}

fn empty_input() -> Rejection {
    Rejection::type_error("reduce of empty input with no initial value")
}

impl<T: Clone + 'static, A: Clone + 'static> Combinator for Reduce<T, A> {
    type Item = T;
    type Event = ReduceEvent<T, A>;
    type Output = A;

    fn lift(item: T) -> ReduceEvent<T, A> {
        ReduceEvent::Input(item)
    }

    fn init(&mut self, len: usize, ctx: &Ctx<Self>) -> Verdict<A> {
        self.len = len;
        self.values = std::iter::repeat_with(|| None).take(len).collect();
        if let Some(initial) = self.initial.take() {
            match ctx.split(initial) {
                Ok(acc) => self.acc = Some(acc),
                Err(pending) => {
                    self.busy = true;
                    ctx.watch(0, &pending, ReduceEvent::Accumulated);
                }
            }
        }
        self.advance(ctx)
    }

    fn fulfilled(&mut self, index: usize, event: ReduceEvent<T, A>, ctx: &Ctx<Self>) -> Verdict<A> {
        match event {
            ReduceEvent::Input(value) => self.values[index] = Some(value),
            ReduceEvent::Accumulated(acc) => {
                self.acc = Some(acc);
                self.busy = false;
            }
        }
        self.advance(ctx)
    }

    fn rejected(&mut self, _index: usize, reason: Rejection, _ctx: &Ctx<Self>) -> Verdict<A> {
        Verdict::Reject(reason)
    }
}

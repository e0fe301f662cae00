//! 组合子：把一组输入聚合为一个 Promise。
//!
//! # 设计背景（Why）
//! - All、Race、Some、Settle、Map、Reduce 的差异只在于“某个下标兑现/拒绝时如何更新内部状态、何时给出结论”；
//!   输入遍历、订阅、结论只落地一次等公共逻辑由 [`Coordinator`] 统一承担；
//! - 具体组合子实现 [`Combinator`]，只关心自己的状态推进。
//!
//! # 契约说明（What）
//! - 输入来源见 [`Source`] 与键控的 [`KeyedSource`]：就绪列表，或兑现为列表的 Promise（后者拒绝时聚合 Promise 同样拒绝）；
//! - 聚合 Promise 恰好结算一次；结论之后到达的输入结果被忽略，但输入仍被视为已处理；
//! - 组合子内部产生的后续 Promise（映射器、归约器的返回值）通过 [`Ctx::watch`] 回到同一协调器；
//! - 每个输入（包括普通值）都在后续的调度轮次交付，映射器、谓词与归约器从不在创建聚合的调用栈内运行。
//!
//! # 风险提示（Trade-offs）
//! - 映射器与归约器运行时持有协调器自身的借用；它们不应在回调内部驱动引擎（如调用 `run_tick`）。

mod all;
mod map;
mod race;
mod reduce;
mod settle;
mod some;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::Location;
use std::rc::{Rc, Weak};

use crate::engine::Engine;
use crate::error::Rejection;
use crate::promise::{Inspection, Promise, Resolution, Resolver, Settled};

pub use map::MapOptions;

/// 组合子的单个输入。
#[derive(Clone)]
pub enum Input<T: 'static> {
    Value(T),
    Promise(Promise<T>),
}

impl<T: 'static> From<Promise<T>> for Input<T> {
    fn from(promise: Promise<T>) -> Self {
        Input::Promise(promise)
    }
}

/// 组合子的输入来源。
pub enum Source<T: 'static> {
    Ready(Vec<Input<T>>),
    Deferred(Promise<Vec<Input<T>>>),
}

impl<T: Clone + 'static> Source<T> {
    /// 全部为普通值的就绪输入。
    pub fn values(values: Vec<T>) -> Self {
        Source::Ready(values.into_iter().map(Input::Value).collect())
    }

    /// 兑现为值列表的 Promise。
    #[track_caller]
    pub fn deferred(values: Promise<Vec<T>>) -> Self {
        Source::Deferred(values.map(|values| values.into_iter().map(Input::Value).collect()))
    }
}

impl<T: 'static> From<Vec<Input<T>>> for Source<T> {
    fn from(inputs: Vec<Input<T>>) -> Self {
        Source::Ready(inputs)
    }
}

impl<T: 'static> From<Vec<Promise<T>>> for Source<T> {
    fn from(promises: Vec<Promise<T>>) -> Self {
        Source::Ready(promises.into_iter().map(Input::Promise).collect())
    }
}

impl<T: 'static> From<Promise<Vec<Input<T>>>> for Source<T> {
    fn from(inputs: Promise<Vec<Input<T>>>) -> Self {
        Source::Deferred(inputs)
    }
}

/// `props` 的键控输入来源：就绪的键值列表，或兑现为键值列表的 Promise。
pub enum KeyedSource<K: 'static, T: 'static> {
    Ready(Vec<(K, Input<T>)>),
    Deferred(Promise<Vec<(K, Input<T>)>>),
}

impl<K: Clone + 'static, T: Clone + 'static> KeyedSource<K, T> {
    /// 兑现为普通键值映射的 Promise。
    #[track_caller]
    pub fn deferred(entries: Promise<BTreeMap<K, T>>) -> Self {
        KeyedSource::Deferred(entries.map(|entries| {
            entries
                .into_iter()
                .map(|(key, value)| (key, Input::Value(value)))
                .collect()
        }))
    }
}

impl<K: 'static, T: 'static> From<Vec<(K, Input<T>)>> for KeyedSource<K, T> {
    fn from(entries: Vec<(K, Input<T>)>) -> Self {
        KeyedSource::Ready(entries)
    }
}

impl<K: 'static, T: 'static, const N: usize> From<[(K, Input<T>); N]> for KeyedSource<K, T> {
    fn from(entries: [(K, Input<T>); N]) -> Self {
        KeyedSource::Ready(Vec::from(entries))
    }
}

impl<K: 'static, T: 'static> From<Vec<(K, Promise<T>)>> for KeyedSource<K, T> {
    fn from(entries: Vec<(K, Promise<T>)>) -> Self {
        KeyedSource::Ready(
            entries
                .into_iter()
                .map(|(key, promise)| (key, Input::Promise(promise)))
                .collect(),
        )
    }
}

impl<K: 'static, T: 'static> From<Promise<Vec<(K, Input<T>)>>> for KeyedSource<K, T> {
    fn from(entries: Promise<Vec<(K, Input<T>)>>) -> Self {
        KeyedSource::Deferred(entries)
    }
}

/// 组合子的一步推进结论。
pub(crate) enum Verdict<O> {
    Pending,
    Fulfill(O),
    Reject(Rejection),
}

/// 具体组合子的状态推进规则。
pub(crate) trait Combinator: Sized + 'static {
    type Item: Clone + 'static;
    /// 交付给 `fulfilled` 的事件；多数组合子与 `Item` 相同，Map/Reduce 额外携带中间结果。
    type Event: 'static;
    type Output: Clone + 'static;

    fn lift(item: Self::Item) -> Self::Event;

    fn init(&mut self, len: usize, ctx: &Ctx<Self>) -> Verdict<Self::Output>;

    fn fulfilled(
        &mut self,
        index: usize,
        event: Self::Event,
        ctx: &Ctx<Self>,
    ) -> Verdict<Self::Output>;

    fn rejected(
        &mut self,
        index: usize,
        reason: Rejection,
        ctx: &Ctx<Self>,
    ) -> Verdict<Self::Output>;
}

struct Coordinator<C: Combinator> {
    combinator: C,
    resolver: Resolver<C::Output>,
    settled: bool,
}

impl<C: Combinator> Coordinator<C> {
    fn deliver(
        this: &Rc<RefCell<Self>>,
        engine: &Engine,
        index: usize,
        outcome: Result<C::Event, Rejection>,
    ) {
        let ctx = Ctx {
            engine: engine.clone(),
            coordinator: Rc::downgrade(this),
        };
        let verdict = {
            let mut state = this.borrow_mut();
            if state.settled {
                return;
            }
            match outcome {
                Ok(event) => state.combinator.fulfilled(index, event, &ctx),
                Err(reason) => state.combinator.rejected(index, reason, &ctx),
            }
        };
        Self::apply(this, verdict);
    }

    fn apply(this: &Rc<RefCell<Self>>, verdict: Verdict<C::Output>) {
        if let Verdict::Pending = verdict {
            return;
        }
        let resolver = {
            let mut state = this.borrow_mut();
            state.settled = true;
            state.resolver.clone()
        };
        match verdict {
            Verdict::Fulfill(output) => resolver.resolve(output),
            Verdict::Reject(reason) => resolver.reject(reason),
            Verdict::Pending => {}
        }
    }
}

/// 组合子访问引擎与登记后续 Promise 的上下文。
pub(crate) struct Ctx<C: Combinator> {
    engine: Engine,
    coordinator: Weak<RefCell<Coordinator<C>>>,
}

impl<C: Combinator> Ctx<C> {
    /// 订阅 `promise`，其结果经 `lift` 转换后以 `index` 交付给组合子。
    pub(crate) fn watch<X, L>(&self, index: usize, promise: &Promise<X>, lift: L)
    where
        X: Clone + 'static,
        L: FnOnce(X) -> C::Event + 'static,
    {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        let engine = self.engine.clone();
        promise.cell().subscribe(Box::new(move |settled: Settled<X>| {
            Coordinator::deliver(&coordinator, &engine, index, settled.map(lift));
        }));
    }

    /// 映射器/归约器返回值：普通值直接返回，其余转换为待观察的 Promise。
    pub(crate) fn split<X: Clone + 'static>(
        &self,
        resolution: Resolution<X>,
    ) -> Result<X, Promise<X>> {
        match resolution {
            Resolution::Value(value) => Ok(value),
            Resolution::Follow(promise) => Err(promise),
            adopt @ Resolution::Adopt(_) => Err(self.engine.resolve_with(adopt)),
        }
    }
}

/// 驱动一个组合子，返回聚合 Promise。
fn coordinate<C, M>(
    engine: &Engine,
    label: &'static str,
    location: &'static Location<'static>,
    source: Source<C::Item>,
    make: M,
) -> Promise<C::Output>
where
    C: Combinator,
    M: FnOnce() -> C + 'static,
{
    match source {
        Source::Ready(inputs) => start(engine, label, location, inputs, make),
        Source::Deferred(list) => {
            let engine = engine.clone();
            list.chain_at(label, location, None, move |settled| {
                let inputs = settled?;
                Ok(Resolution::Follow(start(&engine, label, location, inputs, make)))
            })
        }
    }
}

fn start<C, M>(
    engine: &Engine,
    label: &'static str,
    location: &'static Location<'static>,
    inputs: Vec<Input<C::Item>>,
    make: M,
) -> Promise<C::Output>
where
    C: Combinator,
    M: FnOnce() -> C,
{
    let (promise, resolver) = engine.deferred_at(label, location);
    let len = inputs.len();
    let coordinator = Rc::new(RefCell::new(Coordinator {
        combinator: make(),
        resolver,
        settled: false,
    }));
    let ctx = Ctx {
        engine: engine.clone(),
        coordinator: Rc::downgrade(&coordinator),
    };
    let verdict = coordinator.borrow_mut().combinator.init(len, &ctx);
    Coordinator::apply(&coordinator, verdict);

    // 普通值与已结算的 Promise 一样经快队列交付，按下标顺序排队。
    for (index, input) in inputs.into_iter().enumerate() {
        match input {
            Input::Value(value) => {
                let coordinator = Rc::clone(&coordinator);
                let task_engine = engine.clone();
                engine.scheduler().invoke(move || {
                    Coordinator::deliver(&coordinator, &task_engine, index, Ok(C::lift(value)));
                });
            }
            Input::Promise(input) => ctx.watch(index, &input, C::lift),
        }
    }
    tracing::trace!(combinator = label, inputs = len, promise = %promise.id(), "combinator started");
    promise
}

impl Engine {
    /// 全部兑现时按输入顺序兑现；任一拒绝即拒绝。
    #[track_caller]
    pub fn all<T: Clone + 'static>(&self, source: impl Into<Source<T>>) -> Promise<Vec<T>> {
        coordinate(self, "all", Location::caller(), source.into(), all::All::new)
    }

    /// 键控的 `all`：兑现为同键的 `BTreeMap`。
    ///
    /// 延迟来源先等待键值列表兑现，键在列表兑现时确定。
    #[track_caller]
    pub fn props<K, T>(&self, source: impl Into<KeyedSource<K, T>>) -> Promise<BTreeMap<K, T>>
    where
        K: Ord + Clone + 'static,
        T: Clone + 'static,
    {
        let location = Location::caller();
        match source.into() {
            KeyedSource::Ready(entries) => {
                let (keys, inputs): (Vec<K>, Vec<Input<T>>) = entries.into_iter().unzip();
                coordinate(self, "props", location, Source::Ready(inputs), move || {
                    all::Props::new(keys)
                })
            }
            KeyedSource::Deferred(entries) => {
                let keys: Rc<RefCell<Vec<K>>> = Rc::default();
                let sink = Rc::clone(&keys);
                let inputs = entries.chain_at("props", location, None, move |settled| {
                    let (names, inputs): (Vec<K>, Vec<Input<T>>) = settled?.into_iter().unzip();
                    *sink.borrow_mut() = names;
                    Ok(Resolution::Value(inputs))
                });
                coordinate(self, "props", location, Source::Deferred(inputs), move || {
                    all::Props::new(keys.take())
                })
            }
        }
    }

    /// 第一个结算的输入决定结果；空输入永远挂起。
    #[track_caller]
    pub fn race<T: Clone + 'static>(&self, source: impl Into<Source<T>>) -> Promise<T> {
        coordinate(self, "race", Location::caller(), source.into(), race::Race::new)
    }

    /// 前 `count` 个兑现值（按到达顺序）。
    #[track_caller]
    pub fn some<T: Clone + 'static>(
        &self,
        source: impl Into<Source<T>>,
        count: usize,
    ) -> Promise<Vec<T>> {
        coordinate(self, "some", Location::caller(), source.into(), move || {
            some::SomeOf::new(count)
        })
    }

    /// 第一个兑现值；全部拒绝时以收集到的全部原因拒绝。
    #[track_caller]
    pub fn any<T: Clone + 'static>(&self, source: impl Into<Source<T>>) -> Promise<T> {
        let location = Location::caller();
        let first = coordinate(self, "any", location, source.into(), || some::SomeOf::new(1));
        first.chain_at("any", location, None, |settled| {
            let mut values = settled?;
            match values.pop() {
                Some(value) => Ok(Resolution::Value(value)),
                None => Err(Rejection::range_error("any() produced no value")),
            }
        })
    }

    /// 等待全部输入结算，从不拒绝。
    #[track_caller]
    pub fn settle<T: Clone + 'static>(
        &self,
        source: impl Into<Source<T>>,
    ) -> Promise<Vec<Inspection<T>>> {
        coordinate(self, "settle", Location::caller(), source.into(), settle::Settle::new)
    }

    /// 以 `mapper(value, index, len)` 映射每个输入，结果保持输入顺序。
    #[track_caller]
    pub fn map<T, U, F>(&self, source: impl Into<Source<T>>, mapper: F) -> Promise<Vec<U>>
    where
        T: Clone + 'static,
        U: Clone + 'static,
        F: Fn(T, usize, usize) -> Result<Resolution<U>, Rejection> + 'static,
    {
        self.map_at(Location::caller(), source.into(), MapOptions::default(), mapper)
    }

    /// 带并发上限的 `map`。
    #[track_caller]
    pub fn map_with<T, U, F>(
        &self,
        source: impl Into<Source<T>>,
        options: MapOptions,
        mapper: F,
    ) -> Promise<Vec<U>>
    where
        T: Clone + 'static,
        U: Clone + 'static,
        F: Fn(T, usize, usize) -> Result<Resolution<U>, Rejection> + 'static,
    {
        self.map_at(Location::caller(), source.into(), options, mapper)
    }

    fn map_at<T, U, F>(
        &self,
        location: &'static Location<'static>,
        source: Source<T>,
        options: MapOptions,
        mapper: F,
    ) -> Promise<Vec<U>>
    where
        T: Clone + 'static,
        U: Clone + 'static,
        F: Fn(T, usize, usize) -> Result<Resolution<U>, Rejection> + 'static,
    {
        let mapper = Rc::new(mapper);
        coordinate(self, "map", location, source, move || map::Map::new(mapper, options))
    }

    /// 保留 `predicate` 为真的输入，顺序不变。
    #[track_caller]
    pub fn filter<T, F>(&self, source: impl Into<Source<T>>, predicate: F) -> Promise<Vec<T>>
    where
        T: Clone + 'static,
        F: Fn(&T, usize, usize) -> Result<Resolution<bool>, Rejection> + 'static,
    {
        let location = Location::caller();
        let engine = self.clone();
        let kept = self.map_at(
            location,
            source.into(),
            MapOptions::default(),
            move |value: T, index, len| {
                let verdict = predicate(&value, index, len)?;
                let verdict = engine.resolve_with(verdict);
                Ok(Resolution::Follow(verdict.map(move |keep| keep.then_some(value))))
            },
        );
        kept.map(|entries| entries.into_iter().flatten().collect())
    }

    /// 顺序左折叠：每一步等待上一个累加值与下一个输入。
    #[track_caller]
    pub fn reduce<T, A, F>(
        &self,
        source: impl Into<Source<T>>,
        reducer: F,
        initial: Resolution<A>,
    ) -> Promise<A>
    where
        T: Clone + 'static,
        A: Clone + 'static,
        F: Fn(A, T, usize, usize) -> Result<Resolution<A>, Rejection> + 'static,
    {
        let reducer = Rc::new(reducer);
        coordinate(self, "reduce", Location::caller(), source.into(), move || {
            reduce::Reduce::with_initial(reducer, initial)
        })
    }

    /// 以第一个元素为初始累加值的 `reduce`；空输入以 `Type` 错误拒绝。
    #[track_caller]
    pub fn reduce1<T, F>(&self, source: impl Into<Source<T>>, reducer: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: Fn(T, T, usize, usize) -> Result<Resolution<T>, Rejection> + 'static,
    {
        let reducer = Rc::new(reducer);
        coordinate(self, "reduce", Location::caller(), source.into(), move || {
            reduce::Reduce::seeded_by_first(reducer)
        })
    }
}

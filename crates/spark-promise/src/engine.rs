//! 引擎：调度器、时钟、定时器、配置与诊断钩子的持有者。
//!
//! # 设计背景（Why）
//! - Promise 需要一个调度器来排队延续、一个时钟来驱动定时器、一组钩子来上报诊断；
//!   以显式注入的 [`Engine`] 句柄承载这些协作者，而不是进程级全局量，使测试可以并存多个互不干扰的引擎；
//! - 宿主只通过三个入口驱动引擎：[`Engine::run_tick`]、[`Engine::run_until_idle`]、
//!   [`Engine::run_to_completion`]。
//!
//! # 契约说明（What）
//! - `Engine` 是 `Rc` 句柄，克隆廉价；所有由它创建的 Promise 共享同一调度器；
//! - 引擎只能在创建它的线程上使用。
//!
//! # 风险提示（Trade-offs）
//! - 尚未触发的定时器回调持有 Promise，而 Promise 持有引擎句柄；丢弃引擎前若仍有挂起的定时器，
//!   应先调用 [`Engine::reset`] 以断开引用环。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::rc::Rc;
use std::time::Duration;

use crate::config::{ConfigError, EngineConfig};
use crate::diagnostics::Hooks;
use crate::error::{EngineError, Rejection, panic_message};
use crate::ids::{PromiseId, TimerId};
use crate::promise::{Promise, PromiseCell, Resolution, Resolver};
use crate::scheduler::{ManualTick, Scheduler, TickHook, TickReport};
use crate::time::{Clock, SystemClock, TimerQueue};

/// Promise 引擎句柄。
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    scheduler: Scheduler,
    clock: Rc<dyn Clock>,
    timers: RefCell<TimerQueue>,
    hooks: Hooks,
    next_id: Cell<u64>,
}

/// [`Engine`] 构建器。
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Rc<dyn Clock>>,
    tick_hook: Option<Rc<dyn TickHook>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Rc::new(clock));
        self
    }

    /// 注入 tick 请求出口；缺省为 [`ManualTick`]。
    pub fn tick_hook(mut self, hook: impl TickHook + 'static) -> Self {
        self.tick_hook = Some(Rc::new(hook));
        self
    }

    pub fn build(self) -> Engine {
        let hook = self.tick_hook.unwrap_or_else(|| Rc::new(ManualTick));
        let clock = self.clock.unwrap_or_else(|| Rc::new(SystemClock::new()));
        Engine {
            inner: Rc::new(EngineInner {
                scheduler: Scheduler::new(self.config.initial_queue_capacity, hook),
                config: self.config,
                clock,
                timers: RefCell::new(TimerQueue::default()),
                hooks: Hooks::default(),
                next_id: Cell::new(0),
            }),
        }
    }
}

impl Engine {
    /// 以默认配置、系统时钟与手动 tick 创建引擎。
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// 以环境变量覆盖后的配置创建引擎。
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::builder().config(EngineConfig::from_env()?).build())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// 当前时钟读数。
    pub fn now(&self) -> Duration {
        self.inner.clock.now()
    }

    /// 两个句柄是否指向同一引擎。
    pub fn ptr_eq(&self, other: &Engine) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- 驱动 -------------------------------------------------------------

    /// 运行一次 tick。
    pub fn run_tick(&self) -> Result<TickReport, EngineError> {
        self.inner.scheduler.tick()
    }

    /// 反复运行 tick 并触发已到期的定时器，直到没有可立即执行的工作。
    ///
    /// 未到期的定时器保持挂起；返回后可通过 [`Engine::pending_timers`] 查看。
    pub fn run_until_idle(&self) -> Result<(), EngineError> {
        loop {
            while self.inner.scheduler.is_armed() || self.inner.scheduler.pending() > 0 {
                self.inner.scheduler.tick()?;
            }
            if self.fire_due_timers() == 0 {
                return Ok(());
            }
        }
    }

    /// 运行到既无排队任务也无挂起定时器为止，必要时让时钟睡眠到下一个到期点。
    pub fn run_to_completion(&self) -> Result<(), EngineError> {
        loop {
            self.run_until_idle()?;
            let next = self.inner.timers.borrow_mut().next_deadline();
            let Some(deadline) = next else {
                return Ok(());
            };
            let now = self.inner.clock.now();
            if deadline > now {
                tracing::debug!(wait = ?(deadline - now), "sleeping until next timer");
                self.inner.clock.sleep(deadline - now);
            }
        }
    }

    /// 触发所有已到期的定时器，返回触发数量。
    pub fn fire_due_timers(&self) -> usize {
        let now = self.inner.clock.now();
        let mut fired = 0;
        loop {
            let due = self.inner.timers.borrow_mut().pop_due(now);
            let Some(callback) = due else { break };
            callback();
            fired += 1;
        }
        if fired > 0 {
            tracing::debug!(fired, now = ?now, "timers fired");
        }
        fired
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// 丢弃全部排队任务与挂起定时器。
    pub fn reset(&self) {
        self.inner.scheduler.reset();
        let timers = std::mem::take(&mut *self.inner.timers.borrow_mut());
        drop(timers);
    }

    // ---- 诊断钩子 ----------------------------------------------------------

    /// 注册“可能未处理的拒绝”钩子，替换默认的 `tracing::warn!` 报告。
    pub fn on_possibly_unhandled_rejection(&self, hook: impl Fn(&Rejection, PromiseId) + 'static) {
        self.inner.hooks.set_unhandled(Rc::new(hook));
    }

    /// 注册“已上报的拒绝随后被处理”钩子。
    pub fn on_rejection_handled(&self, hook: impl Fn(&Rejection, PromiseId) + 'static) {
        self.inner.hooks.set_handled(Rc::new(hook));
    }

    /// 注册致命拒绝钩子；注册后致命拒绝不再中断 tick。
    pub fn on_fatal(&self, hook: impl Fn(&Rejection) + 'static) {
        self.inner.scheduler.set_fatal_hook(Rc::new(hook));
    }

    // ---- 构造 -------------------------------------------------------------

    /// 以执行器创建 Promise，见 [`Promise::new`]。
    #[track_caller]
    pub fn promise<T, F>(&self, executor: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: FnOnce(Resolver<T>) -> Result<(), Rejection>,
    {
        Promise::new(self, executor)
    }

    /// 创建挂起的 Promise 及其解决器。
    #[track_caller]
    pub fn deferred<T: Clone + 'static>(&self) -> (Promise<T>, Resolver<T>) {
        self.deferred_at("deferred", Location::caller())
    }

    pub(crate) fn deferred_at<T: Clone + 'static>(
        &self,
        label: &'static str,
        location: &'static Location<'static>,
    ) -> (Promise<T>, Resolver<T>) {
        let cell = PromiseCell::create(self, label, location, None);
        let resolver = Resolver::fresh(Rc::clone(&cell));
        (Promise::from_cell(cell), resolver)
    }

    /// 已兑现的 Promise。
    #[track_caller]
    pub fn resolve<T: Clone + 'static>(&self, value: T) -> Promise<T> {
        let (promise, resolver) = self.deferred_at("resolve", Location::caller());
        resolver.resolve(value);
        promise
    }

    /// 以 [`Resolution`] 解决的 Promise；传入 Promise 时跟随它。
    #[track_caller]
    pub fn resolve_with<T: Clone + 'static>(&self, resolution: impl Into<Resolution<T>>) -> Promise<T> {
        let (promise, resolver) = self.deferred_at("resolve", Location::caller());
        resolver.resolve_with(resolution);
        promise
    }

    /// 已拒绝的 Promise。
    #[track_caller]
    pub fn reject<T: Clone + 'static>(&self, reason: impl Into<Rejection>) -> Promise<T> {
        let (promise, resolver) = self.deferred_at("reject", Location::caller());
        resolver.reject(reason);
        promise
    }

    /// 同步调用 `f`，把返回值、错误或 panic 包装为 Promise。
    #[track_caller]
    pub fn try_call<T, F>(&self, f: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: FnOnce() -> Result<Resolution<T>, Rejection>,
    {
        let (promise, resolver) = self.deferred_at("try", Location::caller());
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(resolution)) => resolver.resolve_with(resolution),
            Ok(Err(reason)) => resolver.reject(reason),
            Err(payload) => resolver.reject(Rejection::panicked(panic_message(payload.as_ref()))),
        }
        promise
    }

    // ---- crate 内部 --------------------------------------------------------

    pub(crate) fn next_id(&self) -> PromiseId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        PromiseId::from_raw(id)
    }

    pub(crate) fn set_timer(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        let deadline = self.inner.clock.now() + delay;
        let id = self
            .inner
            .timers
            .borrow_mut()
            .schedule(deadline, Box::new(callback));
        tracing::debug!(timer = %id, delay = ?delay, "timer scheduled");
        id
    }

    pub(crate) fn clear_timer(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().cancel(id)
    }

    pub(crate) fn report_unhandled(
        &self,
        reason: &Rejection,
        promise: PromiseId,
    ) -> Result<(), Rejection> {
        let config = &self.inner.config;
        self.inner
            .hooks
            .report_unhandled(reason, promise, config.warnings, config.max_trace_depth)
    }

    pub(crate) fn report_handled(
        &self,
        reason: &Rejection,
        promise: PromiseId,
    ) -> Result<(), Rejection> {
        self.inner.hooks.report_handled(reason, promise)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .field("pending_timers", &self.pending_timers())
            .finish_non_exhaustive()
    }
}

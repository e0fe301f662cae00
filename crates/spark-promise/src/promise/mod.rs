//! 结算核心：Promise 状态机、延续存储与跟随语义。
//!
//! # 设计背景（Why）
//! - Promise 的全部外部行为都可以归结为一个四态状态机：挂起、跟随、兑现、拒绝；
//!   把状态与延续、进度监听、取消父链放在同一个 `RefCell` 中，状态转换就是一次短借用；
//! - 用户回调（延续、进度处理器、thenable 适配器、钩子）全部通过调度器在借用释放后运行，
//!   避免回调里再次访问同一个 Promise 时触发 `BorrowMutError`。
//!
//! # 契约说明（What）
//! - 终态只写入一次，之后不可变；
//! - 跟随者逐字继承被跟随者的终态，拒绝原因保持同一性（[`crate::Rejection::ptr_eq`]）；
//! - 以自身或经由跟随环路解决自身时，以 `SelfResolution` 拒绝；
//! - 附加到已结算 Promise 的延续会被调度执行，绝不会被丢弃，也绝不会在附加调用内同步执行。
//!
//! # 逻辑解析（How）
//! - 兑现值以 `Rc<T>` 存放，读取时先在借用内克隆 `Rc`，释放借用后再克隆 `T`；
//! - 延续以“内联首槽 + 溢出 `Vec`”存放，单延续的常见情形不分配；
//! - 拒绝若在结算时没有任何处理者，会在同一 tick 的慢队列中复查一次，仍未处理则上报。

mod bound;
mod chain;
mod inspect;
mod resolver;

use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::rc::{Rc, Weak};

use crate::cancel::CancelNode;
use crate::diagnostics::TraceFrame;
use crate::engine::Engine;
use crate::error::{Rejection, panic_message};
use crate::ids::PromiseId;

pub use bound::Bound;
pub use inspect::Inspection;
pub use resolver::{Resolution, Resolver, Thenable};

/// Promise 结算后交给延续的结果。
pub type Settled<T> = Result<T, Rejection>;

pub(crate) type Reaction<T> = Box<dyn FnOnce(Settled<T>)>;
pub(crate) type ProgressListener = Rc<RefCell<dyn FnMut(f64)>>;

/// 单线程 Promise 句柄。
///
/// 克隆只增加引用计数；所有克隆观察同一个结算结果。
pub struct Promise<T: 'static> {
    cell: Rc<PromiseCell<T>>,
}

impl<T: 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// 创建 Promise，并同步调用 `executor`。
    ///
    /// # 契约说明（What）
    /// - `executor` 返回 `Err` 或发生 panic 时，若 Promise 尚未被解决则以该原因（panic 转为
    ///   `Panicked`）拒绝；
    /// - `executor` 可以把 [`Resolver`] 保存起来稍后再解决。
    #[track_caller]
    pub fn new<F>(engine: &Engine, executor: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<(), Rejection>,
    {
        let cell = PromiseCell::create(engine, "new", Location::caller(), None);
        let resolver = Resolver::fresh(Rc::clone(&cell));
        let guard = resolver.clone();
        match catch_unwind(AssertUnwindSafe(move || executor(resolver))) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => guard.reject(reason),
            Err(payload) => guard.reject(Rejection::panicked(panic_message(payload.as_ref()))),
        }
        Self::from_cell(cell)
    }

    pub(crate) fn from_cell(cell: Rc<PromiseCell<T>>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Rc<PromiseCell<T>> {
        &self.cell
    }

    pub fn id(&self) -> PromiseId {
        self.cell.id
    }

    pub fn engine(&self) -> &Engine {
        &self.cell.engine
    }

    /// 两个句柄是否指向同一个 Promise。
    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: Clone + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.cell.id)
            .field("state", &self.cell.state_label())
            .finish()
    }
}

pub(crate) enum State<T: 'static> {
    Pending,
    /// 跟随另一个 Promise；`None` 表示正在采纳 thenable。
    Following(Option<Weak<PromiseCell<T>>>),
    Fulfilled(Rc<T>),
    Rejected(Rejection),
}

impl<T: 'static> State<T> {
    fn is_settled(&self) -> bool {
        matches!(self, State::Fulfilled(_) | State::Rejected(_))
    }
}

/// 已结算结果的廉价副本：兑现值仍是共享的 `Rc<T>`，交付时才克隆。
enum Outcome<T: 'static> {
    Fulfilled(Rc<T>),
    Rejected(Rejection),
}

impl<T: 'static> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Fulfilled(value) => Outcome::Fulfilled(Rc::clone(value)),
            Outcome::Rejected(reason) => Outcome::Rejected(reason.clone()),
        }
    }
}

impl<T: Clone + 'static> Outcome<T> {
    fn into_settled(self) -> Settled<T> {
        match self {
            Outcome::Fulfilled(value) => Ok(T::clone(&value)),
            Outcome::Rejected(reason) => Err(reason),
        }
    }
}

/// 延续存储：首个延续内联，其余进入溢出向量。
struct Reactions<T: 'static> {
    first: Option<Reaction<T>>,
    rest: Vec<Reaction<T>>,
}

impl<T: 'static> Default for Reactions<T> {
    fn default() -> Self {
        Self {
            first: None,
            rest: Vec::new(),
        }
    }
}

impl<T: 'static> Reactions<T> {
    fn push(&mut self, reaction: Reaction<T>) {
        if self.first.is_none() && self.rest.is_empty() {
            self.first = Some(reaction);
        } else {
            self.rest.push(reaction);
        }
    }

    fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    fn drain(self) -> impl Iterator<Item = Reaction<T>> {
        self.first.into_iter().chain(self.rest)
    }
}

struct Core<T: 'static> {
    state: State<T>,
    reactions: Reactions<T>,
    progress: Vec<ProgressListener>,
    cancellable: bool,
    cancel_parent: Option<Weak<dyn CancelNode>>,
    is_final: bool,
    handled: bool,
    unhandled_reported: bool,
    trace: Option<Rc<TraceFrame>>,
}

/// Promise 的共享存储。
pub(crate) struct PromiseCell<T: 'static> {
    id: PromiseId,
    engine: Engine,
    me: Weak<PromiseCell<T>>,
    core: RefCell<Core<T>>,
}

impl<T: Clone + 'static> PromiseCell<T> {
    pub(crate) fn create(
        engine: &Engine,
        label: &'static str,
        location: &'static Location<'static>,
        parent_trace: Option<Rc<TraceFrame>>,
    ) -> Rc<Self> {
        let trace = engine
            .config()
            .long_stack_traces
            .then(|| TraceFrame::capture(label, location, parent_trace));
        let id = engine.next_id();
        Rc::new_cyclic(|me| PromiseCell {
            id,
            engine: engine.clone(),
            me: me.clone(),
            core: RefCell::new(Core {
                state: State::Pending,
                reactions: Reactions::default(),
                progress: Vec::new(),
                cancellable: false,
                cancel_parent: None,
                is_final: false,
                handled: false,
                unhandled_reported: false,
                trace,
            }),
        })
    }

    pub(crate) fn id(&self) -> PromiseId {
        self.id
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn trace(&self) -> Option<Rc<TraceFrame>> {
        self.core.borrow().trace.clone()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.core.borrow().state.is_settled()
    }

    fn state_label(&self) -> &'static str {
        match self.core.borrow().state {
            State::Pending => "pending",
            State::Following(_) => "following",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
        }
    }

    // ---- 结算 -------------------------------------------------------------

    pub(crate) fn settle(&self, settled: Settled<T>) {
        match settled {
            Ok(value) => self.fulfill(value),
            Err(reason) => self.reject(reason),
        }
    }

    pub(crate) fn fulfill(&self, value: T) {
        let value = Rc::new(value);
        let reactions = {
            let mut core = self.core.borrow_mut();
            if core.state.is_settled() {
                return;
            }
            core.state = State::Fulfilled(Rc::clone(&value));
            core.progress.clear();
            core.cancel_parent = None;
            core.reactions.take()
        };
        tracing::trace!(promise = %self.id, "promise fulfilled");
        self.dispatch(reactions, Outcome::Fulfilled(value));
    }

    pub(crate) fn reject(&self, reason: Rejection) {
        let (reactions, is_final, unobserved) = {
            let mut core = self.core.borrow_mut();
            if core.state.is_settled() {
                return;
            }
            reason.attach_trace(core.trace.as_ref());
            core.state = State::Rejected(reason.clone());
            core.progress.clear();
            core.cancel_parent = None;
            (core.reactions.take(), core.is_final, !core.handled)
        };
        tracing::trace!(promise = %self.id, kind = %reason.kind(), "promise rejected");
        self.dispatch(reactions, Outcome::Rejected(reason.clone()));

        let scheduler = self.engine.scheduler();
        if is_final {
            scheduler.invoke_later(move || Err(reason));
        } else if unobserved {
            if let Some(cell) = self.me.upgrade() {
                scheduler.invoke_later(move || cell.check_unhandled());
            }
        }
    }

    fn dispatch(&self, reactions: Reactions<T>, outcome: Outcome<T>) {
        let scheduler = self.engine.scheduler();
        for reaction in reactions.drain() {
            let outcome = outcome.clone();
            scheduler.invoke(move || reaction(outcome.into_settled()));
        }
    }

    fn check_unhandled(&self) -> Result<(), Rejection> {
        let reason = {
            let mut core = self.core.borrow_mut();
            if core.handled || core.unhandled_reported {
                return Ok(());
            }
            let reason = match &core.state {
                // 取消由调用方主动发起，不视为遗漏的错误。
                State::Rejected(reason) if !reason.is_cancellation() => reason.clone(),
                _ => return Ok(()),
            };
            core.unhandled_reported = true;
            reason
        };
        self.engine.report_unhandled(&reason, self.id)
    }

    /// 跟随 `target`：继承其终态、进度与可取消性。
    pub(crate) fn follow(&self, target: Rc<PromiseCell<T>>) {
        if self.reaches_self(&target) {
            self.reject(Rejection::self_resolution());
            return;
        }
        let target_cancellable = target.cancellable_flag();
        {
            let mut core = self.core.borrow_mut();
            if core.state.is_settled() {
                return;
            }
            core.state = State::Following(Some(Rc::downgrade(&target)));
            if target_cancellable {
                let parent: Weak<PromiseCell<T>> = Rc::downgrade(&target);
                let parent: Weak<dyn CancelNode> = parent;
                core.cancellable = true;
                core.cancel_parent = Some(parent);
            }
        }
        tracing::trace!(promise = %self.id, target = %target.id, "promise following");
        let Some(me) = self.me.upgrade() else { return };
        target.forward_progress(&me, None);
        target.subscribe(Box::new(move |settled| me.settle(settled)));
    }

    fn reaches_self(&self, target: &Rc<PromiseCell<T>>) -> bool {
        let mut cursor = Some(Rc::clone(target));
        while let Some(node) = cursor {
            if std::ptr::eq(Rc::as_ptr(&node), self) {
                return true;
            }
            cursor = node.followee();
        }
        false
    }

    fn followee(&self) -> Option<Rc<PromiseCell<T>>> {
        match &self.core.borrow().state {
            State::Following(Some(target)) => target.upgrade(),
            _ => None,
        }
    }

    /// 采纳 thenable：在稍后的轮次以新的解决器对调用其适配器。
    pub(crate) fn adopt(&self, thenable: Box<dyn Thenable<T>>) {
        {
            let mut core = self.core.borrow_mut();
            if core.state.is_settled() {
                return;
            }
            core.state = State::Following(None);
        }
        let Some(me) = self.me.upgrade() else { return };
        self.engine.scheduler().invoke(move || {
            let resolver = Resolver::fresh(me);
            let guard = resolver.clone();
            match catch_unwind(AssertUnwindSafe(move || thenable.then(resolver))) {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => guard.reject(reason),
                Err(payload) => {
                    guard.reject(Rejection::panicked(panic_message(payload.as_ref())));
                }
            }
        });
    }

    // ---- 订阅 -------------------------------------------------------------

    /// 注册延续，并把该 Promise 视为“已处理”。
    pub(crate) fn subscribe(&self, reaction: Reaction<T>) {
        self.register(reaction, true);
    }

    /// 注册内部观察者；不影响未处理拒绝的判定。
    pub(crate) fn observe(&self, reaction: Reaction<T>) {
        self.register(reaction, false);
    }

    fn register(&self, reaction: Reaction<T>, handles: bool) {
        let mut core = self.core.borrow_mut();
        let handled_after_report = handles && !core.handled && core.unhandled_reported;
        if handles {
            core.handled = true;
        }
        let outcome = match &core.state {
            State::Fulfilled(value) => Some(Outcome::Fulfilled(Rc::clone(value))),
            State::Rejected(reason) => Some(Outcome::Rejected(reason.clone())),
            State::Pending | State::Following(_) => None,
        };
        let Some(outcome) = outcome else {
            core.reactions.push(reaction);
            return;
        };
        drop(core);

        let scheduler = self.engine.scheduler();
        if let (true, Outcome::Rejected(reason)) = (handled_after_report, &outcome) {
            let engine = self.engine.clone();
            let reason = reason.clone();
            let id = self.id;
            scheduler.invoke_later(move || engine.report_handled(&reason, id));
        }
        scheduler.invoke(move || reaction(outcome.into_settled()));
    }

    // ---- 进度 -------------------------------------------------------------

    pub(crate) fn add_progress_listener(&self, listener: ProgressListener) {
        let mut core = self.core.borrow_mut();
        if !core.state.is_settled() {
            core.progress.push(listener);
        }
    }

    /// 把进度转发给 `downstream`，转发前先调用可选的处理器。
    pub(crate) fn forward_progress<U: Clone + 'static>(
        &self,
        downstream: &Rc<PromiseCell<U>>,
        handler: Option<Box<dyn FnMut(f64)>>,
    ) {
        if self.is_settled() {
            return;
        }
        let downstream = Rc::downgrade(downstream);
        let mut handler = handler;
        let listener: ProgressListener = Rc::new(RefCell::new(move |value: f64| {
            if let Some(handler) = handler.as_mut() {
                handler(value);
            }
            if let Some(downstream) = downstream.upgrade() {
                downstream.notify_progress(value);
            }
        }));
        self.add_progress_listener(listener);
    }

    /// 在稍后的轮次把进度值交给每个监听器；已结算时忽略。
    pub(crate) fn notify_progress(&self, value: f64) {
        let listeners = {
            let core = self.core.borrow();
            if core.state.is_settled() {
                return;
            }
            core.progress.clone()
        };
        let scheduler = self.engine.scheduler();
        for listener in listeners {
            let id = self.id;
            scheduler.invoke(move || {
                let Ok(mut listener) = listener.try_borrow_mut() else {
                    return;
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| (&mut *listener)(value)));
                if let Err(payload) = outcome {
                    tracing::warn!(
                        promise = %id,
                        panic = %panic_message(payload.as_ref()),
                        "progress handler panicked"
                    );
                }
            });
        }
    }

    // ---- 取消与终结标记 -----------------------------------------------------

    pub(crate) fn cancellable_flag(&self) -> bool {
        self.core.borrow().cancellable
    }

    pub(crate) fn set_cancellable(&self, cancellable: bool) {
        self.core.borrow_mut().cancellable = cancellable;
    }

    pub(crate) fn cancel_parent(&self) -> Option<Rc<dyn CancelNode>> {
        self.core
            .borrow()
            .cancel_parent
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// 继承 `parent` 的可取消性，并以它为取消父节点。
    pub(crate) fn inherit_cancellation<P: Clone + 'static>(&self, parent: &Rc<PromiseCell<P>>) {
        if !parent.cancellable_flag() {
            return;
        }
        let weak: Weak<PromiseCell<P>> = Rc::downgrade(parent);
        let weak: Weak<dyn CancelNode> = weak;
        let mut core = self.core.borrow_mut();
        core.cancellable = true;
        core.cancel_parent = Some(weak);
    }

    pub(crate) fn mark_final(&self) {
        self.core.borrow_mut().is_final = true;
    }

    // ---- 检视 -------------------------------------------------------------

    pub(crate) fn inspect(&self) -> Inspection<T> {
        let outcome = match &self.core.borrow().state {
            State::Fulfilled(value) => Some(Outcome::Fulfilled(Rc::clone(value))),
            State::Rejected(reason) => Some(Outcome::Rejected(reason.clone())),
            State::Pending | State::Following(_) => None,
        };
        match outcome.map(Outcome::into_settled) {
            None => Inspection::Pending,
            Some(Ok(value)) => Inspection::Fulfilled(value),
            Some(Err(reason)) => Inspection::Rejected(reason),
        }
    }

    pub(crate) fn reason(&self) -> Option<Rejection> {
        match &self.core.borrow().state {
            State::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

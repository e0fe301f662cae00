//! 协作式微任务调度器。
//!
//! # 设计背景（Why）
//! - Promise 的延续必须在“附加调用之后的某个轮次”执行，且严格按入队顺序；这要求一个独立于调用栈的队列；
//! - 宿主（事件循环、测试驱动、UI 帧回调）各不相同，调度器不能自己决定何时运行，只能通过
//!   [`TickHook`] 告知宿主“需要一次 tick”，由宿主回调 [`Scheduler::tick`]。
//!
//! # 契约说明（What）
//! - [`Scheduler::invoke`] 把任务放入快队列，[`Scheduler::invoke_later`] 放入慢队列；两者都会在尚未武装时
//!   武装一次 tick，且每次 tick 至多通知宿主一次；
//! - 一次 tick：先把快队列清空（包括清空过程中新追加的任务），随后解除武装，再清空慢队列；
//! - 慢队列任务返回 `Err` 表示致命拒绝：若注册了致命钩子则交给钩子并继续；否则停止清空，
//!   若仍有剩余工作则重新武装，并把错误以 [`EngineError::Fatal`] 返回给宿主。
//!
//! # 风险提示（Trade-offs）
//! - 快队列的任务在清空期间可以无限追加新任务，一条无限自我调度的链会让 tick 永不返回；
//!   这与“同一 tick 内排空快队列”的语义一致，由调用方避免。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::diagnostics::FatalHook;
use crate::error::{EngineError, Rejection};
use crate::ring::RingBuffer;

pub(crate) type Task = Box<dyn FnOnce()>;
pub(crate) type LateTask = Box<dyn FnOnce() -> Result<(), Rejection>>;

/// 宿主提供的 tick 请求出口。
///
/// # 契约说明（What）
/// - 调度器从“未武装”变为“已武装”时调用一次 `tick_requested`；
/// - 实现方应在稍后（而不是在该调用内部）调用 [`crate::Engine::run_tick`]。
pub trait TickHook {
    fn tick_requested(&self);
}

/// 不做任何通知的钩子：宿主自行轮询 [`crate::Engine::run_until_idle`]。
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualTick;

impl TickHook for ManualTick {
    fn tick_requested(&self) {}
}

impl<F> TickHook for F
where
    F: Fn(),
{
    fn tick_requested(&self) {
        self()
    }
}

/// 单次 tick 的执行统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fast: usize,
    pub late: usize,
}

/// 快/慢双队列调度器。
pub struct Scheduler {
    fast: RefCell<RingBuffer<Task>>,
    late: RefCell<RingBuffer<LateTask>>,
    armed: Cell<bool>,
    hook: Rc<dyn TickHook>,
    fatal: RefCell<Option<FatalHook>>,
    ticks: Cell<u64>,
}

impl Scheduler {
    pub(crate) fn new(capacity: usize, hook: Rc<dyn TickHook>) -> Self {
        Self {
            fast: RefCell::new(RingBuffer::with_capacity(capacity)),
            late: RefCell::new(RingBuffer::with_capacity(capacity)),
            armed: Cell::new(false),
            hook,
            fatal: RefCell::new(None),
            ticks: Cell::new(0),
        }
    }

    /// 追加到快队列。
    pub(crate) fn invoke(&self, task: impl FnOnce() + 'static) {
        self.fast.borrow_mut().push_back(Box::new(task));
        self.arm();
    }

    /// 追加到慢队列；任务在同一 tick 的快队列清空之后运行。
    pub(crate) fn invoke_later(&self, task: impl FnOnce() -> Result<(), Rejection> + 'static) {
        self.late.borrow_mut().push_back(Box::new(task));
        self.arm();
    }

    pub(crate) fn set_fatal_hook(&self, hook: FatalHook) {
        *self.fatal.borrow_mut() = Some(hook);
    }

    /// 是否已经请求了一次尚未运行的 tick。
    pub fn is_armed(&self) -> bool {
        self.armed.get()
    }

    /// 两条队列中尚未运行的任务数。
    pub fn pending(&self) -> usize {
        self.fast.borrow().len() + self.late.borrow().len()
    }

    /// 已完成的 tick 次数。
    pub fn ticks_run(&self) -> u64 {
        self.ticks.get()
    }

    /// 运行一次 tick。
    ///
    /// # 逻辑解析（How）
    /// 1. 逐个弹出快队列任务并运行，弹出与运行之间不持有队列借用，任务可继续入队；
    /// 2. 快队列清空后解除武装，此后入队的任务会重新请求 tick；
    /// 3. 逐个运行慢队列任务，按致命钩子的有无分流错误。
    pub fn tick(&self) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();
        loop {
            let task = self.fast.borrow_mut().pop_front();
            let Some(task) = task else { break };
            task();
            report.fast += 1;
        }
        self.armed.set(false);

        loop {
            let task = self.late.borrow_mut().pop_front();
            let Some(task) = task else { break };
            report.late += 1;
            if let Err(rejection) = task() {
                let hook = self.fatal.borrow().clone();
                match hook {
                    Some(hook) => hook(&rejection),
                    None => {
                        if self.pending() > 0 {
                            self.arm();
                        }
                        self.ticks.set(self.ticks.get() + 1);
                        tracing::error!(reason = %rejection, "fatal rejection escaped tick");
                        return Err(EngineError::Fatal(rejection));
                    }
                }
            }
        }

        self.ticks.set(self.ticks.get() + 1);
        tracing::debug!(
            fast = report.fast,
            late = report.late,
            tick = self.ticks.get(),
            "scheduler tick drained"
        );
        Ok(report)
    }

    /// 丢弃全部排队任务并解除武装。
    pub fn reset(&self) {
        let fast = std::mem::take(&mut *self.fast.borrow_mut());
        let late = std::mem::take(&mut *self.late.borrow_mut());
        self.armed.set(false);
        // 任务的析构可能释放 Promise，放在借用之外进行。
        drop(fast);
        drop(late);
    }

    fn arm(&self) {
        if !self.armed.replace(true) {
            self.hook.tick_requested();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("armed", &self.armed.get())
            .field("pending", &self.pending())
            .field("ticks", &self.ticks.get())
            .finish_non_exhaustive()
    }
}

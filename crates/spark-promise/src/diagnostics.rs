//! 诊断设施：长栈追踪帧与拒绝相关钩子。
//!
//! # 设计背景（Why）
//! - 异步链路上，拒绝真正发生的位置与原因最初被创建的位置往往相隔多个调度轮次，普通调用栈无法回答
//!   “这个拒绝从哪条链路流过来”；
//! - 未处理的拒绝是最常见的静默故障，需要一个可替换的上报出口。
//!
//! # 契约说明（What）
//! - [`TraceFrame`] 记录 Promise 的创建位置，并链接到其上游 Promise 的帧，形成“缝合”后的长栈；
//!   仅在 [`crate::EngineConfig::long_stack_traces`] 开启时采集；
//! - 未注册钩子且开启告警时，可能未处理的拒绝经 `tracing::warn!` 输出；
//! - 钩子均在调度器的慢队列中调用，不会与 Promise 内部借用重叠；
//! - 钩子 panic 时转换为 `Panicked` 拒绝返回，由调度器按致命拒绝处理。

use std::cell::RefCell;
use std::fmt::Write as _;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::rc::Rc;

use crate::error::{Rejection, panic_message};
use crate::ids::PromiseId;

/// 长栈追踪中的一帧。
#[derive(Debug)]
pub struct TraceFrame {
    label: &'static str,
    location: &'static Location<'static>,
    parent: Option<Rc<TraceFrame>>,
}

impl TraceFrame {
    pub(crate) fn capture(
        label: &'static str,
        location: &'static Location<'static>,
        parent: Option<Rc<TraceFrame>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            label,
            location,
            parent,
        })
    }

    /// 创建该 Promise 的操作名，例如 `then`、`all`。
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn parent(&self) -> Option<&Rc<TraceFrame>> {
        self.parent.as_ref()
    }

    /// 自近及远遍历整条链。
    pub fn frames(&self) -> impl Iterator<Item = &TraceFrame> + '_ {
        std::iter::successors(Some(self), |frame| frame.parent.as_deref())
    }

    /// 渲染为多行文本，超过 `max_depth` 的部分折叠为一行计数。
    pub fn render(&self, max_depth: usize) -> String {
        let mut out = String::new();
        let mut omitted = 0_usize;
        for (depth, frame) in self.frames().enumerate() {
            if depth >= max_depth {
                omitted += 1;
                continue;
            }
            let _ = writeln!(
                out,
                "    at {} ({}:{}:{})",
                frame.label,
                frame.location.file(),
                frame.location.line(),
                frame.location.column()
            );
        }
        if omitted > 0 {
            let _ = writeln!(out, "    ... {omitted} more frame(s)");
        }
        out
    }
}

pub type RejectionHook = Rc<dyn Fn(&Rejection, PromiseId)>;
pub type FatalHook = Rc<dyn Fn(&Rejection)>;

/// 引擎持有的诊断钩子集合。
#[derive(Default)]
pub(crate) struct Hooks {
    unhandled: RefCell<Option<RejectionHook>>,
    handled: RefCell<Option<RejectionHook>>,
}

impl Hooks {
    pub(crate) fn set_unhandled(&self, hook: RejectionHook) {
        *self.unhandled.borrow_mut() = Some(hook);
    }

    pub(crate) fn set_handled(&self, hook: RejectionHook) {
        *self.handled.borrow_mut() = Some(hook);
    }

    /// 上报可能未处理的拒绝；钩子在借用释放后调用，允许其内部再注册钩子。
    pub(crate) fn report_unhandled(
        &self,
        reason: &Rejection,
        promise: PromiseId,
        warnings: bool,
        max_trace_depth: usize,
    ) -> Result<(), Rejection> {
        let hook = self.unhandled.borrow().clone();
        match hook {
            Some(hook) => return guarded(&hook, reason, promise),
            None if warnings => {
                let trace = reason.render_trace(max_trace_depth).unwrap_or_default();
                tracing::warn!(
                    promise = %promise,
                    kind = %reason.kind(),
                    reason = %reason,
                    trace = %trace,
                    "possibly unhandled rejection"
                );
            }
            None => {}
        }
        Ok(())
    }

    pub(crate) fn report_handled(
        &self,
        reason: &Rejection,
        promise: PromiseId,
    ) -> Result<(), Rejection> {
        let hook = self.handled.borrow().clone();
        match hook {
            Some(hook) => guarded(&hook, reason, promise),
            None => {
                tracing::debug!(promise = %promise, "rejection handled after report");
                Ok(())
            }
        }
    }
}

fn guarded(hook: &RejectionHook, reason: &Rejection, promise: PromiseId) -> Result<(), Rejection> {
    catch_unwind(AssertUnwindSafe(|| hook(reason, promise)))
        .map_err(|payload| Rejection::panicked(panic_message(payload.as_ref())))
}

//! 上行取消、超时与延迟。
//!
//! # 设计背景（Why）
//! - 消费者通常只持有链路末端的 Promise，而真正占用资源的是链路起点的生产者；取消必须沿着
//!   “派生自”关系向上游传播，把最外层仍可取消的祖先拒绝掉，再由普通的拒绝透传把结果带回下游；
//! - 取消父链只保存弱引用，下游不会因此延长上游的生命周期。
//!
//! # 契约说明（What）
//! - [`Promise::cancellable`] 标记 Promise 可取消；经 `then` 派生或跟随可取消 Promise 的下游同样可取消；
//! - [`Promise::cancel`] 在同一 tick 的慢队列中执行上行遍历，目标以 `Cancelled` 拒绝；
//!   不可取消或已结算的 Promise 调用 `cancel` 无效果并返回 `false`；
//! - [`Promise::timeout`] 到期时：派生 Promise 可取消则取消整条链，否则只拒绝派生 Promise；
//!   结算后定时器被撤销；
//! - [`Promise::delay`] 只推迟兑现，拒绝立即透传。

use std::borrow::Cow;
use std::panic::Location;
use std::rc::Rc;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::Rejection;
use crate::ids::PromiseId;
use crate::promise::{Promise, PromiseCell, Resolution, Settled};

const CANCELLED_MESSAGE: &str = "operation was cancelled";
const TIMEOUT_MESSAGE: &str = "operation timed out";

/// 取消父链上的一个节点，屏蔽各节点的值类型。
pub(crate) trait CancelNode {
    fn node_id(&self) -> PromiseId;

    /// 可取消且尚未结算。
    fn is_cancellable(&self) -> bool;

    fn parent(&self) -> Option<Rc<dyn CancelNode>>;

    fn reject_cancelled(&self, reason: Rejection);
}

impl<T: Clone + 'static> CancelNode for PromiseCell<T> {
    fn node_id(&self) -> PromiseId {
        self.id()
    }

    fn is_cancellable(&self) -> bool {
        self.cancellable_flag() && !self.is_settled()
    }

    fn parent(&self) -> Option<Rc<dyn CancelNode>> {
        self.cancel_parent()
    }

    fn reject_cancelled(&self, reason: Rejection) {
        self.reject(reason);
    }
}

/// 从 `start` 向上找到最外层仍可取消的祖先并拒绝它。
fn cancel_uphill(start: Rc<dyn CancelNode>, reason: Rejection) -> Option<PromiseId> {
    if !start.is_cancellable() {
        return None;
    }
    let origin = start.node_id();
    let mut target = start;
    while let Some(parent) = target.parent() {
        if !parent.is_cancellable() {
            break;
        }
        target = parent;
    }
    let id = target.node_id();
    tracing::debug!(origin = %origin, target = %id, kind = %reason.kind(), "cancelling chain");
    target.reject_cancelled(reason);
    Some(id)
}

impl<T: Clone + 'static> Promise<T> {
    /// 标记为可取消，返回同一 Promise。
    pub fn cancellable(&self) -> Promise<T> {
        self.cell().set_cancellable(true);
        self.clone()
    }

    /// 返回一个不可取消的跟随者；对它调用 `cancel` 不会影响上游。
    #[track_caller]
    pub fn uncancellable(&self) -> Promise<T> {
        let follower = self.chain_at("uncancellable", Location::caller(), None, |settled| {
            settled.map(Resolution::Value)
        });
        follower.cell().set_cancellable(false);
        follower
    }

    pub fn is_cancellable(&self) -> bool {
        CancelNode::is_cancellable(self.cell().as_ref())
    }

    /// 以默认的 `Cancelled` 原因取消。
    pub fn cancel(&self) -> bool {
        self.cancel_with(Rejection::cancelled(CANCELLED_MESSAGE))
    }

    /// 以给定原因取消；返回是否已安排取消。
    pub fn cancel_with(&self, reason: impl Into<Rejection>) -> bool {
        if !self.is_cancellable() {
            return false;
        }
        let node: Rc<dyn CancelNode> = Rc::clone(self.cell()) as Rc<dyn CancelNode>;
        let reason = reason.into();
        self.engine().scheduler().invoke_later(move || {
            cancel_uphill(node, reason);
            Ok(())
        });
        true
    }

    /// 在 `after` 内未结算则以 `Timeout` 拒绝。
    #[track_caller]
    pub fn timeout(&self, after: Duration) -> Promise<T> {
        self.timeout_at(after, Cow::Borrowed(TIMEOUT_MESSAGE), Location::caller())
    }

    /// 同 [`Promise::timeout`]，使用自定义消息。
    #[track_caller]
    pub fn timeout_with(&self, after: Duration, message: impl Into<Cow<'static, str>>) -> Promise<T> {
        self.timeout_at(after, message.into(), Location::caller())
    }

    fn timeout_at(
        &self,
        after: Duration,
        message: Cow<'static, str>,
        location: &'static Location<'static>,
    ) -> Promise<T> {
        let derived = self.chain_at("timeout", location, None, |settled| {
            settled.map(Resolution::Value)
        });
        let engine = self.engine().clone();
        let target = Rc::downgrade(derived.cell());
        let timer = engine.set_timer(after, move || {
            let Some(cell) = target.upgrade() else { return };
            if cell.is_settled() {
                return;
            }
            let reason = Rejection::timeout(message);
            if CancelNode::is_cancellable(cell.as_ref()) {
                cancel_uphill(cell, reason);
            } else {
                cell.reject(reason);
            }
        });
        derived
            .cell()
            .observe(Box::new(move |_: Settled<T>| {
                engine.clear_timer(timer);
            }));
        derived
    }

    /// 推迟兑现 `after`；拒绝不受影响。
    #[track_caller]
    pub fn delay(&self, after: Duration) -> Promise<T> {
        let location = Location::caller();
        let engine = self.engine().clone();
        self.chain_at("delay", location, None, move |settled| {
            let value = settled?;
            let (gate, resolver) = engine.deferred_at("delay", location);
            engine.set_timer(after, move || resolver.resolve(value));
            Ok(Resolution::Follow(gate))
        })
    }
}

impl Engine {
    /// `after` 之后兑现 `()`。
    #[track_caller]
    pub fn delay(&self, after: Duration) -> Promise<()> {
        self.delay_value((), after)
    }

    /// `after` 之后兑现 `value`。
    #[track_caller]
    pub fn delay_value<T: Clone + 'static>(&self, value: T, after: Duration) -> Promise<T> {
        let (promise, resolver) = self.deferred_at("delay", Location::caller());
        self.set_timer(after, move || resolver.resolve(value));
        promise
    }
}

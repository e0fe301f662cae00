//! 同步检视：读取 Promise 当前状态而不附加延续。

use super::{Promise, Settled};
use crate::error::Rejection;

/// 某一时刻的 Promise 状态快照，也是 `settle` 组合子的元素类型。
#[derive(Clone, Debug)]
pub enum Inspection<T> {
    Pending,
    Fulfilled(T),
    Rejected(Rejection),
}

impl<T> Inspection<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Inspection::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Inspection::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Inspection::Rejected(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Inspection::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&Rejection> {
        match self {
            Inspection::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// 已结算时转换为 [`Settled`]。
    pub fn into_settled(self) -> Option<Settled<T>> {
        match self {
            Inspection::Pending => None,
            Inspection::Fulfilled(value) => Some(Ok(value)),
            Inspection::Rejected(reason) => Some(Err(reason)),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// 当前状态快照；跟随中的 Promise 视为挂起。
    pub fn inspect(&self) -> Inspection<T> {
        self.cell.inspect()
    }

    pub fn is_pending(&self) -> bool {
        !self.cell.is_settled()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.cell.is_settled() && self.cell.reason().is_none()
    }

    pub fn is_rejected(&self) -> bool {
        self.cell.reason().is_some()
    }

    /// 是否因取消而拒绝。
    pub fn is_cancelled(&self) -> bool {
        self.cell
            .reason()
            .is_some_and(|reason| reason.is_cancellation())
    }

    /// 兑现值的副本。
    pub fn value(&self) -> Option<T> {
        match self.inspect() {
            Inspection::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    /// 拒绝原因；与透传该原因的其他 Promise 共享同一句柄。
    pub fn reason(&self) -> Option<Rejection> {
        self.cell.reason()
    }
}

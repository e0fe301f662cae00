use core::fmt;

/// Promise 在所属引擎内的单调编号。
///
/// # 契约说明（What）
/// - 由 [`crate::Engine`] 在创建 Promise 时分配，同一引擎内唯一且递增；
/// - 仅用于诊断与日志关联，不参与结算逻辑。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PromiseId(u64);

impl PromiseId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 返回原始编号。
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise#{}", self.0)
    }
}

/// 定时器句柄，用于在到期前撤销回调。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

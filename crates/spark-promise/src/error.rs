//! 错误分类：Promise 拒绝原因、引擎错误与 `catch_if` 过滤器。
//!
//! # 设计背景（Why）
//! - 拒绝原因需要在整条链路上保持“同一性”：跟随者继承被跟随者的拒绝时，调用方应能判断两者是同一个原因，
//!   因此 [`Rejection`] 是共享句柄，而非每次克隆出新值；
//! - 组合子、超时、取消等内部路径需要可匹配的稳定分类，用户代码则可能以任意错误类型或非错误值拒绝，
//!   两类诉求通过 [`PromiseError`] 的枚举变体统一承载。
//!
//! # 契约说明（What）
//! - [`Rejection::ptr_eq`] 判断两个拒绝是否为同一原因；
//! - [`Rejection::kind`] 给出稳定的 [`ErrorKind`] 分类，供过滤器与日志使用；
//! - 非错误载荷经 [`Rejection::payload`] 原样保存，可通过 [`Rejection::payload_ref`] 向下转型取回。

use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::diagnostics::TraceFrame;

/// 拒绝原因的稳定分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Type,
    Range,
    Cancelled,
    Timeout,
    SelfResolution,
    Operational,
    Aggregate,
    Panicked,
    Custom,
    Payload,
}

impl ErrorKind {
    /// 面向日志的稳定标签。
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Type => "type",
            ErrorKind::Range => "range",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SelfResolution => "self_resolution",
            ErrorKind::Operational => "operational",
            ErrorKind::Aggregate => "aggregate",
            ErrorKind::Panicked => "panicked",
            ErrorKind::Custom => "custom",
            ErrorKind::Payload => "payload",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Promise 可能携带的拒绝原因。
///
/// # 契约说明（What）
/// - `Type`/`Range`：参数或输入不合法（如 `reduce1` 空输入、`some(k)` 中 `k` 超过输入长度）；
/// - `Cancelled`/`Timeout`：由取消与超时路径产生；
/// - `SelfResolution`：Promise 以自身或经由跟随环路解决自身；
/// - `Operational`：回调风格 API 报告的错误，经适配层包装；
/// - `Aggregate`：`some`/`any` 失败时收集到的全部拒绝原因；
/// - `Panicked`：用户回调发生 panic，被捕获后转为拒绝；
/// - `Custom`：任意实现 [`std::error::Error`] 的用户错误；
/// - `Payload`：非错误值，原样保存以便向下转型。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PromiseError {
    #[error("type error: {0}")]
    Type(Cow<'static, str>),
    #[error("range error: {0}")]
    Range(Cow<'static, str>),
    #[error("{0}")]
    Cancelled(Cow<'static, str>),
    #[error("{0}")]
    Timeout(Cow<'static, str>),
    #[error("chaining cycle detected for promise")]
    SelfResolution,
    #[error("operational error: {cause}")]
    Operational { cause: Box<dyn StdError> },
    #[error("aggregate error: {} rejection(s)", .0.len())]
    Aggregate(Vec<Rejection>),
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Custom(Rc<dyn StdError>),
    #[error("rejected with non-error value: {description}")]
    Payload {
        value: Rc<dyn Any>,
        description: String,
    },
}

impl PromiseError {
    /// 返回该错误的分类。
    pub fn kind(&self) -> ErrorKind {
        match self {
            PromiseError::Type(_) => ErrorKind::Type,
            PromiseError::Range(_) => ErrorKind::Range,
            PromiseError::Cancelled(_) => ErrorKind::Cancelled,
            PromiseError::Timeout(_) => ErrorKind::Timeout,
            PromiseError::SelfResolution => ErrorKind::SelfResolution,
            PromiseError::Operational { .. } => ErrorKind::Operational,
            PromiseError::Aggregate(_) => ErrorKind::Aggregate,
            PromiseError::Panicked(_) => ErrorKind::Panicked,
            PromiseError::Custom(_) => ErrorKind::Custom,
            PromiseError::Payload { .. } => ErrorKind::Payload,
        }
    }
}

/// 拒绝原因的共享句柄。
///
/// # 设计背景（Why）
/// - 同一个拒绝会沿着跟随链、组合子与 `then` 透传到多个 Promise，克隆句柄只增加引用计数；
/// - 长栈追踪在首次落入 Promise 时挂载到原因上，后续透传不会覆盖。
///
/// # 风险提示（Trade-offs）
/// - 句柄基于 `Rc`，与 Promise 一样只能在创建它的线程内使用。
#[derive(Clone)]
pub struct Rejection {
    inner: Rc<RejectionInner>,
}

struct RejectionInner {
    error: PromiseError,
    trace: RefCell<Option<Rc<TraceFrame>>>,
}

impl Rejection {
    pub fn new(error: PromiseError) -> Self {
        Self {
            inner: Rc::new(RejectionInner {
                error,
                trace: RefCell::new(None),
            }),
        }
    }

    pub fn type_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(PromiseError::Type(message.into()))
    }

    pub fn range_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(PromiseError::Range(message.into()))
    }

    pub fn cancelled(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(PromiseError::Cancelled(message.into()))
    }

    pub fn timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(PromiseError::Timeout(message.into()))
    }

    pub fn self_resolution() -> Self {
        Self::new(PromiseError::SelfResolution)
    }

    /// 包装回调风格 API 报告的错误。
    pub fn operational(cause: impl Into<Box<dyn StdError>>) -> Self {
        Self::new(PromiseError::Operational {
            cause: cause.into(),
        })
    }

    pub fn aggregate(reasons: Vec<Rejection>) -> Self {
        Self::new(PromiseError::Aggregate(reasons))
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(PromiseError::Panicked(message.into()))
    }

    /// 以任意错误类型拒绝；可通过 [`Rejection::downcast_ref`] 取回。
    pub fn custom<E>(error: E) -> Self
    where
        E: StdError + 'static,
    {
        Self::new(PromiseError::Custom(Rc::new(error)))
    }

    /// 以非错误值拒绝；值被原样保存。
    pub fn payload<V>(value: V) -> Self
    where
        V: Any + fmt::Debug,
    {
        let description = format!("{value:?}");
        Self::new(PromiseError::Payload {
            value: Rc::new(value),
            description,
        })
    }

    pub fn error(&self) -> &PromiseError {
        &self.inner.error
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.error.kind()
    }

    /// 两个句柄是否指向同一个拒绝原因。
    pub fn ptr_eq(&self, other: &Rejection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// 取回 [`Rejection::payload`] 保存的值。
    pub fn payload_ref<V: Any>(&self) -> Option<&V> {
        match &self.inner.error {
            PromiseError::Payload { value, .. } => value.downcast_ref::<V>(),
            _ => None,
        }
    }

    /// 取回 `Custom` 或 `Operational` 中的具体错误类型。
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match &self.inner.error {
            PromiseError::Custom(error) => error.downcast_ref::<E>(),
            PromiseError::Operational { cause } => cause.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// `Aggregate` 中收集到的原因；其他变体返回空切片。
    pub fn reasons(&self) -> &[Rejection] {
        match &self.inner.error {
            PromiseError::Aggregate(reasons) => reasons,
            _ => &[],
        }
    }

    /// 首次落入 Promise 时捕获的长栈帧。
    pub fn trace(&self) -> Option<Rc<TraceFrame>> {
        self.inner.trace.borrow().clone()
    }

    /// 渲染长栈追踪，最多 `max_depth` 帧。
    pub fn render_trace(&self, max_depth: usize) -> Option<String> {
        self.trace().map(|frame| frame.render(max_depth))
    }

    pub(crate) fn attach_trace(&self, frame: Option<&Rc<TraceFrame>>) {
        let Some(frame) = frame else { return };
        let mut slot = self.inner.trace.borrow_mut();
        if slot.is_none() {
            *slot = Some(Rc::clone(frame));
        }
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejection")
            .field("kind", &self.kind())
            .field("error", &self.inner.error)
            .finish()
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.error, f)
    }
}

impl StdError for Rejection {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.inner.error {
            PromiseError::Operational { cause } => Some(cause.as_ref()),
            PromiseError::Custom(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

impl From<PromiseError> for Rejection {
    fn from(error: PromiseError) -> Self {
        Rejection::new(error)
    }
}

impl From<&'static str> for Rejection {
    fn from(value: &'static str) -> Self {
        Rejection::payload(value.to_owned())
    }
}

impl From<String> for Rejection {
    fn from(value: String) -> Self {
        Rejection::payload(value)
    }
}

/// `catch_if` 使用的拒绝过滤器。
///
/// # 契约说明（What）
/// - [`ErrorFilter::kind`]：按 [`ErrorKind`] 匹配；
/// - [`ErrorFilter::of`]：按具体错误类型匹配（`Custom`/`Operational` 中可向下转型者）；
/// - [`ErrorFilter::payload`]：按非错误载荷的类型匹配；
/// - [`ErrorFilter::predicate`]：任意谓词。
#[derive(Clone)]
pub struct ErrorFilter {
    matcher: Rc<dyn Fn(&Rejection) -> bool>,
}

impl ErrorFilter {
    pub fn kind(kind: ErrorKind) -> Self {
        Self::predicate(move |reason| reason.kind() == kind)
    }

    pub fn of<E>() -> Self
    where
        E: StdError + 'static,
    {
        Self::predicate(|reason| reason.downcast_ref::<E>().is_some())
    }

    pub fn payload<V: Any>() -> Self {
        Self::predicate(|reason| reason.payload_ref::<V>().is_some())
    }

    pub fn predicate(matcher: impl Fn(&Rejection) -> bool + 'static) -> Self {
        Self {
            matcher: Rc::new(matcher),
        }
    }

    pub fn matches(&self, reason: &Rejection) -> bool {
        (self.matcher)(reason)
    }
}

impl From<ErrorKind> for ErrorFilter {
    fn from(kind: ErrorKind) -> Self {
        ErrorFilter::kind(kind)
    }
}

impl fmt::Debug for ErrorFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorFilter").finish_non_exhaustive()
    }
}

/// 返回给宿主的引擎级错误。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// 终结 Promise（`done`）的拒绝逃逸，且没有注册致命钩子。
    #[error("fatal rejection escaped a final promise: {0}")]
    Fatal(Rejection),
}

/// 把 `catch_unwind` 得到的 panic 载荷转换为可读消息。
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

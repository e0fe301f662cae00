//! 时间来源与定时器队列。
//!
//! # 设计背景（Why）
//! - `delay`/`timeout` 依赖时间推进；若直接读取系统时钟，超时相关测试将无法复现；
//! - 引擎是单线程协作式的，定时器不需要后台线程，只需宿主在空闲时询问“下一个到期点”并推进时钟。
//!
//! # 契约说明（What）
//! - [`Clock::now`] 返回自时钟原点起的单调偏移量；[`Clock::sleep`] 阻塞（或虚拟推进）给定时长；
//! - [`SystemClock`] 基于 [`Instant`]；[`ManualClock`] 在测试中通过 [`ManualClock::advance`] 推进；
//! - 定时器按“到期时间 + 登记顺序”排序，同一时刻到期的回调按登记顺序触发。

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::ids::TimerId;

/// 可注入的单调时钟。
pub trait Clock {
    /// 自时钟原点起经过的时长。
    fn now(&self) -> Duration;

    /// 等待 `duration`；虚拟时钟直接推进。
    fn sleep(&self, duration: Duration);
}

/// 基于 [`Instant`] 的真实时钟。
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// 手动推进的虚拟时钟。
///
/// # 使用指引（How）
/// - 克隆得到的句柄共享同一时间线：把一个克隆注入引擎，另一个留在测试中调用 [`ManualClock::advance`]；
/// - `sleep` 等价于 `advance`，因此 [`crate::Engine::run_to_completion`] 在虚拟时钟上会立即跳到下一个到期点。
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    elapsed: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

/// 以最小堆组织的定时器队列。
///
/// # 逻辑解析（How）
/// - 堆中只存 `(deadline, id)`，回调放在 `HashMap` 中；
/// - 撤销只移除回调，堆中残留的条目在查询时惰性丢弃。
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Duration, u64)>>,
    callbacks: HashMap<u64, TimerCallback>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn schedule(&mut self, deadline: Duration, callback: TimerCallback) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.callbacks.insert(id, callback);
        TimerId::from_raw(id)
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id.as_u64()).is_some()
    }

    /// 最近的有效到期时间。
    pub(crate) fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// 弹出一个在 `now` 之前（含）到期的回调。
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<TimerCallback> {
        self.discard_cancelled();
        match self.heap.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => {}
            _ => return None,
        }
        let Reverse((_, id)) = self.heap.pop()?;
        self.callbacks.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.callbacks.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }
}

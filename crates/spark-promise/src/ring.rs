//! 环形缓冲区：调度器快/慢两条队列的底层存储。
//!
//! # 设计背景（Why）
//! - 调度器在一次 tick 内会反复执行“尾部追加 + 头部弹出”，`Vec::remove(0)` 的线性搬移在高频结算下不可接受；
//! - 容量固定为 2 的幂，使下标回绕只需一次按位与，避免取模运算。
//!
//! # 契约说明（What）
//! - `push_back`/`pop_front` 均摊 O(1)，严格 FIFO；
//! - 容量写满时按 8 倍扩容，一次性为推送密集型负载预留空间，减少反复扩容；
//! - 最小容量为 [`MIN_CAPACITY`]，调用方传入的初始容量会被上取整到 2 的幂。
//!
//! # 风险提示（Trade-offs）
//! - 缓冲区只增不减；若某次突发把容量推到很高，之后不会自动回收，需要调用方显式 [`RingBuffer::shrink_to_fit`]。

use slots::Slots;

/// 环形缓冲区的最小容量。
pub const MIN_CAPACITY: usize = 16;

/// 扩容倍数。
const GROWTH_FACTOR: usize = 8;

/// 2 的幂容量的环形 FIFO。
///
/// # 逻辑解析（How）
/// - `slots` 长度即容量，未占用位置为 `None`；
/// - `front` 指向队首，`len` 记录元素数，尾部位置为 `(front + len) & mask`；
/// - 扩容时按逻辑顺序把旧元素搬到新数组的 `[0, len)`，并将 `front` 归零。
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Slots<T>,
    front: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// 以默认最小容量创建缓冲区。
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// 以给定容量创建缓冲区，容量会被上取整为 2 的幂且不低于 [`MIN_CAPACITY`]。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Slots::new(normalize_capacity(capacity)),
            front: 0,
            len: 0,
        }
    }

    /// 当前元素数量。
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前容量（始终为 2 的幂）。
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 追加到队尾，写满时先扩容。
    pub fn push_back(&mut self, value: T) {
        if self.len == self.capacity() {
            self.grow(self.capacity() * GROWTH_FACTOR);
        }
        let index = self.physical(self.len);
        self.slots.put(index, value);
        self.len += 1;
    }

    /// 从队首弹出。
    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots.take(self.front);
        self.front = (self.front + 1) & self.mask();
        self.len -= 1;
        value
    }

    /// 查看队首元素而不弹出。
    pub fn front(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            self.slots.get(self.front)
        }
    }

    /// 清空全部元素，保留容量。
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
        self.front = 0;
    }

    /// 按 FIFO 顺序遍历。
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |offset| self.slots.get(self.physical(offset)))
    }

    /// 把容量收缩到能容纳当前元素的最小 2 的幂。
    pub fn shrink_to_fit(&mut self) {
        let target = normalize_capacity(self.len);
        if target < self.capacity() {
            self.grow(target);
        }
    }

    fn mask(&self) -> usize {
        self.capacity() - 1
    }

    fn physical(&self, offset: usize) -> usize {
        (self.front + offset) & self.mask()
    }

    fn grow(&mut self, capacity: usize) {
        let mut next = Slots::new(capacity);
        for offset in 0..self.len {
            let index = self.physical(offset);
            if let Some(value) = self.slots.take(index) {
                next.put(offset, value);
            }
        }
        self.slots = next;
        self.front = 0;
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_capacity(capacity: usize) -> usize {
    capacity.max(MIN_CAPACITY).next_power_of_two()
}

mod slots {
    //! 槽位数组：`None` 表示空闲槽位。

    #[derive(Debug)]
    pub(super) struct Slots<T> {
        cells: Vec<Option<T>>,
    }

    impl<T> Slots<T> {
        pub(super) fn new(capacity: usize) -> Self {
            let mut cells = Vec::with_capacity(capacity);
            cells.resize_with(capacity, || None);
            Self { cells }
        }

        pub(super) fn len(&self) -> usize {
            self.cells.len()
        }

        pub(super) fn put(&mut self, index: usize, value: T) {
            debug_assert!(self.cells[index].is_none(), "ring slot already occupied");
            self.cells[index] = Some(value);
        }

        pub(super) fn take(&mut self, index: usize) -> Option<T> {
            self.cells[index].take()
        }

        pub(super) fn get(&self, index: usize) -> Option<&T> {
            self.cells[index].as_ref()
        }
    }
}

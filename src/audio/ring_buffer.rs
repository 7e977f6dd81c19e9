//! Lock-free SPSC 队列
//!
//! cpal sink 用它在 producer 线程（submit）和设备回调之间传递样本，
//! 以及传递块尾标记。读写位置都是单调递增的计数，
//! 取模容量后才是槽位下标，所以 `total_read()` 可以直接当作
//! "设备已消费的样本数" 使用。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 独占一条 64 字节 cache line 的计数器
#[repr(align(64))]
struct PaddedCounter(AtomicUsize);

impl PaddedCounter {
    fn new() -> Self {
        Self(AtomicUsize::new(0))
    }
}

/// 单生产者单消费者环形队列
///
/// 容量为 2 的幂；写满时 `write` 只写入能放下的部分，不会阻塞。
pub struct RingBuffer<T: Copy + Default> {
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,
    /// 累计写入数（仅生产者修改）
    head: PaddedCounter,
    /// 累计读出数（仅消费者修改）
    tail: PaddedCounter,
    locked: AtomicBool,
}

// SAFETY: 每个槽位在任一时刻只被生产者或消费者之一访问，由 head/tail 的 Acquire/Release 保证
unsafe impl<T: Copy + Default + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(T::default())).collect(),
            mask: capacity - 1,
            head: PaddedCounter::new(),
            tail: PaddedCounter::new(),
            locked: AtomicBool::new(false),
        }
    }

    /// 容量向上取整到 2 的幂
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.max(1).next_power_of_two())
    }

    fn byte_len(&self) -> usize {
        std::mem::size_of_val(&*self.slots)
    }

    /// mlock 队列内存，失败只记录警告
    pub fn lock_memory(&self) -> bool {
        if self.locked.load(Ordering::Acquire) {
            return true;
        }
        let len = self.byte_len();
        let locked = super::lock_region(self.slots.as_ptr() as *const libc::c_void, len);
        if locked {
            self.locked.store(true, Ordering::Release);
            log::debug!("Device queue memory locked: {} bytes", len);
        }
        locked
    }

    /// 生产者：写入尽可能多的元素，返回写入数
    #[inline]
    pub fn write(&self, data: &[T]) -> usize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        let free = self.capacity() - head.wrapping_sub(tail);
        let count = data.len().min(free);

        for (offset, &value) in data[..count].iter().enumerate() {
            // SAFETY: [head, head + count) 不在消费者可见范围内
            unsafe { *self.slots[head.wrapping_add(offset) & self.mask].get() = value };
        }

        self.head.0.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    /// 生产者：写入单个元素，满时返回 false
    #[inline]
    pub fn push(&self, value: T) -> bool {
        self.write(std::slice::from_ref(&value)) == 1
    }

    /// 消费者：读出尽可能多的元素，返回读出数
    #[inline]
    pub fn read(&self, out: &mut [T]) -> usize {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        let count = out.len().min(head.wrapping_sub(tail));

        for (offset, slot) in out[..count].iter_mut().enumerate() {
            // SAFETY: [tail, tail + count) 已由生产者发布
            *slot = unsafe { *self.slots[tail.wrapping_add(offset) & self.mask].get() };
        }

        self.tail.0.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// 消费者：查看队首
    #[inline]
    pub fn peek(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        if self.head.0.load(Ordering::Acquire) == tail {
            return None;
        }
        // SAFETY: 队列非空，队首槽位已发布
        Some(unsafe { *self.slots[tail & self.mask].get() })
    }

    /// 消费者：弹出队首
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let value = self.peek()?;
        self.tail.0.fetch_add(1, Ordering::Release);
        Some(value)
    }

    /// 累计读出的元素数
    #[inline]
    pub fn total_read(&self) -> usize {
        self.tail.0.load(Ordering::Acquire)
    }

    /// 当前排队的元素数
    #[inline]
    pub fn available(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        head.wrapping_sub(self.tail.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.available()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T: Copy + Default> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        if *self.locked.get_mut() {
            super::unlock_region(self.slots.as_ptr() as *const libc::c_void, self.byte_len());
        }
    }
}

//! 块缓冲区
//!
//! 一段连续内存，按 `block_count × block_samples` 划分为等长块，用索引寻址。
//! 本身不加锁，调用方通过空闲块计数串行化访问。

/// 环形块暂存区
pub struct BlockBuffer {
    slots: Box<[i16]>,
    block_count: usize,
    block_samples: usize,
    /// 下一次 claim 返回的块
    next: usize,
    /// 正在填充的块
    current: Option<usize>,
    memory_locked: bool,
}

impl BlockBuffer {
    pub fn new(block_count: usize, block_samples: usize) -> Self {
        assert!(block_count > 0 && block_samples > 0, "empty block buffer");
        Self {
            slots: vec![0i16; block_count * block_samples].into_boxed_slice(),
            block_count,
            block_samples,
            next: 0,
            current: None,
            memory_locked: false,
        }
    }

    /// 认领下一个块：游标按 block_count 取模前进一格
    ///
    /// 调用方必须已确认至少有一个空闲块
    #[inline]
    pub fn claim(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % self.block_count;
        self.current = Some(index);
        index
    }

    /// 当前正在填充的块
    #[inline]
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// 块对应的样本槽范围
    #[inline]
    pub fn address_of(&self, index: usize) -> std::ops::Range<usize> {
        debug_assert!(index < self.block_count);
        let start = index * self.block_samples;
        start..start + self.block_samples
    }

    #[inline]
    pub fn block(&self, index: usize) -> &[i16] {
        &self.slots[self.address_of(index)]
    }

    #[inline]
    pub fn block_mut(&mut self, index: usize) -> &mut [i16] {
        let range = self.address_of(index);
        &mut self.slots[range]
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn block_samples(&self) -> usize {
        self.block_samples
    }

    /// 锁定整段缓冲区内存
    pub fn lock_memory(&mut self) -> bool {
        if !self.memory_locked {
            let len = std::mem::size_of_val(&*self.slots);
            self.memory_locked =
                crate::audio::lock_region(self.slots.as_ptr() as *const libc::c_void, len);
            if self.memory_locked {
                log::debug!("Block buffer memory locked: {} bytes", len);
            }
        }
        self.memory_locked
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        if self.memory_locked {
            let len = std::mem::size_of_val(&*self.slots);
            crate::audio::unlock_region(self.slots.as_ptr() as *const libc::c_void, len);
        }
    }
}

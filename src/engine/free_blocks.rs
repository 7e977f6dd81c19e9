//! 空闲块同步器
//!
//! 单生产者 / 单异步通知者的计数信号量：
//! - producer 在认领块之前递减
//! - 设备 drain 通知（任意线程）递增并唤醒等待者
//!
//! 计数始终在 [0, capacity] 内。等待在循环中重新检查谓词，
//! 虚假唤醒不会被当作有空闲块。

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::LogicError;
use crate::audio::EngineStats;
use crate::sink::DrainNotifier;

struct FreeState {
    count: usize,
    shutdown: bool,
}

pub struct FreeBlocks {
    state: Mutex<FreeState>,
    available: Condvar,
    capacity: usize,
    stats: Arc<EngineStats>,
}

impl FreeBlocks {
    /// 初始全部空闲
    pub fn new(capacity: usize, stats: Arc<EngineStats>) -> Self {
        stats.observe_free_blocks(capacity);
        Self {
            state: Mutex::new(FreeState {
                count: capacity,
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity,
            stats,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// 挂起直到 count > 0
    ///
    /// 返回 false 表示同步器已关闭，调用方应退出
    pub fn wait_until_non_zero(&self) -> bool {
        let mut state = self.lock();
        if state.count == 0 && !state.shutdown {
            self.stats.record_wait();
        }
        while state.count == 0 && !state.shutdown {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !state.shutdown
    }

    /// 认领前递减
    pub fn decrement_on_claim(&self) -> Result<(), LogicError> {
        let mut state = self.lock();
        if state.count == 0 {
            return Err(LogicError::NoFreeBlock);
        }
        state.count -= 1;
        self.stats.observe_free_blocks(state.count);
        Ok(())
    }

    /// 设备 drain 通知：递增并唤醒等待者
    pub fn increment_on_drain_signal(&self) {
        if self.release() {
            self.stats.record_drain();
        }
    }

    /// 归还一个块（提交失败的块不会有 drain 通知）
    ///
    /// 返回是否真的归还了；计数已满时忽略并记录警告
    pub fn release(&self) -> bool {
        let mut state = self.lock();
        if state.count >= self.capacity {
            drop(state);
            log::warn!("Spurious drain signal ignored: all {} blocks already free", self.capacity);
            return false;
        }
        state.count += 1;
        self.stats.observe_free_blocks(state.count);
        drop(state);
        self.available.notify_one();
        true
    }

    /// 关闭：唤醒所有等待者，之后的等待立即返回 false
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.available.notify_all();
    }

    /// 绑定到本同步器的 drain 通知回调
    pub fn notifier(self: &Arc<Self>) -> DrainNotifier {
        let this = Arc::clone(self);
        DrainNotifier::new(move || this.increment_on_drain_signal())
    }
}

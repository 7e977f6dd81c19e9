//! 引擎统计模块
//!
//! producer 线程和 drain 通知路径都会写入，所有操作都是 lock-free 的

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 引擎统计收集器
pub struct EngineStats {
    blocks_submitted: AtomicU64,
    frames_submitted: AtomicU64,
    producer_waits: AtomicU64,
    submit_failures: AtomicU64,
    recoveries: AtomicU64,
    drains: AtomicU64,

    // 自适应写入
    last_write_frames: AtomicUsize,
    last_delay_frames: AtomicUsize,

    // 空闲块计数的观测范围
    min_free_blocks: AtomicUsize,
    max_free_blocks: AtomicUsize,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            blocks_submitted: AtomicU64::new(0),
            frames_submitted: AtomicU64::new(0),
            producer_waits: AtomicU64::new(0),
            submit_failures: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            last_write_frames: AtomicUsize::new(0),
            last_delay_frames: AtomicUsize::new(0),
            min_free_blocks: AtomicUsize::new(usize::MAX),
            max_free_blocks: AtomicUsize::new(0),
        }
    }

    /// 记录一次成功提交
    #[inline]
    pub fn record_submit(&self, frames: usize) {
        self.frames_submitted.fetch_add(frames as u64, Ordering::Relaxed);
        self.last_write_frames.store(frames, Ordering::Relaxed);
        // 最后更新：读到 blocks_submitted 的一方能看到前面的字段
        self.blocks_submitted.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn record_wait(&self) {
        self.producer_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_submit_failure(&self) {
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_drain(&self) {
        self.drains.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delay(&self, frames: usize) {
        self.last_delay_frames.store(frames, Ordering::Relaxed);
    }

    /// 空闲块计数变化时的观测钩子
    #[inline]
    pub fn observe_free_blocks(&self, count: usize) {
        self.min_free_blocks.fetch_min(count, Ordering::Relaxed);
        self.max_free_blocks.fetch_max(count, Ordering::Relaxed);
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        let min_free = self.min_free_blocks.load(Ordering::Relaxed);
        StatsReport {
            blocks_submitted: self.blocks_submitted.load(Ordering::Acquire),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            producer_waits: self.producer_waits.load(Ordering::Relaxed),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            last_write_frames: self.last_write_frames.load(Ordering::Relaxed),
            last_delay_frames: self.last_delay_frames.load(Ordering::Relaxed),
            min_free_blocks: if min_free == usize::MAX { 0 } else { min_free },
            max_free_blocks: self.max_free_blocks.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub blocks_submitted: u64,
    pub frames_submitted: u64,
    pub producer_waits: u64,
    pub submit_failures: u64,
    pub recoveries: u64,
    pub drains: u64,
    pub last_write_frames: usize,
    pub last_delay_frames: usize,
    pub min_free_blocks: usize,
    pub max_free_blocks: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Engine Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Blocks submitted: {}", self.blocks_submitted)?;
        writeln!(f, "Frames submitted: {}", self.frames_submitted)?;
        writeln!(f, "Blocks drained:   {}", self.drains)?;
        writeln!(f)?;

        writeln!(f, "Pacing:")?;
        writeln!(f, "  Last write size: {} frames", self.last_write_frames)?;
        writeln!(f, "  Last device delay: {} frames", self.last_delay_frames)?;
        writeln!(f, "  Producer waits: {}", self.producer_waits)?;
        writeln!(f)?;

        writeln!(f, "Free Blocks:")?;
        writeln!(f, "  Min: {}", self.min_free_blocks)?;
        writeln!(f, "  Max: {}", self.max_free_blocks)?;
        writeln!(f)?;

        writeln!(f, "Submit failures: {}", self.submit_failures)?;
        writeln!(f, "Recoveries: {}", self.recoveries)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_accounting() {
        let stats = EngineStats::new();
        stats.record_submit(512);
        stats.record_submit(100);

        let report = stats.report();
        assert_eq!(report.blocks_submitted, 2);
        assert_eq!(report.frames_submitted, 612);
        assert_eq!(report.last_write_frames, 100);
    }

    #[test]
    fn test_free_block_range() {
        let stats = EngineStats::new();
        assert_eq!(stats.report().min_free_blocks, 0);

        stats.observe_free_blocks(4);
        stats.observe_free_blocks(1);
        stats.observe_free_blocks(3);

        let report = stats.report();
        assert_eq!(report.min_free_blocks, 1);
        assert_eq!(report.max_free_blocks, 4);
    }

    #[test]
    fn test_report_display() {
        let stats = EngineStats::new();
        stats.record_recovery();
        let text = stats.report().to_string();
        assert!(text.contains("Recoveries: 1"));
        assert!(text.contains("Blocks submitted: 0"));
    }
}

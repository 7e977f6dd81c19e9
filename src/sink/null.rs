//! 无硬件 Sink
//!
//! 不输出任何声音，但由一个 "drain clock" 线程按实时速率消费已提交的块，
//! 并在每个块的播放时长结束后发出 drain 通知。适合无声卡环境和压测。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{AudioSink, BlockSpan, DeviceError, DrainNotifier};
use crate::audio::AudioFormat;

/// 时钟线程最多排队的块数，超过后 submit 阻塞
const CLOCK_QUEUE_DEPTH: usize = 64;

/// 时钟线程与 sink 共享的状态
struct ClockState {
    /// 仍在排队的帧数
    queued_frames: AtomicUsize,
    /// 关闭中：剩余块不再等待，直接通知
    closing: AtomicBool,
}

pub struct NullSink {
    format: AudioFormat,
    tx: Option<SyncSender<usize>>,
    state: Arc<ClockState>,
    clock: Option<JoinHandle<()>>,
}

impl NullSink {
    pub fn open(format: AudioFormat, notifier: DrainNotifier) -> Result<Self, DeviceError> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(DeviceError::UnsupportedConfig(format.to_string()));
        }

        let (tx, rx) = mpsc::sync_channel(CLOCK_QUEUE_DEPTH);
        let state = Arc::new(ClockState {
            queued_frames: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        });

        let clock_state = Arc::clone(&state);
        let sample_rate = format.sample_rate;
        let clock = thread::Builder::new()
            .name("null-sink-clock".to_string())
            .spawn(move || Self::clock_main(rx, clock_state, notifier, sample_rate))
            .map_err(|e| DeviceError::Open(format!("failed to spawn clock thread: {}", e)))?;

        log::info!("Null sink opened: {}", format);

        Ok(Self {
            format,
            tx: Some(tx),
            state,
            clock: Some(clock),
        })
    }

    /// 时钟线程主函数
    ///
    /// 截止时间累加计算，sleep 的误差不会累积
    fn clock_main(
        rx: Receiver<usize>,
        state: Arc<ClockState>,
        notifier: DrainNotifier,
        sample_rate: u32,
    ) {
        let mut deadline = Instant::now();

        for frames in rx {
            let now = Instant::now();
            if deadline < now {
                // 空闲过，从当前时刻重新计时
                deadline = now;
            }
            deadline += Duration::from_secs_f64(frames as f64 / sample_rate as f64);

            if !state.closing.load(Ordering::Acquire) {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
            }

            state.queued_frames.fetch_sub(frames, Ordering::AcqRel);
            notifier.notify();
        }

        log::debug!("Null sink clock finished");
    }
}

impl AudioSink for NullSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn submit(&mut self, block: BlockSpan<'_>) -> Result<(), DeviceError> {
        let tx = self.tx.as_ref().ok_or(DeviceError::Closed)?;
        self.state
            .queued_frames
            .fetch_add(block.frames, Ordering::AcqRel);
        tx.send(block.frames).map_err(|_| {
            self.state
                .queued_frames
                .fetch_sub(block.frames, Ordering::AcqRel);
            DeviceError::Submit("null sink clock stopped".to_string())
        })
    }

    fn delay_frames(&mut self) -> usize {
        self.state.queued_frames.load(Ordering::Acquire)
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        match self.clock {
            Some(ref handle) if !handle.is_finished() => Ok(()),
            _ => Err(DeviceError::Recover("null sink clock is not running".to_string())),
        }
    }

    fn close(&mut self) {
        self.state.closing.store(true, Ordering::Release);
        self.tx.take();
        if let Some(clock) = self.clock.take() {
            let _ = clock.join();
            log::info!("Null sink closed");
        }
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.close();
    }
}

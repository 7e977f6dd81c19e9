//! 内存记录 Sink
//!
//! 把每次提交的块复制到 [`CaptureLog`]，在 submit 内同步发出 drain 通知。
//! 可以脚本化：drain 预算、上报的 delay、提交失败、恢复失败。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{AudioSink, BlockSpan, DeviceError, DrainNotifier};
use crate::audio::AudioFormat;

/// 一次提交的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub index: usize,
    pub frames: usize,
    pub samples: Vec<i16>,
}

#[derive(Debug, Default)]
struct CaptureState {
    submissions: Vec<Submission>,
    submit_calls: usize,
    recover_calls: usize,
    close_calls: usize,
}

/// 可跨线程查看的记录
#[derive(Debug, Clone, Default)]
pub struct CaptureLog {
    inner: Arc<Mutex<CaptureState>>,
}

impl CaptureLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 成功提交的块
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }

    /// 所有 submit 调用次数（包括失败的）
    pub fn submit_calls(&self) -> usize {
        self.lock().submit_calls
    }

    pub fn recover_calls(&self) -> usize {
        self.lock().recover_calls
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    /// 所有成功提交的样本，按提交顺序拼接
    pub fn samples(&self) -> Vec<i16> {
        self.lock()
            .submissions
            .iter()
            .flat_map(|s| s.samples.iter().copied())
            .collect()
    }
}

pub struct CaptureSink {
    format: AudioFormat,
    notifier: DrainNotifier,
    log: CaptureLog,
    /// 最多发出多少次 drain 通知（None 表示不限）
    drain_budget: Option<usize>,
    drained: usize,
    reported_delay: usize,
    /// 前 N 次 submit 失败
    failing_submits: usize,
    failing_recover: bool,
    closed: bool,
}

impl CaptureSink {
    pub fn new(format: AudioFormat, notifier: DrainNotifier) -> Self {
        Self {
            format,
            notifier,
            log: CaptureLog::new(),
            drain_budget: None,
            drained: 0,
            reported_delay: 0,
            failing_submits: 0,
            failing_recover: false,
            closed: false,
        }
    }

    /// 把记录写入外部持有的 log
    pub fn with_log(mut self, log: CaptureLog) -> Self {
        self.log = log;
        self
    }

    /// drain 次数用完后不再通知，模拟停滞的设备
    pub fn with_drain_budget(mut self, budget: usize) -> Self {
        self.drain_budget = Some(budget);
        self
    }

    /// `delay_frames` 固定返回该值
    pub fn with_reported_delay(mut self, frames: usize) -> Self {
        self.reported_delay = frames;
        self
    }

    /// 前 `count` 次 submit 返回错误（`usize::MAX` 表示永远失败）
    pub fn with_failing_submits(mut self, count: usize) -> Self {
        self.failing_submits = count;
        self
    }

    /// recover 总是失败
    pub fn with_failing_recover(mut self) -> Self {
        self.failing_recover = true;
        self
    }

    pub fn log(&self) -> CaptureLog {
        self.log.clone()
    }
}

impl AudioSink for CaptureSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn submit(&mut self, block: BlockSpan<'_>) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }

        {
            let mut state = self.log.lock();
            state.submit_calls += 1;
            if state.submit_calls <= self.failing_submits {
                return Err(DeviceError::Submit(format!(
                    "injected failure on submit #{}",
                    state.submit_calls
                )));
            }
            state.submissions.push(Submission {
                index: block.index,
                frames: block.frames,
                samples: block.samples.to_vec(),
            });
        }

        let may_drain = self.drain_budget.map_or(true, |budget| self.drained < budget);
        if may_drain {
            self.drained += 1;
            self.notifier.notify();
        }
        Ok(())
    }

    fn delay_frames(&mut self) -> usize {
        self.reported_delay
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        self.log.lock().recover_calls += 1;
        if self.failing_recover {
            Err(DeviceError::Recover("injected recovery failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().close_calls += 1;
        }
    }
}

impl Drop for CaptureSink {
    fn drop(&mut self) {
        self.close();
    }
}

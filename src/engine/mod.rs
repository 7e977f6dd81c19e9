//! 流式合成引擎
//!
//! producer 线程持续合成样本，按固定大小的块交给音频设备。
//! 核心设计：
//! - 块缓冲区由 producer 线程独占，块按索引循环使用
//! - 空闲块计数 + 条件变量是 producer 唯一的挂起点
//! - 设备 drain 通知（任意线程）归还块并唤醒 producer
//! - 每次提交后按设备上报的延迟调整下一次写入帧数

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_utils::atomic::AtomicCell;
use thiserror::Error;

use crate::audio::{AudioFormat, EngineStats, StatsReport, SAMPLE_BITS};
use crate::sink::{self, AudioSink, DeviceError, DrainNotifier, OutputConfig};

mod block_buffer;
mod free_blocks;
mod producer;
pub mod source;

pub use block_buffer::BlockBuffer;
pub use free_blocks::FreeBlocks;
pub use source::{Oscillator, SampleSource, SharedParam, Waveform};

use producer::Producer;

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
        }
    }
}

/// 配置错误，在 start 时拒绝
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("channel count must be at least 1")]
    InvalidChannels,
    #[error("block count must be at least 2, got {0}")]
    InvalidBlockCount(usize),
    #[error("block length must be at least 1 sample")]
    InvalidBlockSamples,
    #[error("block length {block_samples} is not a whole number of {channels}-channel frames")]
    BlockNotFrameAligned { block_samples: usize, channels: u16 },
    #[error("{block_count} blocks × {block_samples} samples exceeds the {max} sample buffer limit")]
    BufferTooLarge {
        block_count: usize,
        block_samples: usize,
        max: usize,
    },
}

/// 块缓冲区总样本数上限（16-bit 时为 128 MiB）
pub const MAX_BUFFER_SAMPLES: usize = 1 << 26;

/// 违反调用约定，正确使用时不会出现
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogicError {
    #[error("claimed a block while none were free")]
    NoFreeBlock,
    #[error("producer thread panicked")]
    ProducerPanicked,
}

/// 引擎错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Logic error: {0}")]
    Logic(#[from] LogicError),
    #[error("Failed to spawn producer thread: {0}")]
    Spawn(String),
}

/// 引擎配置
///
/// 启动后不可变，完全决定缓冲区大小和时序
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 采样率（Hz）
    pub sample_rate: u32,
    /// 声道数
    pub channels: u16,
    /// 块数量
    pub block_count: usize,
    /// 每块样本数（交织，必须是声道数的整数倍）
    pub block_samples: usize,
    /// 输出配置
    pub output: OutputConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
            block_count: 8,
            block_samples: 512,
            output: OutputConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate);
        }
        if self.channels == 0 {
            return Err(ConfigError::InvalidChannels);
        }
        if self.block_count < 2 {
            return Err(ConfigError::InvalidBlockCount(self.block_count));
        }
        if self.block_samples == 0 {
            return Err(ConfigError::InvalidBlockSamples);
        }
        if self.block_samples % self.channels as usize != 0 {
            return Err(ConfigError::BlockNotFrameAligned {
                block_samples: self.block_samples,
                channels: self.channels,
            });
        }
        match self.block_count.checked_mul(self.block_samples) {
            Some(total) if total <= MAX_BUFFER_SAMPLES => Ok(()),
            _ => Err(ConfigError::BufferTooLarge {
                block_count: self.block_count,
                block_samples: self.block_samples,
                max: MAX_BUFFER_SAMPLES,
            }),
        }
    }

    /// 引擎输出格式
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, SAMPLE_BITS)
    }

    /// 每块帧数
    pub fn frames_per_block(&self) -> usize {
        self.block_samples / self.channels.max(1) as usize
    }

    /// 单块时长（秒）
    pub fn block_duration_secs(&self) -> f64 {
        self.format().frames_to_secs(self.frames_per_block())
    }

    /// 全部块的样本数，即可能同时在途的最大样本数
    pub fn total_samples(&self) -> usize {
        self.block_count.saturating_mul(self.block_samples)
    }
}

/// producer 线程与控制端共享的状态
pub(crate) struct EngineShared {
    pub(crate) running: AtomicBool,
    state: AtomicU8,
    pub(crate) global_time: AtomicCell<f64>,
    failure: Mutex<Option<EngineError>>,
    pub(crate) stats: Arc<EngineStats>,
}

impl EngineShared {
    fn new(stats: Arc<EngineStats>) -> Self {
        Self {
            running: AtomicBool::new(false),
            state: AtomicU8::new(EngineState::Idle.as_u8()),
            global_time: AtomicCell::new(0.0),
            failure: Mutex::new(None),
            stats,
        }
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 只保留第一个错误
    pub(crate) fn record_failure(&self, error: EngineError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn failure(&self) -> Option<EngineError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// 引擎句柄
pub struct Engine {
    config: EngineConfig,
    format: AudioFormat,
    shared: Arc<EngineShared>,
    free_blocks: Arc<FreeBlocks>,
    producer: Option<JoinHandle<()>>,
}

impl Engine {
    /// 按配置选择的后端打开设备并启动
    pub fn start<S: SampleSource>(config: EngineConfig, source: S) -> Result<Self, EngineError> {
        let output = config.output.clone();
        let queue_samples = config.total_samples();
        Self::start_with(config, source, move |format, notifier| {
            sink::open_sink(&output, format, queue_samples, notifier)
        })
    }

    /// 用自定义的 sink 打开函数启动
    ///
    /// 配置无效或打开失败时立即返回，不会创建线程，也不持有任何资源
    pub fn start_with<S, F>(config: EngineConfig, source: S, open: F) -> Result<Self, EngineError>
    where
        S: SampleSource,
        F: FnOnce(AudioFormat, DrainNotifier) -> Result<Box<dyn AudioSink>, DeviceError>,
    {
        config.validate()?;
        let format = config.format();

        let stats = Arc::new(EngineStats::new());
        let free_blocks = Arc::new(FreeBlocks::new(config.block_count, Arc::clone(&stats)));
        let shared = Arc::new(EngineShared::new(stats));

        let mut blocks = BlockBuffer::new(config.block_count, config.block_samples);
        if config.output.lock_memory {
            blocks.lock_memory();
        }

        let sink = open(format, free_blocks.notifier())?;
        // 块缓冲区固定为 16-bit 交织样本，sink 必须按同一格式打开
        if sink.format() != format {
            return Err(DeviceError::UnsupportedConfig(format!(
                "sink opened as {}, engine produces {}",
                sink.format(),
                format
            ))
            .into());
        }

        log::info!(
            "Starting engine: {} | {} blocks × {} samples ({:.1}ms per block)",
            format,
            config.block_count,
            config.block_samples,
            config.block_duration_secs() * 1000.0
        );

        shared.running.store(true, Ordering::Release);
        shared.set_state(EngineState::Running);

        let producer = Producer::new(
            &config,
            source,
            sink,
            blocks,
            Arc::clone(&free_blocks),
            Arc::clone(&shared),
        );
        let handle = thread::Builder::new()
            .name("producer".to_string())
            .spawn(move || producer.run())
            .map_err(|e| {
                shared.running.store(false, Ordering::Release);
                shared.set_state(EngineState::Stopped);
                EngineError::Spawn(e.to_string())
            })?;

        Ok(Self {
            config,
            format,
            shared,
            free_blocks,
            producer: Some(handle),
        })
    }

    /// 停止并等待 producer 线程退出
    ///
    /// 幂等：重复调用直接返回
    pub fn stop(&mut self) -> Result<(), EngineError> {
        let Some(handle) = self.producer.take() else {
            return Ok(());
        };

        if self.shared.state() == EngineState::Running {
            self.shared.set_state(EngineState::Stopping);
        }
        self.shared.running.store(false, Ordering::Release);
        // 唤醒可能挂起在空闲块等待上的 producer
        self.free_blocks.shutdown();

        let joined = handle.join();
        self.shared.set_state(EngineState::Stopped);

        if joined.is_err() {
            let error = EngineError::Logic(LogicError::ProducerPanicked);
            self.shared.record_failure(error.clone());
            return Err(error);
        }

        log::info!("Engine stopped at {:.3}s", self.current_time());
        Ok(())
    }

    /// 全局时间（秒），可并发读取，仅供参考
    pub fn current_time(&self) -> f64 {
        self.shared.global_time.load()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// 状态检查：返回 producer 记录的错误（如设备失败）
    pub fn check(&self) -> Result<(), EngineError> {
        match self.shared.failure() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// 当前空闲块数
    pub fn free_blocks(&self) -> usize {
        self.free_blocks.count()
    }

    pub fn stats(&self) -> StatsReport {
        self.shared.stats.report()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CaptureLog, CaptureSink, SinkBackend};
    use std::time::{Duration, Instant};

    fn config(sample_rate: u32, block_count: usize, block_samples: usize) -> EngineConfig {
        EngineConfig {
            sample_rate,
            channels: 1,
            block_count,
            block_samples,
            output: OutputConfig::default(),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for engine");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// 以 capture sink 启动；drain 预算用完后 producer 停在等待上
    fn start_captured<S: SampleSource>(
        config: EngineConfig,
        source: S,
        build: impl FnOnce(CaptureSink) -> CaptureSink,
    ) -> (Engine, CaptureLog) {
        let log = CaptureLog::new();
        let sink_log = log.clone();
        let engine = Engine::start_with(config, source, move |format, notifier| {
            let sink = build(CaptureSink::new(format, notifier).with_log(sink_log));
            Ok(Box::new(sink) as Box<dyn AudioSink>)
        })
        .unwrap();
        (engine, log)
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 1);
        assert_eq!(config.block_count, 8);
        assert_eq!(config.block_samples, 512);
        assert_eq!(config.output.backend, SinkBackend::Cpal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut c = config(0, 2, 512);
        assert_eq!(c.validate(), Err(ConfigError::InvalidSampleRate));

        c = config(44100, 1, 512);
        assert_eq!(c.validate(), Err(ConfigError::InvalidBlockCount(1)));

        c = config(44100, 2, 0);
        assert_eq!(c.validate(), Err(ConfigError::InvalidBlockSamples));

        c = config(44100, 2, 512);
        c.channels = 0;
        assert_eq!(c.validate(), Err(ConfigError::InvalidChannels));

        c.channels = 2;
        c.block_samples = 511;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::BlockNotFrameAligned { .. })
        ));
    }

    #[test]
    fn test_invalid_config_never_opens_sink() {
        let mut opened = false;
        let result = Engine::start_with(config(44100, 1, 512), |_: f64| 0.0, |format, notifier| {
            opened = true;
            Ok(Box::new(CaptureSink::new(format, notifier)) as Box<dyn AudioSink>)
        });
        assert!(matches!(result, Err(EngineError::Config(_))));
        assert!(!opened);
    }

    #[test]
    fn test_open_failure_is_returned() {
        let result = Engine::start_with(config(44100, 2, 512), |_: f64| 0.0, |_, _| {
            Err(DeviceError::NoDevice)
        });
        assert!(matches!(
            result,
            Err(EngineError::Device(DeviceError::NoDevice))
        ));
    }

    #[test]
    fn test_sink_format_mismatch_is_rejected() {
        for wrong in [AudioFormat::new(44100, 1, 24), AudioFormat::new(44100, 2, 16)] {
            let log = CaptureLog::new();
            let sink_log = log.clone();
            let result = Engine::start_with(config(44100, 2, 512), |_: f64| 1.0, move |_, notifier| {
                let sink = CaptureSink::new(wrong, notifier).with_log(sink_log);
                Ok(Box::new(sink) as Box<dyn AudioSink>)
            });

            assert!(matches!(
                result,
                Err(EngineError::Device(DeviceError::UnsupportedConfig(_)))
            ));
            assert_eq!(log.submit_calls(), 0);
            assert_eq!(log.close_calls(), 1);
        }
    }

    #[test]
    fn test_oversized_buffer_is_rejected() {
        let c = config(44100, 2, usize::MAX / 2 + 1);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::BufferTooLarge { .. })
        ));
        assert_eq!(c.total_samples(), usize::MAX);

        let c = config(44100, 4, MAX_BUFFER_SAMPLES / 2);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::BufferTooLarge { .. })
        ));
        assert!(config(44100, 2, MAX_BUFFER_SAMPLES / 2).validate().is_ok());

        let mut opened = false;
        let result = Engine::start_with(
            config(44100, 2, usize::MAX / 2 + 1),
            |_: f64| 0.0,
            |format, notifier| {
                opened = true;
                Ok(Box::new(CaptureSink::new(format, notifier)) as Box<dyn AudioSink>)
            },
        );
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::BufferTooLarge { .. }))
        ));
        assert!(!opened);

        // start 在打开设备前同样拒绝，不会溢出
        let result = Engine::start(config(44100, 2, usize::MAX / 2 + 1), |_: f64| 0.0);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_silence_quantizes_to_zero() {
        let (mut engine, log) =
            start_captured(config(44100, 2, 512), |_: f64| 0.0, |s| s.with_drain_budget(3));

        wait_for(|| engine.stats().blocks_submitted == 5);
        engine.stop().unwrap();

        let submissions = log.submissions();
        assert_eq!(submissions.len(), 5);
        assert!(submissions.iter().all(|s| s.frames == 512));
        assert!(log.samples().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_sine_peak_magnitude() {
        let mut osc = Oscillator::fixed(Waveform::Sine, 440.0, 0.3);
        let (mut engine, log) = start_captured(
            config(44100, 2, 512),
            move |t: f64| osc.sample(t),
            |s| s.with_drain_budget(20),
        );

        wait_for(|| engine.stats().blocks_submitted == 22);
        engine.stop().unwrap();

        let peak = log
            .samples()
            .iter()
            .map(|&s| (s as i32).abs())
            .max()
            .unwrap();
        assert!((9829..=9830).contains(&peak), "peak = {}", peak);
    }

    #[test]
    fn test_blocks_submitted_in_cyclic_order() {
        let (mut engine, log) =
            start_captured(config(8000, 3, 16), |_: f64| 0.5, |s| s.with_drain_budget(10));

        wait_for(|| engine.stats().blocks_submitted == 13);
        engine.stop().unwrap();

        let indices: Vec<usize> = log.submissions().iter().map(|s| s.index).collect();
        let expected: Vec<usize> = (0..13).map(|k| k % 3).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn test_global_time_is_exact() {
        let times = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&times);
        let source = move |t: f64| {
            recorded.lock().unwrap().push(t);
            0.0
        };

        let (mut engine, _log) =
            start_captured(config(8000, 2, 64), source, |s| s.with_drain_budget(6));

        wait_for(|| engine.stats().blocks_submitted == 8);
        engine.stop().unwrap();

        let frames = 8 * 64;
        assert_eq!(engine.current_time(), frames as f64 / 8000.0);

        let times = times.lock().unwrap();
        assert_eq!(times.len(), frames);
        for (n, &t) in times.iter().enumerate() {
            assert_eq!(t, n as f64 / 8000.0);
        }
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_free_blocks_stay_in_range() {
        let (mut engine, _log) =
            start_captured(config(44100, 4, 32), |_: f64| 0.1, |s| s.with_drain_budget(50));

        wait_for(|| engine.stats().producer_waits == 1);
        assert_eq!(engine.free_blocks(), 0);
        engine.stop().unwrap();

        let report = engine.stats();
        assert_eq!(report.blocks_submitted, 54);
        assert_eq!(report.max_free_blocks, 4);
        assert_eq!(report.min_free_blocks, 0);
        assert_eq!(report.drains, 50);
    }

    #[test]
    fn test_write_size_follows_reported_delay() {
        let (mut engine, log) = start_captured(config(44100, 2, 512), |_: f64| 0.2, |s| {
            s.with_drain_budget(4).with_reported_delay(100)
        });

        wait_for(|| engine.stats().blocks_submitted == 6);
        engine.stop().unwrap();

        let submissions = log.submissions();
        assert_eq!(submissions[0].frames, 512);
        for s in &submissions[1..] {
            assert_eq!(s.frames, 100);
            assert_eq!(s.samples.len(), 100);
        }
        assert_eq!(engine.stats().last_write_frames, 100);
    }

    #[test]
    fn test_write_size_clamped_to_block() {
        let (mut engine, log) = start_captured(config(44100, 2, 64), |_: f64| 0.0, |s| {
            s.with_drain_budget(2).with_reported_delay(10_000)
        });

        wait_for(|| engine.stats().blocks_submitted == 4);
        engine.stop().unwrap();

        assert!(log.submissions().iter().all(|s| s.frames == 64));
    }

    #[test]
    fn test_unrecoverable_device_stops_engine() {
        let (mut engine, log) = start_captured(config(44100, 2, 512), |_: f64| 0.0, |s| {
            s.with_failing_submits(usize::MAX).with_failing_recover()
        });

        wait_for(|| engine.state() == EngineState::Stopped);

        assert!(matches!(
            engine.check(),
            Err(EngineError::Device(DeviceError::Submit(_)))
        ));
        assert_eq!(log.submit_calls(), 1);
        assert_eq!(log.recover_calls(), 1);
        assert_eq!(log.submission_count(), 0);

        engine.stop().unwrap();
        assert_eq!(log.close_calls(), 1);
        // 记录的错误在 stop 之后仍然可读
        assert!(engine.check().is_err());
    }

    #[test]
    fn test_recovered_failures_do_not_leak_blocks() {
        let (mut engine, log) = start_captured(config(44100, 2, 128), |_: f64| 0.0, |s| {
            s.with_failing_submits(5)
        });

        wait_for(|| engine.stats().blocks_submitted >= 3);
        engine.stop().unwrap();

        assert!(engine.check().is_ok());
        assert_eq!(log.recover_calls(), 5);
        let report = engine.stats();
        assert_eq!(report.submit_failures, 5);
        assert_eq!(report.recoveries, 5);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut engine, log) =
            start_captured(config(44100, 2, 256), |_: f64| 0.0, |s| s.with_drain_budget(1));

        wait_for(|| engine.stats().blocks_submitted == 3);
        assert!(engine.stop().is_ok());
        assert!(engine.stop().is_ok());
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(log.close_calls(), 1);
        drop(engine);
        assert_eq!(log.close_calls(), 1);
    }

    #[test]
    fn test_stop_while_running_freely() {
        let (mut engine, log) = start_captured(config(44100, 2, 64), |_: f64| 0.0, |s| s);

        wait_for(|| engine.stats().blocks_submitted >= 100);
        assert!(engine.is_running());
        engine.stop().unwrap();

        // 没有半个块：每个已填充的块都被完整提交
        let submitted = engine.stats().frames_submitted;
        assert_eq!(engine.current_time(), submitted as f64 / 44100.0);
        assert_eq!(log.submission_count() as u64, engine.stats().blocks_submitted);
    }

    #[test]
    fn test_stereo_fills_whole_frames() {
        let mut c = config(1000, 2, 8);
        c.channels = 2;
        let (mut engine, log) =
            start_captured(c, |t: f64| t * 100.0, |s| s.with_drain_budget(0));

        wait_for(|| engine.stats().blocks_submitted == 2);
        engine.stop().unwrap();

        let submissions = log.submissions();
        assert_eq!(submissions[0].frames, 4);
        for frame in submissions[0].samples.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
        // 每帧推进一次时间：2 块 × 4 帧
        assert_eq!(engine.current_time(), 8.0 / 1000.0);
    }

    #[test]
    fn test_null_backend_plays_in_real_time() {
        let mut c = config(8000, 4, 80);
        c.output.backend = SinkBackend::Null;
        let mut engine = Engine::start(c, |_: f64| 0.0).unwrap();

        wait_for(|| engine.current_time() >= 0.05);
        engine.stop().unwrap();
        assert!(engine.check().is_ok());
        assert!(engine.stats().blocks_submitted >= 5);
    }
}

//! 音频 Sink
//!
//! 引擎只通过 [`AudioSink`] 能力接口和设备打交道：
//! open / submit / delay / recover / close。
//! 具体后端在启动时按 [`SinkBackend`] 选择。

use std::sync::Arc;

use thiserror::Error;

use crate::audio::AudioFormat;

pub mod capture;
pub mod cpal_output;
pub mod null;

pub use capture::{CaptureLog, CaptureSink, Submission};
pub use cpal_output::{list_output_devices, CpalSink, OutputDeviceInfo};
pub use null::NullSink;

/// 设备错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Failed to open audio device: {0}")]
    Open(String),
    #[error("Unsupported device configuration: {0}")]
    UnsupportedConfig(String),
    #[error("Failed to write audio to device: {0}")]
    Submit(String),
    #[error("Device recovery failed: {0}")]
    Recover(String),
    #[error("Device is closed")]
    Closed,
}

/// 一次提交给 sink 的样本区间
///
/// 总是某个已认领块的前缀，`samples.len() == frames * channels`
#[derive(Debug, Clone, Copy)]
pub struct BlockSpan<'a> {
    /// 块索引
    pub index: usize,
    /// 帧数
    pub frames: usize,
    /// 交织样本
    pub samples: &'a [i16],
}

/// Drain 通知
///
/// 设备播放完一个已提交的块后调用 [`DrainNotifier::notify`]，
/// 可以在任意线程（包括设备回调线程）调用。
#[derive(Clone)]
pub struct DrainNotifier {
    inner: Arc<dyn Fn() + Send + Sync>,
}

impl DrainNotifier {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// 不做任何事的通知（用于不关心 drain 的场景）
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    #[inline]
    pub fn notify(&self) {
        (self.inner)()
    }
}

impl std::fmt::Debug for DrainNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DrainNotifier")
    }
}

/// 设备能力接口
///
/// 打开即由各后端的构造函数完成；`close` 必须幂等，
/// 各实现的 `Drop` 也会调用它。
pub trait AudioSink: Send {
    /// 实际打开的格式
    fn format(&self) -> AudioFormat;

    /// 阻塞写入一个块
    ///
    /// 设备队列满时可以阻塞（背压），不可中途取消
    fn submit(&mut self, block: BlockSpan<'_>) -> Result<(), DeviceError>;

    /// 设备下游仍在排队的帧数
    fn delay_frames(&mut self) -> usize;

    /// 提交失败后的尽力恢复
    fn recover(&mut self) -> Result<(), DeviceError>;

    /// 释放设备资源
    fn close(&mut self);
}

/// 后端选择
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SinkBackend {
    /// 平台音频设备（ALSA/JACK、WASAPI、CoreAudio）
    #[default]
    Cpal,
    /// 无硬件，按实时速率消费
    Null,
}

impl std::fmt::Display for SinkBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpal => write!(f, "cpal"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// 输出配置
#[derive(Clone, Debug, Default)]
pub struct OutputConfig {
    pub backend: SinkBackend,
    /// 按名称选择输出设备（None 表示系统默认设备）
    pub device: Option<String>,
    /// 是否 mlock 块缓冲区和设备队列
    pub lock_memory: bool,
}

/// 按配置打开 sink
///
/// `queue_samples` 是引擎可能同时在途的最大样本数，
/// 后端据此确定内部队列大小。
pub fn open_sink(
    config: &OutputConfig,
    format: AudioFormat,
    queue_samples: usize,
    notifier: DrainNotifier,
) -> Result<Box<dyn AudioSink>, DeviceError> {
    log::info!("Opening {} sink: {}", config.backend, format);
    match config.backend {
        SinkBackend::Cpal => {
            let sink = CpalSink::open(config, format, queue_samples, notifier)?;
            Ok(Box::new(sink))
        }
        SinkBackend::Null => {
            let sink = NullSink::open(format, notifier)?;
            Ok(Box::new(sink))
        }
    }
}

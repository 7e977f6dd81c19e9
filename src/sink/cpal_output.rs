//! cpal 设备输出
//!
//! cpal 是 pull 模型（设备回调取数据），引擎是 push 模型（阻塞写入块）。
//! 两者之间用 lock-free SPSC ring buffer 连接：
//!
//! - submit：把块样本写入样本队列，再把块尾位置写入标记队列
//! - 设备回调：从样本队列读取，累计已消费样本数，
//!   每当越过一个块尾标记就发出一次 drain 通知
//! - delay：样本队列中剩余样本 / 声道数
//!
//! 回调内不分配、不做 I/O：scratch 按设备 buffer 上限预分配，更长的回调分段处理。
//! 唯一的锁是 drain 通知里引擎空闲块计数的短临界区。
//!
//! 流出错后 recover 重建整个流：旧流先停止，未 drain 的块全部按 drain 通知归还，
//! 样本队列和标记队列换成新的。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{AudioSink, BlockSpan, DeviceError, DrainNotifier, OutputConfig};
use crate::audio::{AudioFormat, RingBuffer};

/// 设备信息
#[derive(Debug, Clone)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// 默认输出配置的描述
    pub default_config: Option<String>,
}

/// 列出当前 host 的所有输出设备
pub fn list_output_devices() -> Result<Vec<OutputDeviceInfo>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| DeviceError::Open(e.to_string()))?;

    let mut infos = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        let default_config = device.default_output_config().ok().map(|c| {
            format!(
                "{}Hz {}ch {:?}",
                c.sample_rate().0,
                c.channels(),
                c.sample_format()
            )
        });
        infos.push(OutputDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            default_config,
        });
    }
    Ok(infos)
}

/// 按名称查找设备（大小写不敏感的子串匹配），None 表示默认设备
fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let Some(wanted) = name else {
        return host.default_output_device().ok_or(DeviceError::NoDevice);
    };

    let wanted = wanted.to_lowercase();
    let devices = host
        .output_devices()
        .map_err(|e| DeviceError::Open(e.to_string()))?;
    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name.to_lowercase().contains(&wanted) {
                return Ok(device);
            }
        }
    }

    log::warn!("Device '{}' not found, using system default", wanted);
    host.default_output_device().ok_or(DeviceError::NoDevice)
}

/// 设备流的样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamFormat {
    /// 整数直通
    I16,
    /// 设备不支持 i16 时的回退
    F32,
}

/// 选择支持目标采样率和声道数的流格式，优先 i16
fn select_stream_format(
    device: &cpal::Device,
    format: &AudioFormat,
) -> Result<StreamFormat, DeviceError> {
    let rate = cpal::SampleRate(format.sample_rate);
    let ranges = device
        .supported_output_configs()
        .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;

    let mut fallback = None;
    for range in ranges {
        if range.channels() != format.channels
            || range.min_sample_rate() > rate
            || range.max_sample_rate() < rate
        {
            continue;
        }
        match range.sample_format() {
            cpal::SampleFormat::I16 => return Ok(StreamFormat::I16),
            cpal::SampleFormat::F32 => fallback = Some(StreamFormat::F32),
            _ => {}
        }
    }

    fallback.ok_or_else(|| DeviceError::UnsupportedConfig(format.to_string()))
}

/// 设备未给出 buffer 上限时回调 scratch 的帧数
const DEFAULT_CALLBACK_FRAMES: usize = 4096;
/// scratch 预分配的帧数上限，更长的回调分段处理
const MAX_CALLBACK_FRAMES: usize = 16384;
/// 回调停止消费样本多久之后 submit 放弃
const MIN_STALL_TIMEOUT: Duration = Duration::from_millis(500);

/// 设备单次回调的最大帧数
fn callback_frames(device: &cpal::Device) -> usize {
    match device.default_output_config().map(|c| c.buffer_size().clone()) {
        Ok(cpal::SupportedBufferSize::Range { max, .. }) => {
            (max as usize).clamp(1, MAX_CALLBACK_FRAMES)
        }
        _ => DEFAULT_CALLBACK_FRAMES,
    }
}

/// 设备流错误状态（错误回调写入，submit 读取）
struct StreamStatus {
    failed: AtomicBool,
    last_error: Mutex<Option<String>>,
    underruns: AtomicU64,
}

impl StreamStatus {
    fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            underruns: AtomicU64::new(0),
        }
    }

    fn fail(&self, message: String) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
        self.failed.store(true, Ordering::Release);
    }

    /// 新流启动前清除错误；underrun 计数保留
    fn reset(&self) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.failed.store(false, Ordering::Release);
    }

    fn error_message(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "stream error".to_string())
    }
}

/// 设备回调上下文
struct CallbackContext {
    queue: Arc<RingBuffer<i16>>,
    marks: Arc<RingBuffer<u64>>,
    notifier: DrainNotifier,
    status: Arc<StreamStatus>,
    scratch: Vec<i16>,
}

impl CallbackContext {
    fn new(
        queue: &Arc<RingBuffer<i16>>,
        marks: &Arc<RingBuffer<u64>>,
        notifier: &DrainNotifier,
        status: &Arc<StreamStatus>,
        scratch_samples: usize,
    ) -> Self {
        Self {
            queue: Arc::clone(queue),
            marks: Arc::clone(marks),
            notifier: notifier.clone(),
            status: Arc::clone(status),
            scratch: vec![0; scratch_samples.max(1)],
        }
    }

    #[inline]
    fn render<T: Copy>(&mut self, data: &mut [T], convert: fn(i16) -> T, silence: T) {
        let mut starved = false;
        for chunk in data.chunks_mut(self.scratch.len()) {
            let scratch = &mut self.scratch[..chunk.len()];
            let read = self.queue.read(scratch);

            for (out, &sample) in chunk.iter_mut().zip(scratch[..read].iter()) {
                *out = convert(sample);
            }
            chunk[read..].fill(silence);
            starved |= read < chunk.len();
        }

        if starved && self.marks.peek().is_some() {
            self.status.underruns.fetch_add(1, Ordering::Relaxed);
        }

        let consumed = self.queue.total_read() as u64;
        while let Some(mark) = self.marks.peek() {
            if mark > consumed {
                break;
            }
            self.marks.pop();
            self.notifier.notify();
        }
    }
}

/// 丢弃所有未 drain 的块，每块发出一次 drain 通知
///
/// 只能在没有回调读取 `marks` 时调用
fn flush_pending_marks(marks: &RingBuffer<u64>, notifier: &DrainNotifier) -> usize {
    let mut flushed = 0;
    while marks.pop().is_some() {
        notifier.notify();
        flushed += 1;
    }
    flushed
}

/// producer 侧的写入节奏
#[derive(Clone, Copy, Debug)]
struct Pacing {
    /// 每样本的纳秒数
    ns_per_sample: u64,
    /// 回调没有任何消费时最长等待
    stall_timeout: Duration,
}

impl Pacing {
    fn new(format: &AudioFormat, queue_capacity: usize) -> Self {
        let ns_per_sample =
            1_000_000_000 / (format.sample_rate as u64 * format.channels as u64).max(1);
        let queue_secs = format.frames_to_secs(format.samples_to_frames(queue_capacity));
        Self {
            ns_per_sample,
            stall_timeout: Duration::from_secs_f64(queue_secs * 4.0).max(MIN_STALL_TIMEOUT),
        }
    }

    /// 队列满时的自适应等待
    ///
    /// - < 50µs: 仅自旋
    /// - 50-500µs: yield + 短自旋
    /// - > 500µs: 睡眠 70% 的预计时间
    fn wait_for_space(&self, samples_needed: usize) {
        let wait_us = (samples_needed as u64 * self.ns_per_sample) / 1_000;
        if wait_us < 50 {
            for _ in 0..64 {
                std::hint::spin_loop();
            }
        } else if wait_us < 500 {
            thread::yield_now();
            for _ in 0..32 {
                std::hint::spin_loop();
            }
        } else {
            let sleep_us = (wait_us * 7 / 10).clamp(100, 10_000);
            thread::sleep(Duration::from_micros(sleep_us));
        }
    }
}

/// 把样本全部写入设备队列，队列满时等待回调消费
///
/// 流出错、或回调在 `stall_timeout` 内没有腾出任何空间时返回错误。
/// 已写入的部分留在队列里，由 recover 连同队列一起丢弃。
fn write_samples(
    queue: &RingBuffer<i16>,
    status: &StreamStatus,
    samples: &[i16],
    pacing: &Pacing,
) -> Result<(), DeviceError> {
    let mut remaining = samples;
    let mut last_progress = Instant::now();

    while !remaining.is_empty() {
        if status.failed.load(Ordering::Acquire) {
            return Err(DeviceError::Submit(status.error_message()));
        }

        let written = queue.write(remaining);
        if written > 0 {
            remaining = &remaining[written..];
            last_progress = Instant::now();
            continue;
        }

        if last_progress.elapsed() >= pacing.stall_timeout {
            return Err(DeviceError::Submit(format!(
                "device consumed no samples for {:?}",
                pacing.stall_timeout
            )));
        }
        let needed = remaining.len().min(queue.capacity());
        pacing.wait_for_space(needed.saturating_sub(queue.free_space()));
    }

    Ok(())
}

/// cpal 设备和流，使其可以随 sink 移动到 producer 线程
struct DeviceHandle {
    device: cpal::Device,
    config: cpal::StreamConfig,
    stream_format: StreamFormat,
    /// None 表示流已停止且重建失败
    stream: Option<cpal::Stream>,
}

// SAFETY: 设备和流只被持有它们的 sink 访问，sink 同一时刻只属于一个线程
unsafe impl Send for DeviceHandle {}

impl DeviceHandle {
    /// 按保存的配置建流并启动
    fn start_stream(&mut self, ctx: CallbackContext) -> Result<(), String> {
        let stream = match self.stream_format {
            StreamFormat::I16 => build_stream(&self.device, &self.config, ctx, |s| s, 0i16)?,
            StreamFormat::F32 => build_stream(
                &self.device,
                &self.config,
                ctx,
                |s| s as f32 / 32768.0,
                0.0f32,
            )?,
        };
        stream
            .play()
            .map_err(|e| format!("failed to start stream: {}", e))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
    }
}

pub struct CpalSink {
    format: AudioFormat,
    device_name: String,
    /// None 表示已关闭
    handle: Option<DeviceHandle>,
    queue: Arc<RingBuffer<i16>>,
    marks: Arc<RingBuffer<u64>>,
    status: Arc<StreamStatus>,
    notifier: DrainNotifier,
    callback_samples: usize,
    lock_memory: bool,
    /// 已写入样本累计数（块尾标记的坐标系，随队列一起重置）
    written: u64,
    pacing: Pacing,
}

impl CpalSink {
    /// 打开设备
    ///
    /// `queue_samples` 决定样本队列容量（向上取整到 2 的幂）
    pub fn open(
        config: &OutputConfig,
        format: AudioFormat,
        queue_samples: usize,
        notifier: DrainNotifier,
    ) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = find_device(&host, config.device.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "<unknown>".to_string());

        let stream_format = select_stream_format(&device, &format)?;
        let callback_samples = callback_frames(&device) * format.samples_per_frame();
        let mut handle = DeviceHandle {
            device,
            config: cpal::StreamConfig {
                channels: format.channels,
                sample_rate: cpal::SampleRate(format.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            stream_format,
            stream: None,
        };

        let queue = Arc::new(RingBuffer::with_min_capacity(queue_samples));
        // 在途块数不超过 queue_samples，标记队列不会满
        let marks = Arc::new(RingBuffer::with_min_capacity(queue_samples.max(2)));
        if config.lock_memory {
            queue.lock_memory();
        }
        let status = Arc::new(StreamStatus::new());

        let ctx = CallbackContext::new(&queue, &marks, &notifier, &status, callback_samples);
        handle.start_stream(ctx).map_err(DeviceError::Open)?;

        log::info!(
            "Output device: {} | {} | stream format: {:?} | queue: {} samples",
            device_name,
            format,
            stream_format,
            queue.capacity()
        );

        Ok(Self {
            format,
            device_name,
            handle: Some(handle),
            pacing: Pacing::new(&format, queue.capacity()),
            queue,
            marks,
            status,
            notifier,
            callback_samples,
            lock_memory: config.lock_memory,
            written: 0,
        })
    }

    /// 回调发现数据不足的次数
    pub fn underrun_count(&self) -> u64 {
        self.status.underruns.load(Ordering::Relaxed)
    }

    /// 丢弃旧流的在途数据，换上空队列
    ///
    /// 旧流必须已经停止
    fn reset_queues(&mut self) {
        let flushed = flush_pending_marks(&self.marks, &self.notifier);
        let dropped = self.queue.available();
        if flushed > 0 || dropped > 0 {
            log::warn!(
                "Dropped {} queued samples ({} blocks) from the failed stream",
                dropped,
                flushed
            );
        }

        self.queue = Arc::new(RingBuffer::new(self.queue.capacity()));
        self.marks = Arc::new(RingBuffer::new(self.marks.capacity()));
        if self.lock_memory {
            self.queue.lock_memory();
        }
        self.written = 0;
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut ctx: CallbackContext,
    convert: fn(i16) -> T,
    silence: T,
) -> Result<cpal::Stream, String>
where
    T: cpal::SizedSample + Send + 'static,
{
    let status = Arc::clone(&ctx.status);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                ctx.render(data, convert, silence);
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
                status.fail(err.to_string());
            },
            None,
        )
        .map_err(|e| format!("failed to build stream: {}", e))
}

impl AudioSink for CpalSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn submit(&mut self, block: BlockSpan<'_>) -> Result<(), DeviceError> {
        match self.handle {
            None => return Err(DeviceError::Closed),
            Some(DeviceHandle { stream: None, .. }) => {
                return Err(DeviceError::Submit("output stream is not running".to_string()))
            }
            Some(_) => {}
        }

        write_samples(&self.queue, &self.status, block.samples, &self.pacing)?;

        self.written += block.samples.len() as u64;
        if !self.marks.push(self.written) {
            return Err(DeviceError::Submit("drain mark queue overflow".to_string()));
        }

        log::trace!("Submitted block {} ({} frames)", block.index, block.frames);
        Ok(())
    }

    fn delay_frames(&mut self) -> usize {
        self.format.samples_to_frames(self.queue.available())
    }

    /// 重建输出流
    fn recover(&mut self) -> Result<(), DeviceError> {
        let Some(mut handle) = self.handle.take() else {
            return Err(DeviceError::Closed);
        };

        log::warn!(
            "Rebuilding output stream on {} after: {}",
            self.device_name,
            self.status.error_message()
        );

        // 旧回调停止后才能安全地清空它读取的队列
        handle.stop_stream();
        self.reset_queues();
        self.status.reset();

        let ctx = CallbackContext::new(
            &self.queue,
            &self.marks,
            &self.notifier,
            &self.status,
            self.callback_samples,
        );
        let result = handle.start_stream(ctx);
        self.handle = Some(handle);

        match result {
            Ok(()) => {
                log::info!("Output stream rebuilt on {}", self.device_name);
                Ok(())
            }
            Err(e) => Err(DeviceError::Recover(e)),
        }
    }

    fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop_stream();
            log::info!(
                "Output device closed: {} (underruns: {})",
                self.device_name,
                self.underrun_count()
            );
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_notifier() -> (DrainNotifier, Arc<AtomicUsize>) {
        let drained = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drained);
        let notifier = DrainNotifier::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (notifier, drained)
    }

    fn context(queue: usize, scratch: usize) -> (CallbackContext, Arc<AtomicUsize>) {
        let (notifier, drained) = counting_notifier();
        let ctx = CallbackContext::new(
            &Arc::new(RingBuffer::new(queue)),
            &Arc::new(RingBuffer::new(8)),
            &notifier,
            &Arc::new(StreamStatus::new()),
            scratch,
        );
        (ctx, drained)
    }

    fn pacing(stall_ms: u64) -> Pacing {
        Pacing {
            ns_per_sample: 22_675,
            stall_timeout: Duration::from_millis(stall_ms),
        }
    }

    #[test]
    fn test_render_signals_drain_per_block() {
        let (mut ctx, drained) = context(64, 64);
        ctx.queue.write(&[1, 2, 3, 4]);
        ctx.marks.push(4);
        ctx.queue.write(&[5, 6, 7, 8]);
        ctx.marks.push(8);

        let mut out = [0i16; 6];
        ctx.render(&mut out, |s| s, 0);
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        ctx.render(&mut out, |s| s, 0);
        assert_eq!(out, [7, 8, 0, 0, 0, 0]);
        assert_eq!(drained.load(Ordering::SeqCst), 2);
        assert!(ctx.marks.peek().is_none());
    }

    #[test]
    fn test_render_longer_than_scratch_does_not_grow() {
        let (mut ctx, drained) = context(64, 4);
        ctx.queue.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        ctx.marks.push(10);

        let mut out = [0i16; 12];
        ctx.render(&mut out, |s| s, 0);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 0, 0]);
        assert_eq!(ctx.scratch.len(), 4);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_render_converts_to_float() {
        let (mut ctx, _) = context(16, 16);
        ctx.queue.write(&[16384, -32768]);

        let mut out = [1.0f32; 3];
        ctx.render(&mut out, |s| s as f32 / 32768.0, 0.0);
        assert_eq!(out, [0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_underrun_counted_only_with_pending_block() {
        let (mut ctx, _) = context(16, 16);
        let mut out = [0i16; 4];
        ctx.render(&mut out, |s| s, 0);
        assert_eq!(ctx.status.underruns.load(Ordering::Relaxed), 0);

        ctx.queue.write(&[1, 2]);
        ctx.marks.push(6);
        ctx.render(&mut out, |s| s, 0);
        assert_eq!(ctx.status.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_flush_returns_every_pending_block() {
        let (notifier, drained) = counting_notifier();
        let marks = RingBuffer::<u64>::new(8);
        marks.push(512);
        marks.push(1024);
        marks.push(1536);

        assert_eq!(flush_pending_marks(&marks, &notifier), 3);
        assert_eq!(drained.load(Ordering::SeqCst), 3);
        assert!(marks.peek().is_none());
        assert_eq!(flush_pending_marks(&marks, &notifier), 0);
    }

    #[test]
    fn test_write_gives_up_when_device_stalls() {
        let queue = RingBuffer::<i16>::new(4);
        let status = StreamStatus::new();
        queue.write(&[0; 4]);

        let started = Instant::now();
        let result = write_samples(&queue, &status, &[1, 2], &pacing(30));
        assert!(matches!(result, Err(DeviceError::Submit(_))));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_write_stops_on_stream_error() {
        let queue = RingBuffer::<i16>::new(4);
        let status = StreamStatus::new();
        queue.write(&[0; 4]);
        status.fail("device unplugged".to_string());

        assert_eq!(
            write_samples(&queue, &status, &[1, 2], &pacing(10_000)),
            Err(DeviceError::Submit("device unplugged".to_string()))
        );

        status.reset();
        assert!(!status.failed.load(Ordering::Acquire));
        assert_eq!(status.error_message(), "stream error");
    }

    #[test]
    fn test_write_waits_for_consumer() {
        let queue = Arc::new(RingBuffer::<i16>::new(4));
        let status = StreamStatus::new();
        queue.write(&[0; 4]);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut out = [0i16; 4];
                let mut total = 0;
                while total < 8 {
                    total += queue.read(&mut out);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let samples: Vec<i16> = (1..=4).collect();
        assert!(write_samples(&queue, &status, &samples, &pacing(5_000)).is_ok());
        consumer.join().unwrap();
        assert_eq!(queue.total_read(), 8);
    }

    #[test]
    fn test_stall_timeout_floor() {
        let format = AudioFormat::new(44100, 1, 16);
        assert_eq!(Pacing::new(&format, 512).stall_timeout, MIN_STALL_TIMEOUT);

        let long = Pacing::new(&format, 44100);
        assert!((long.stall_timeout.as_secs_f64() - 4.0).abs() < 1e-6);
    }

    #[test]
    #[ignore] // 需要音频设备
    fn test_list_output_devices() {
        let devices = list_output_devices().unwrap();
        assert!(!devices.is_empty());
    }
}

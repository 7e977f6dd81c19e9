//! Producer 线程
//!
//! 稳态循环：
//! 1. 没有空闲块时挂起（唯一的挂起点）
//! 2. 递减空闲计数，认领下一个块
//! 3. 逐帧求值样本源、削波量化、写入，推进全局时间
//! 4. 把块（前缀）提交给 sink，sink 可以因背压阻塞
//! 5. 查询设备延迟，决定下一次写入帧数
//! 6. 停止请求只在循环顶部观察，不会提交半个块

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::free_blocks::FreeBlocks;
use super::{BlockBuffer, EngineConfig, EngineError, EngineShared, EngineState, SampleSource};
use crate::audio::{Quantizer, SAMPLE_BITS};
use crate::sink::{AudioSink, BlockSpan};

pub(crate) struct Producer<S: SampleSource> {
    source: S,
    sink: Box<dyn AudioSink>,
    blocks: BlockBuffer,
    free_blocks: Arc<FreeBlocks>,
    shared: Arc<EngineShared>,
    quantizer: Quantizer,
    sample_rate: f64,
    channels: usize,
    frames_per_block: usize,
    /// 已产生的帧数，全局时间 = frames_produced / sample_rate
    frames_produced: u64,
    /// 下一次提交的帧数
    write_frames: usize,
}

impl<S: SampleSource> Producer<S> {
    /// `config` 必须已通过 `validate`
    pub(crate) fn new(
        config: &EngineConfig,
        source: S,
        sink: Box<dyn AudioSink>,
        blocks: BlockBuffer,
        free_blocks: Arc<FreeBlocks>,
        shared: Arc<EngineShared>,
    ) -> Self {
        let frames_per_block = config.frames_per_block();
        Self {
            source,
            quantizer: Quantizer::new(SAMPLE_BITS),
            sample_rate: config.sample_rate as f64,
            channels: config.channels as usize,
            frames_per_block,
            frames_produced: 0,
            write_frames: frames_per_block,
            sink,
            blocks,
            free_blocks,
            shared,
        }
    }

    /// 线程主函数
    pub(crate) fn run(mut self) {
        log::info!(
            "Producer thread started: {} blocks × {} frames",
            self.blocks.block_count(),
            self.frames_per_block
        );

        while self.shared.running.load(Ordering::Acquire) {
            if !self.free_blocks.wait_until_non_zero() {
                break;
            }
            // 等待期间可能收到了停止请求
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }

            if let Err(e) = self.step() {
                log::error!("Producer stopping: {}", e);
                self.shared.record_failure(e);
                self.shared.running.store(false, Ordering::Release);
                break;
            }
        }

        self.shared.set_state(EngineState::Stopping);
        self.sink.close();
        self.shared.set_state(EngineState::Stopped);

        log::info!(
            "Producer thread finished at {:.3}s ({} frames)",
            self.frames_produced as f64 / self.sample_rate,
            self.frames_produced
        );
    }

    /// 一次完整的 认领 → 填充 → 提交 → 调速
    fn step(&mut self) -> Result<(), EngineError> {
        self.free_blocks.decrement_on_claim()?;
        let index = self.blocks.claim();
        self.fill(index);

        let frames = self.write_frames.min(self.frames_per_block);
        let samples = &self.blocks.block(index)[..frames * self.channels];
        let span = BlockSpan {
            index,
            frames,
            samples,
        };

        match self.sink.submit(span) {
            Ok(()) => {
                self.shared.stats.record_submit(frames);
                log::trace!("Block {} submitted ({} frames)", index, frames);
            }
            Err(submit_err) => {
                log::warn!("Failed to write block {}: {}", index, submit_err);
                self.shared.stats.record_submit_failure();
                // 块没有到达设备，不会有 drain 通知
                self.free_blocks.release();

                self.shared.stats.record_recovery();
                match self.sink.recover() {
                    Ok(()) => log::info!("Output device recovered"),
                    Err(recover_err) => {
                        log::error!("Output device recovery failed: {}", recover_err);
                        return Err(submit_err.into());
                    }
                }
            }
        }

        let delay = self.sink.delay_frames();
        self.shared.stats.record_delay(delay);
        self.write_frames = if delay > 0 {
            delay.min(self.frames_per_block)
        } else {
            self.frames_per_block
        };

        Ok(())
    }

    /// 逐帧填充：每帧求值一次，写入该帧所有声道
    fn fill(&mut self, index: usize) {
        let block = self.blocks.block_mut(index);
        for frame in block.chunks_exact_mut(self.channels) {
            let time = self.frames_produced as f64 / self.sample_rate;
            let value = self.quantizer.quantize_i16(self.source.sample(time));
            frame.fill(value);
            self.frames_produced += 1;
        }
        self.shared
            .global_time
            .store(self.frames_produced as f64 / self.sample_rate);
    }
}

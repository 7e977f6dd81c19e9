//! 音频格式
//!
//! 引擎只输出一种格式：有符号整数交织 PCM（默认 16-bit little-endian）

/// 引擎固定使用的样本位宽
pub const SAMPLE_BITS: u16 = 16;

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 创建新的音频格式
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 样本数 → 帧数（不足一帧的尾部舍去）
    #[inline]
    pub fn samples_to_frames(&self, samples: usize) -> usize {
        samples / self.samples_per_frame().max(1)
    }

    /// 帧数对应的播放时长（秒）
    #[inline]
    pub fn frames_to_secs(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

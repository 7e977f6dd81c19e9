//! 削波与量化
//!
//! 浮点振幅 → 有符号整数样本：
//! 1. 对称削波到 [-1, 1]（饱和，不回绕）
//! 2. 乘以 2^(bits-1) - 1
//! 3. 向零截断

/// 对称削波
///
/// 正值封顶 +max，负值封底 -max。NaN 视为静音。
#[inline]
pub fn clip(sample: f64, max: f64) -> f64 {
    if sample.is_nan() {
        0.0
    } else if sample >= 0.0 {
        sample.min(max)
    } else {
        sample.max(-max)
    }
}

/// 量化器
///
/// 缩放系数只在创建时根据位宽计算一次，是精确的整数值，
/// 每个样本复用同一个系数。
#[derive(Clone, Copy, Debug)]
pub struct Quantizer {
    bits: u16,
    max_sample: i32,
    scale: f64,
}

impl Quantizer {
    /// `bits` 取值 2..=32
    pub fn new(bits: u16) -> Self {
        assert!((2..=32).contains(&bits), "unsupported sample width: {}", bits);
        let max_sample = ((1i64 << (bits - 1)) - 1) as i32;
        Self {
            bits,
            max_sample,
            scale: max_sample as f64,
        }
    }

    /// 可表示的最大幅度
    #[inline]
    pub fn max_sample(&self) -> i32 {
        self.max_sample
    }

    /// 削波 + 缩放 + 截断
    #[inline]
    pub fn quantize(&self, amplitude: f64) -> i32 {
        (clip(amplitude, 1.0) * self.scale) as i32
    }

    /// 16-bit 快捷路径
    #[inline]
    pub fn quantize_i16(&self, amplitude: f64) -> i16 {
        debug_assert!(self.bits <= 16);
        self.quantize(amplitude) as i16
    }
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new(super::format::SAMPLE_BITS)
    }
}

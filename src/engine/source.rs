//! 样本源
//!
//! 样本源是全局时间的函数，返回 [-1, 1] 的振幅（越界由量化器削波）。
//! 引擎保证按时间严格递增、无间隙无重复地每帧调用一次。

use std::f64::consts::PI;
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 样本源
pub trait SampleSource: Send + 'static {
    fn sample(&mut self, time: f64) -> f64;
}

impl<F> SampleSource for F
where
    F: FnMut(f64) -> f64 + Send + 'static,
{
    #[inline]
    fn sample(&mut self, time: f64) -> f64 {
        self(time)
    }
}

/// 跨线程共享的参数
///
/// 输入线程写、producer 线程读，lock-free
#[derive(Clone, Debug)]
pub struct SharedParam(Arc<AtomicCell<f64>>);

impl SharedParam {
    pub fn new(value: f64) -> Self {
        Self(Arc::new(AtomicCell::new(value)))
    }

    #[inline]
    pub fn get(&self) -> f64 {
        self.0.load()
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.0.store(value);
    }
}

/// 波形
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Triangle,
    Saw,
    Noise,
}

impl Waveform {
    /// 角频率 × 时间处的波形值，噪声除外（由调用方提供随机源）
    #[inline]
    fn eval(self, frequency: f64, time: f64, rng: &mut StdRng) -> f64 {
        let phase = 2.0 * PI * frequency * time;
        match self {
            Self::Sine => phase.sin(),
            Self::Square => {
                if phase.sin() > 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
            Self::Triangle => phase.sin().asin() * (2.0 / PI),
            Self::Saw => {
                let cycles = frequency * time;
                2.0 * (cycles - (cycles + 0.5).floor())
            }
            Self::Noise => rng.gen_range(-1.0..1.0),
        }
    }
}

impl std::fmt::Display for Waveform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sine => "sine",
            Self::Square => "square",
            Self::Triangle => "triangle",
            Self::Saw => "saw",
            Self::Noise => "noise",
        };
        f.write_str(name)
    }
}

/// 振荡器
///
/// 频率为 0 时输出静音。频率和振幅可以在播放中从其他线程修改。
pub struct Oscillator {
    waveform: Waveform,
    frequency: SharedParam,
    amplitude: SharedParam,
    rng: StdRng,
}

impl Oscillator {
    pub fn new(waveform: Waveform, frequency: SharedParam, amplitude: SharedParam) -> Self {
        Self {
            waveform,
            frequency,
            amplitude,
            rng: StdRng::from_entropy(),
        }
    }

    /// 固定参数的振荡器
    pub fn fixed(waveform: Waveform, frequency: f64, amplitude: f64) -> Self {
        Self::new(
            waveform,
            SharedParam::new(frequency),
            SharedParam::new(amplitude),
        )
    }

    pub fn frequency(&self) -> &SharedParam {
        &self.frequency
    }

    pub fn amplitude(&self) -> &SharedParam {
        &self.amplitude
    }
}

impl SampleSource for Oscillator {
    #[inline]
    fn sample(&mut self, time: f64) -> f64 {
        let frequency = self.frequency.get();
        if frequency <= 0.0 {
            return 0.0;
        }
        self.amplitude.get() * self.waveform.eval(frequency, time, &mut self.rng)
    }
}

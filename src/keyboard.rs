//! 键盘合成器映射
//!
//! 两排按键对应 16 个半音（与钢琴键盘的黑白键位置一致），
//! 以 110 Hz（A2）为基准。

/// 基准频率（Hz）
pub const BASE_FREQUENCY: f64 = 110.0;

/// 按半音顺序排列的按键
pub const KEYS: [char; 16] = [
    'z', 's', 'x', 'c', 'f', 'v', 'g', 'b', 'n', 'j', 'm', 'k', ',', 'l', '.', '/',
];

/// 按键对应的半音（相对基准）
pub fn semitone_for_key(key: char) -> Option<u32> {
    let key = key.to_ascii_lowercase();
    KEYS.iter().position(|&k| k == key).map(|n| n as u32)
}

/// 半音对应的频率：`base × 2^(n/12)`
#[inline]
pub fn frequency_for_semitone(semitone: u32) -> f64 {
    BASE_FREQUENCY * 2f64.powf(semitone as f64 / 12.0)
}

pub fn frequency_for_key(key: char) -> Option<f64> {
    semitone_for_key(key).map(frequency_for_semitone)
}

/// 键盘布局示意图
pub fn layout() -> &'static str {
    concat!(
        "|   |   |   |   |   | |   |   |   | |   | |   |   |   |\n",
        "|   | S |   |   | F | | G |   |   | J | | K | | L |   |\n",
        "|   |___|   |   |___| |___|   |   |___| |___| |___|   |__\n",
        "|     |     |     |     |     |     |     |     |     |\n",
        "|  Z  |  X  |  C  |  V  |  B  |  N  |  M  |  ,  |  .  |  /  |\n",
        "|_____|_____|_____|_____|_____|_____|_____|_____|_____|_____|\n",
    )
}

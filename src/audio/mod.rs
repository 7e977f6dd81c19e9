//! 音频核心模块
//!
//! 包含：
//! - Format: 输出格式描述
//! - Clip: 削波与整数量化
//! - Ring Buffer: 设备队列使用的 lock-free SPSC 缓冲
//! - Stats: 引擎运行统计

pub mod clip;
pub mod format;
pub mod ring_buffer;
pub mod stats;

pub use clip::{clip, Quantizer};
pub use format::{AudioFormat, SAMPLE_BITS};
pub use ring_buffer::RingBuffer;
pub use stats::{EngineStats, StatsReport};

/// mlock 一段内存，失败只记录警告
#[cfg(unix)]
pub(crate) fn lock_region(ptr: *const libc::c_void, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    let result = unsafe { libc::mlock(ptr, len) };
    if result == 0 {
        true
    } else {
        log::warn!(
            "Failed to lock {} bytes of audio memory: {}",
            len,
            std::io::Error::last_os_error()
        );
        false
    }
}

#[cfg(unix)]
pub(crate) fn unlock_region(ptr: *const libc::c_void, len: usize) {
    if len > 0 {
        unsafe {
            libc::munlock(ptr, len);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn lock_region(_ptr: *const libc::c_void, _len: usize) -> bool {
    log::warn!("Memory locking is not supported on this platform");
    false
}

#[cfg(not(unix))]
pub(crate) fn unlock_region(_ptr: *const libc::c_void, _len: usize) {}

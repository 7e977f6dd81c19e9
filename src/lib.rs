//! Tone Engine Library
//!
//! Block-buffered real-time tone streaming engine.

pub mod audio;
pub mod engine;
pub mod keyboard;
pub mod sink;

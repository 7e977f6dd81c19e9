//! Tone Engine - 块缓冲实时音调合成器
//!
//! 设计目标：
//! - 时序稳定：producer 线程只在没有空闲块时挂起
//! - 延迟可控：在途样本数不超过 块数 × 块长度
//! - 自适应写入：按设备上报的延迟调整每次提交的帧数

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use tone_engine::engine::{Engine, EngineConfig, Oscillator, SharedParam, Waveform};
use tone_engine::keyboard;
use tone_engine::sink::{list_output_devices, OutputConfig, SinkBackend};

/// Tone Engine - Block-buffered real-time tone synthesizer
#[derive(Parser)]
#[command(name = "tone-engine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Sample rate in Hz
    #[arg(long, default_value = "44100", global = true)]
    sample_rate: u32,

    /// Number of output channels
    #[arg(long, default_value = "1", global = true)]
    channels: u16,

    /// Number of blocks in the ring
    #[arg(long, default_value = "8", global = true)]
    blocks: usize,

    /// Samples per block (interleaved)
    #[arg(long, default_value = "512", global = true)]
    block_samples: usize,

    /// Output backend
    #[arg(long, value_enum, default_value = "cpal", global = true)]
    backend: BackendArg,

    /// Select output device by name (use 'info' command to list devices)
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Lock audio buffers in memory (mlock)
    #[arg(long, global = true)]
    lock_memory: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show audio device information
    Info,

    /// Play a single tone
    Play {
        /// Frequency in Hz
        #[arg(short, long, default_value = "440")]
        frequency: f64,

        /// Amplitude (0.0 - 1.0)
        #[arg(short, long, default_value = "0.3")]
        amplitude: f64,

        /// Waveform shape
        #[arg(short, long, value_enum, default_value = "sine")]
        waveform: WaveformArg,

        /// Duration in seconds (Ctrl+C stops early)
        #[arg(long, default_value = "5")]
        duration: f64,
    },

    /// Interactive keyboard synthesizer
    Keys {
        /// Amplitude (0.0 - 1.0)
        #[arg(short, long, default_value = "0.3")]
        amplitude: f64,

        /// Waveform shape
        #[arg(short, long, value_enum, default_value = "sine")]
        waveform: WaveformArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Cpal,
    Null,
}

impl From<BackendArg> for SinkBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Cpal => SinkBackend::Cpal,
            BackendArg::Null => SinkBackend::Null,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum WaveformArg {
    Sine,
    Square,
    Triangle,
    Saw,
    Noise,
}

impl From<WaveformArg> for Waveform {
    fn from(arg: WaveformArg) -> Self {
        match arg {
            WaveformArg::Sine => Waveform::Sine,
            WaveformArg::Square => Waveform::Square,
            WaveformArg::Triangle => Waveform::Triangle,
            WaveformArg::Saw => Waveform::Saw,
            WaveformArg::Noise => Waveform::Noise,
        }
    }
}

/// 终端原始模式 RAII 守卫
struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Some(Commands::Info) => {
            show_device_info()?;
        }
        Some(Commands::Play {
            frequency,
            amplitude,
            waveform,
            duration,
        }) => {
            play_tone(&cli, frequency, amplitude, waveform.into(), duration)?;
        }
        Some(Commands::Keys {
            amplitude,
            waveform,
        }) => {
            play_keys(&cli, amplitude, waveform.into())?;
        }
        None => {
            play_tone(&cli, 440.0, 0.3, Waveform::Sine, 5.0)?;
        }
    }

    Ok(())
}

/// 显示设备信息
fn show_device_info() -> anyhow::Result<()> {
    println!("=== Audio Output Devices ===\n");

    let devices = list_output_devices()?;
    if devices.is_empty() {
        println!("No output devices found.");
        return Ok(());
    }

    for (i, device) in devices.iter().enumerate() {
        let default_mark = if device.is_default { " *" } else { "" };
        let config = device.default_config.as_deref().unwrap_or("unknown config");
        println!("[{:>3}] {} ({}){}", i, device.name, config, default_mark);
    }

    println!();
    println!("* = system default\n");
    println!("Select device: tone-engine -d <NAME> play");

    Ok(())
}

/// 创建引擎配置
fn create_engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        sample_rate: cli.sample_rate,
        channels: cli.channels,
        block_count: cli.blocks,
        block_samples: cli.block_samples,
        output: OutputConfig {
            backend: cli.backend.into(),
            device: cli.device.clone(),
            lock_memory: cli.lock_memory,
        },
    }
}

/// 单音播放模式
fn play_tone(
    cli: &Cli,
    frequency: f64,
    amplitude: f64,
    waveform: Waveform,
    duration: f64,
) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = create_engine_config(cli);
    let oscillator = Oscillator::fixed(waveform, frequency, amplitude);
    let mut engine = Engine::start(config, oscillator)?;

    println!(
        "Tone Engine - {} {:.1}Hz @ {:.2} | {}",
        waveform,
        frequency,
        amplitude,
        engine.format()
    );
    println!("Playing. Press Ctrl+C to stop.\n");

    let block_count = engine.config().block_count;
    let started = Instant::now();

    while running.load(Ordering::SeqCst) && engine.is_running() {
        if started.elapsed().as_secs_f64() >= duration {
            break;
        }

        let stats = engine.stats();
        print!(
            "\r  {:7.2}s  |  Free blocks: {}/{}  |  Write size: {:4} frames  ",
            engine.current_time(),
            engine.free_blocks(),
            block_count,
            stats.last_write_frames
        );
        io::stdout().flush()?;

        std::thread::sleep(Duration::from_millis(50));
    }

    println!();
    engine.stop()?;
    report_exit(&engine)
}

/// 键盘合成器模式
fn play_keys(cli: &Cli, amplitude: f64, waveform: Waveform) -> anyhow::Result<()> {
    let frequency = SharedParam::new(0.0);
    let oscillator = Oscillator::new(waveform, frequency.clone(), SharedParam::new(amplitude));

    let config = create_engine_config(cli);
    let mut engine = Engine::start(config, oscillator)?;

    println!("Tone Engine - Keyboard Synthesizer ({})\n", waveform);
    print!("{}", keyboard::layout());
    println!();
    println!("Controls: [keys] play note | [Space] silence | [Esc/q] quit\n");

    {
        let _raw_guard = RawModeGuard::enter()?;
        let tick_rate = Duration::from_millis(50);

        while engine.is_running() {
            if event::poll(tick_rate)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    match key.code {
                        KeyCode::Esc | KeyCode::Char('q') => break,
                        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                            break
                        }
                        KeyCode::Char(' ') => frequency.set(0.0),
                        KeyCode::Char(ch) => {
                            if let Some(f) = keyboard::frequency_for_key(ch) {
                                frequency.set(f);
                            }
                        }
                        _ => {}
                    }
                }
            }

            let note = frequency.get();
            if note > 0.0 {
                print!("\r  {:7.2}s  |  Note: {:7.2}Hz  ", engine.current_time(), note);
            } else {
                print!("\r  {:7.2}s  |  Note:      --    ", engine.current_time());
            }
            io::stdout().flush()?;
        }
    }

    println!();
    engine.stop()?;
    report_exit(&engine)
}

/// 退出时输出引擎错误和统计
fn report_exit(engine: &Engine) -> anyhow::Result<()> {
    if let Err(e) = engine.check() {
        eprintln!("Engine stopped with error: {}", e);
    }
    println!("\n{}", engine.stats());
    engine.check()?;
    Ok(())
}

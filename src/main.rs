//! # wlsink - Wayland video sink test player
//!
//! Connects to a compositor (or the built-in headless one), prints what it
//! can display, and plays a generated test pattern through the sink.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wlsink::display::Display;
use wlsink::protocol::headless::HeadlessBackend;
use wlsink::{
    DropReason, FillMode, Memory, MemoryDomain, RenderOutcome, SinkConfig, SinkError, SinkHost, VideoFormat,
    VideoFrame, VideoInfo, VideoSink,
};

#[derive(Parser)]
#[command(name = "wlsink")]
#[command(about = "Plays a test pattern through the Wayland video sink")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/wlsink/wlsink.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Wayland display name or socket path
    #[arg(long)]
    display: Option<String>,

    /// Use the in-process headless compositor instead of a real one
    #[arg(long)]
    headless: bool,

    /// Print capabilities and supported formats, then exit
    #[arg(long)]
    probe: bool,

    /// Number of frames to offer
    #[arg(short, long, default_value_t = 300)]
    frames: u32,

    /// Frame format
    #[arg(long, default_value = "BGRx")]
    format: VideoFormat,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Override the fill mode: stretch, fit or crop
    #[arg(long)]
    fill_mode: Option<FillMode>,

    #[arg(long)]
    fullscreen: bool,

    /// Block each frame until the compositor presented it
    #[arg(long)]
    sync_frame: bool,
}

/// Supplies the headless display and stops playback on fatal errors
struct PlayerHost {
    display: Option<Arc<Display>>,
    running: Arc<AtomicBool>,
}

impl SinkHost for PlayerHost {
    fn need_display(&self) -> Option<Arc<Display>> {
        self.display.clone()
    }

    fn on_fatal_error(&self, error: &SinkError) {
        error!("❌ Sink failed: {}", error);
        self.running.store(false, Ordering::SeqCst);
    }
}

fn load_config(cli: &Cli) -> SinkConfig {
    let mut config = match SinkConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            warn!("⚠️ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            SinkConfig::default()
        }
    };
    config.apply_env();

    // Override config with CLI flags
    if cli.display.is_some() {
        config.display.name = cli.display.clone();
    }
    if let Some(mode) = cli.fill_mode {
        config.window.fill_mode = mode;
    }
    config.window.fullscreen |= cli.fullscreen;
    config.display.sync_frame |= cli.sync_frame;
    config
}

fn probe(sink: &VideoSink) -> Result<()> {
    let display = sink.display().context("sink has no display after start")?;
    let caps = display.capabilities();
    println!("Capabilities:");
    println!("  shm:              {}", caps.shm);
    println!("  dmabuf:           {}", caps.dmabuf);
    println!("  viewport scaling: {}", caps.viewport_scaling);
    println!("  xdg shell:        {}", caps.xdg_shell);
    println!("  fullscreen shell: {}", caps.fullscreen_shell);
    println!("  pointer move:     {}", caps.pointer_move);
    println!("  afbc:             {}", caps.afbc);
    println!("  nv15:             {}", caps.nv15);

    for domain in [MemoryDomain::Shm, MemoryDomain::Dmabuf] {
        let formats: Vec<String> = sink
            .supported_formats(domain)?
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("Formats via {}: {}", domain, formats.join(" "));
    }

    let afbc: Vec<String> = sink
        .supported_caps()?
        .iter()
        .filter(|caps| caps.afbc)
        .map(|caps| caps.format.to_string())
        .collect();
    if !afbc.is_empty() {
        println!("AFBC formats: {}", afbc.join(" "));
    }
    Ok(())
}

/// Moving diagonal gradient in plane 0, neutral chroma elsewhere
fn test_pattern(info: &VideoInfo, frame: u32) -> Vec<u8> {
    let mut data = vec![0x80u8; info.size];
    let stride = info.stride[0] as usize;
    let plane_end = if info.n_planes() > 1 { info.offset[1] } else { info.size };
    for (y, row) in data[info.offset[0]..plane_end].chunks_mut(stride.max(1)).enumerate() {
        for (x, byte) in row.iter_mut().enumerate() {
            *byte = (x + y + frame as usize * 4) as u8;
        }
    }
    data
}

fn play(sink: &VideoSink, info: &VideoInfo, frames: u32, running: &AtomicBool) -> Result<()> {
    let frame_interval = Duration::from_millis(16);
    let started = Instant::now();
    let mut rendered = 0u32;

    for n in 0..frames {
        if !running.load(Ordering::SeqCst) {
            info!("🛑 Stopping after {} frames", n);
            break;
        }
        let tick = Instant::now();
        let frame = VideoFrame::new(Memory::from_vec(test_pattern(info, n)));
        match sink.render(&frame) {
            Ok(RenderOutcome::Rendered(_)) => rendered += 1,
            Ok(RenderOutcome::Dropped(_)) => {}
            Err(e) if e.is_fatal() => return Err(e).context("rendering stopped"),
            Err(e) => warn!("⚠️ Frame {} failed: {}", n, e),
        }
        if let Some(rest) = frame_interval.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    let stats = sink.stats();
    info!(
        "📊 {} frames in {:.2?}: {} rendered, {} presented, {:.1}% dropped",
        frames,
        started.elapsed(),
        rendered,
        stats.completed,
        stats.drop_rate()
    );
    for reason in DropReason::ALL {
        if stats.dropped(reason) > 0 {
            info!("   dropped ({:?}): {}", reason, stats.dropped(reason));
        }
    }
    if stats.completed > 0 {
        info!(
            "   callback latency avg {:.2?} min {:.2?} max {:.2?}",
            stats.avg_latency, stats.min_latency, stats.max_latency
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting wlsink {}", wlsink::VERSION);

    let config = load_config(&cli);
    config.validate().context("invalid configuration")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let display = if cli.headless {
        info!("🖥️ Headless mode enabled - frames go to the built-in compositor");
        let backend = Arc::new(HeadlessBackend::new().auto_frame_done(true));
        Some(Arc::new(Display::with_backend(backend, true)?))
    } else {
        None
    };
    let host = Arc::new(PlayerHost {
        display,
        running: running.clone(),
    });

    let sink = VideoSink::new(&config, host);
    sink.start().context("failed to connect to the compositor")?;

    if cli.probe {
        probe(&sink)?;
        sink.stop();
        return Ok(());
    }

    let info = VideoInfo::new(cli.format, cli.width, cli.height);
    sink.set_caps(info.clone())
        .with_context(|| format!("cannot play {} {}x{}", info.format, info.width, info.height))?;

    let result = play(&sink, &info, cli.frames, &running);
    sink.stop();
    info!("👋 wlsink shutting down");
    result
}

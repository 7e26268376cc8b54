use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "karava", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mux a rendered foreground frame sequence with a background and audio
    /// into an MP4 (requires `ffmpeg` on PATH).
    Composite(CompositeArgs),
    /// Print a media file's container duration in seconds (requires
    /// `ffprobe` on PATH).
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct CompositeArgs {
    /// Directory of foreground frames. Names are normalized in place to
    /// frame-%05d form before muxing.
    #[arg(long)]
    frames: PathBuf,

    #[arg(long)]
    fps: u32,

    #[arg(long)]
    width: u32,

    #[arg(long)]
    height: u32,

    /// Audio track to mux (omit for a silent output).
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Background image. Mutually exclusive with --bg-video.
    #[arg(long, conflicts_with = "bg_video")]
    bg_image: Option<PathBuf>,

    /// Background video.
    #[arg(long)]
    bg_video: Option<PathBuf>,

    /// Background brightness factor: 1 = fully visible, 0 = black.
    #[arg(long, default_value_t = 1.0)]
    dim: f64,

    /// Background blur radius in pixels.
    #[arg(long, default_value_t = 0.0)]
    blur: f64,

    /// In-point into the background video, seconds.
    #[arg(long, default_value_t = 0.0)]
    start_offset: f64,

    /// Loop the background video instead of freezing its last frame.
    #[arg(long = "loop")]
    loop_background: bool,

    /// Quality factor, lower = higher quality.
    #[arg(long, default_value_t = 23)]
    crf: u32,

    /// Output MP4 path.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Input media path.
    #[arg(long = "in")]
    in_path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Composite(args) => cmd_composite(args),
        Command::Probe(args) => cmd_probe(args),
    }
}

fn cmd_composite(args: CompositeArgs) -> anyhow::Result<()> {
    use karava::{BackgroundInput, CompositeSpec, Compositor as _, FfmpegCompositor};

    anyhow::ensure!(
        (0.0..=1.0).contains(&args.dim),
        "--dim must be within [0, 1]"
    );
    let overlay_opacity = 1.0 - args.dim;

    let frames = karava::normalize_frame_sequence(&args.frames)
        .with_context(|| format!("normalize frames in '{}'", args.frames.display()))?;

    let background = if let Some(path) = args.bg_image {
        BackgroundInput::Image {
            path,
            overlay_opacity,
            blur_sigma: args.blur,
        }
    } else if let Some(path) = args.bg_video {
        BackgroundInput::Video {
            path,
            start_offset_secs: args.start_offset,
            loop_playback: args.loop_background,
            overlay_opacity,
            blur_sigma: args.blur,
        }
    } else {
        BackgroundInput::None
    };

    let duration_secs = frames.frame_count as f64 / f64::from(args.fps);
    let spec = CompositeSpec {
        frames,
        fps: args.fps,
        width: args.width,
        height: args.height,
        duration_secs,
        audio: args.audio,
        background,
        crf: args.crf,
        out_path: args.out.clone(),
    };

    let compositor = FfmpegCompositor::with_detected_encoder();
    let cancel = karava::CancelToken::new();
    let on_progress = |fraction: f64| {
        eprint!("\rcompositing {:3.0}%", fraction * 100.0);
    };
    compositor.composite(&spec, &on_progress, &cancel)?;
    eprintln!("\rwrote {}", args.out.display());
    Ok(())
}

fn cmd_probe(args: ProbeArgs) -> anyhow::Result<()> {
    let secs = karava::probe_duration_secs(&args.in_path)
        .with_context(|| format!("probe '{}'", args.in_path.display()))?;
    println!("{secs:.3}");
    Ok(())
}

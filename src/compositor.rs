use std::{
    collections::VecDeque,
    io::BufRead as _,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::Context as _;

use crate::{
    error::{KaravaError, KaravaResult},
    job::CancelToken,
    sequence::FrameSequence,
};

/// Background source for a composite, with dim already mapped to the
/// opacity of the darkening layer (`1 - backgroundDim`).
#[derive(Clone, Debug)]
pub enum BackgroundInput {
    /// No background media: a synthetic solid-black layer is generated in
    /// the filter graph.
    None,
    Image {
        path: PathBuf,
        overlay_opacity: f64,
        blur_sigma: f64,
    },
    Video {
        path: PathBuf,
        /// In-point seek, applied before any looping so each cycle resumes
        /// from the same offset.
        start_offset_secs: f64,
        loop_playback: bool,
        overlay_opacity: f64,
        blur_sigma: f64,
    },
}

impl BackgroundInput {
    fn overlay_opacity(&self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Image {
                overlay_opacity, ..
            }
            | Self::Video {
                overlay_opacity, ..
            } => *overlay_opacity,
        }
    }
}

/// Everything the compositor needs to mux a foreground frame sequence with
/// a processed background and an audio track into one video file.
#[derive(Clone, Debug)]
pub struct CompositeSpec {
    pub frames: FrameSequence,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Exact output duration: frames actually rendered divided by fps.
    pub duration_secs: f64,
    pub audio: Option<PathBuf>,
    pub background: BackgroundInput,
    pub crf: u32,
    pub out_path: PathBuf,
}

impl CompositeSpec {
    pub fn validate(&self) -> KaravaResult<()> {
        if self.fps == 0 {
            return Err(KaravaError::validation("composite fps must be > 0"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(KaravaError::validation(
                "composite width/height must be non-zero",
            ));
        }
        if !self.width.is_multiple_of(2) || !self.height.is_multiple_of(2) {
            // yuv420p output needs even dimensions.
            return Err(KaravaError::validation(
                "composite width/height must be even",
            ));
        }
        if self.duration_secs <= 0.0 {
            return Err(KaravaError::validation("composite duration must be > 0"));
        }
        if self.frames.frame_count == 0 {
            return Err(KaravaError::validation("composite needs at least one frame"));
        }
        let opacity = self.background.overlay_opacity();
        if !(0.0..=1.0).contains(&opacity) {
            return Err(KaravaError::validation(
                "dim overlay opacity must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Fractional progress callback for the compositing stage, 0..=1.
pub type CompositeProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// Seam between orchestration and the external muxing process.
pub trait Compositor: Send + Sync {
    fn composite(
        &self,
        spec: &CompositeSpec,
        on_progress: &CompositeProgressFn<'_>,
        cancel: &CancelToken,
    ) -> KaravaResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoEncoder {
    Libx264,
    H264Nvenc,
    H264VideoToolbox,
    H264Qsv,
}

impl VideoEncoder {
    pub fn name(self) -> &'static str {
        match self {
            Self::Libx264 => "libx264",
            Self::H264Nvenc => "h264_nvenc",
            Self::H264VideoToolbox => "h264_videotoolbox",
            Self::H264Qsv => "h264_qsv",
        }
    }

    /// Encoder selection plus its quality knob. The quality flag differs
    /// per encoder family even though the scale is CRF-like everywhere.
    fn quality_args(self, crf: u32) -> Vec<String> {
        let flag = match self {
            Self::Libx264 => "-crf",
            Self::H264Nvenc => "-cq",
            Self::H264VideoToolbox => "-q:v",
            Self::H264Qsv => "-global_quality",
        };
        vec![
            "-c:v".to_string(),
            self.name().to_string(),
            flag.to_string(),
            crf.to_string(),
        ]
    }

    /// Pick a hardware H.264 encoder when the local ffmpeg build offers
    /// one, falling back to libx264. A hardware encoder can still fail at
    /// runtime on a misconfigured driver, which is why the compositor
    /// verifies the output file after a clean exit.
    pub fn detect() -> Self {
        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        let Ok(output) = output else {
            return Self::Libx264;
        };
        let listing = String::from_utf8_lossy(&output.stdout);
        for candidate in [Self::H264Nvenc, Self::H264VideoToolbox, Self::H264Qsv] {
            if listing.contains(candidate.name()) {
                tracing::debug!(encoder = candidate.name(), "using hardware h264 encoder");
                return candidate;
            }
        }
        Self::Libx264
    }
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn ensure_parent_dir(path: &Path) -> KaravaResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Build the full ffmpeg argv for a composite. Arguments stay a structured
/// list end to end; nothing is ever passed through a shell.
///
/// Input order is fixed: audio (if any), background (if any), foreground
/// sequence last.
pub fn build_ffmpeg_args(spec: &CompositeSpec, encoder: VideoEncoder) -> KaravaResult<Vec<String>> {
    spec.validate()?;

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        // Keep the stats line at error loglevel; it drives stage progress.
        "-stats".into(),
    ];

    let mut next_input = 0usize;
    let audio_input = spec.audio.as_ref().map(|path| {
        args.push("-i".into());
        args.push(path.to_string_lossy().into_owned());
        let idx = next_input;
        next_input += 1;
        idx
    });

    let background_input = match &spec.background {
        BackgroundInput::None => None,
        BackgroundInput::Image { path, .. } => {
            // A single still, held for the whole composite.
            args.push("-loop".into());
            args.push("1".into());
            args.push("-i".into());
            args.push(path.to_string_lossy().into_owned());
            let idx = next_input;
            next_input += 1;
            Some(idx)
        }
        BackgroundInput::Video {
            path,
            start_offset_secs,
            loop_playback,
            ..
        } => {
            // -ss must precede -stream_loop so every loop cycle restarts
            // from the configured in-point.
            if *start_offset_secs > 0.0 {
                args.push("-ss".into());
                args.push(format_f64(*start_offset_secs));
            }
            if *loop_playback {
                args.push("-stream_loop".into());
                args.push("-1".into());
            }
            args.push("-i".into());
            args.push(path.to_string_lossy().into_owned());
            let idx = next_input;
            next_input += 1;
            Some(idx)
        }
    };

    let fg_input = next_input;
    args.push("-framerate".into());
    args.push(spec.fps.to_string());
    args.push("-i".into());
    args.push(spec.frames.pattern_path().to_string_lossy().into_owned());

    args.push("-filter_complex".into());
    args.push(build_filter_graph(spec, background_input, fg_input));

    args.push("-map".into());
    args.push("[vout]".into());
    if let Some(idx) = audio_input {
        args.push("-map".into());
        args.push(format!("{idx}:a"));
    }

    // Exact duration clamp: a looped or over-long background is truncated
    // and a short background (frozen or looped above) cannot shorten the
    // output.
    args.push("-t".into());
    args.push(format_f64(spec.duration_secs));
    args.push("-r".into());
    args.push(spec.fps.to_string());

    args.extend(encoder.quality_args(spec.crf));
    args.push("-pix_fmt".into());
    args.push("yuv420p".into());
    if audio_input.is_some() {
        args.push("-c:a".into());
        args.push("aac".into());
        args.push("-b:a".into());
        args.push("192k".into());
    }
    args.push("-movflags".into());
    args.push("+faststart".into());
    args.push(spec.out_path.to_string_lossy().into_owned());

    Ok(args)
}

fn build_filter_graph(
    spec: &CompositeSpec,
    background_input: Option<usize>,
    fg_input: usize,
) -> String {
    let (w, h, fps) = (spec.width, spec.height, spec.fps);
    let mut filters: Vec<String> = Vec::new();

    let bg_label = match background_input {
        None => {
            filters.push(format!(
                "color=c=black:s={w}x{h}:r={fps}:d={}[bg]",
                format_f64(spec.duration_secs)
            ));
            "bg"
        }
        Some(idx) => {
            // Cover-fit: scale up to fully cover the frame, then center
            // crop, so any source aspect ratio fills WxH exactly.
            let mut chain = format!("scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}");

            let blur_sigma = match &spec.background {
                BackgroundInput::Image { blur_sigma, .. }
                | BackgroundInput::Video { blur_sigma, .. } => *blur_sigma,
                BackgroundInput::None => 0.0,
            };
            if blur_sigma > 0.0 {
                chain.push_str(&format!(",gblur=sigma={}", format_f64(blur_sigma)));
            }

            if let BackgroundInput::Video {
                loop_playback: false,
                ..
            } = &spec.background
            {
                // Freeze the last frame when the video is shorter than the
                // composite and looping was not requested.
                chain.push_str(",tpad=stop_mode=clone:stop=-1");
            }

            filters.push(format!("[{idx}:v]{chain}[bgs]"));

            let opacity = spec.background.overlay_opacity();
            if opacity > 0.0 {
                // Dim is a brightness factor upstream; here it is already
                // the complement, the opacity of a black layer on top.
                filters.push(format!(
                    "color=c=black@{:.4}:s={w}x{h}:r={fps}[dim]",
                    opacity
                ));
                filters.push("[bgs][dim]overlay=0:0:format=auto[bgd]".to_string());
                "bgd"
            } else {
                "bgs"
            }
        }
    };

    filters.push(format!(
        "[{bg_label}][{fg_input}:v]overlay=0:0:format=auto[vout]"
    ));
    filters.join(";")
}

/// Render a float for an ffmpeg argument without trailing noise
/// ("30", "2.5", "0.333333"). Used for durations, seeks and filter knobs.
fn format_f64(v: f64) -> String {
    if v == v.trunc() {
        format!("{}", v as i64)
    } else {
        let s = format!("{v:.6}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Parse one ffmpeg stats line into fractional progress against the target
/// duration. Lines look like `frame= 123 fps= 60 ... time=00:01:02.05 ...`.
pub fn parse_time_progress(line: &str, total_secs: f64) -> Option<f64> {
    if total_secs <= 0.0 {
        return None;
    }
    let raw = extract_value(line, "time=")?;
    let secs = parse_time_str(&raw)?;
    Some((secs / total_secs).clamp(0.0, 1.0))
}

fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn parse_time_str(raw: &str) -> Option<f64> {
    // HH:MM:SS.cc
    let mut parts = raw.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Executes composites by spawning the system `ffmpeg` binary.
///
/// The spawned child is registered with the job's [`CancelToken`] so a
/// cancellation kills the process directly instead of waiting it out.
#[derive(Clone, Copy, Debug)]
pub struct FfmpegCompositor {
    encoder: VideoEncoder,
}

impl FfmpegCompositor {
    pub fn new(encoder: VideoEncoder) -> Self {
        Self { encoder }
    }

    /// Probe the local ffmpeg for a hardware encoder once, at startup.
    pub fn with_detected_encoder() -> Self {
        Self::new(VideoEncoder::detect())
    }

    pub fn encoder(&self) -> VideoEncoder {
        self.encoder
    }
}

impl Default for FfmpegCompositor {
    fn default() -> Self {
        Self::new(VideoEncoder::Libx264)
    }
}

impl Compositor for FfmpegCompositor {
    fn composite(
        &self,
        spec: &CompositeSpec,
        on_progress: &CompositeProgressFn<'_>,
        cancel: &CancelToken,
    ) -> KaravaResult<()> {
        if !is_ffmpeg_on_path() {
            return Err(KaravaError::compositing(
                "ffmpeg is required for background compositing, but was not found on PATH",
            ));
        }
        ensure_parent_dir(&spec.out_path)?;

        let args = build_ffmpeg_args(spec, self.encoder)?;
        tracing::debug!(out = %spec.out_path.display(), "spawning ffmpeg compositor");

        cancel.checkpoint()?;
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KaravaError::compositing(format!("failed to spawn ffmpeg: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| KaravaError::compositing("failed to open ffmpeg stderr (unexpected)"))?;
        cancel.attach_child(child);

        // Stats lines drive progress; everything else is kept as the error
        // tail. Reading to EOF doubles as waiting: a cancel kill closes the
        // pipe and drops us out of the loop. ffmpeg separates stats updates
        // with carriage returns, so the read is delimited on '\r', not '\n'.
        let mut tail: VecDeque<String> = VecDeque::with_capacity(12);
        let mut reader = std::io::BufReader::new(stderr);
        let mut buf: Vec<u8> = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\r', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let chunk = String::from_utf8_lossy(&buf);
            for piece in chunk.split(['\r', '\n']) {
                if piece.trim().is_empty() {
                    continue;
                }
                if let Some(fraction) = parse_time_progress(piece, spec.duration_secs) {
                    on_progress(fraction);
                } else {
                    if tail.len() == 12 {
                        tail.pop_front();
                    }
                    tail.push_back(piece.to_string());
                }
            }
        }

        let status = match cancel.detach_child() {
            Some(mut child) => child
                .wait()
                .map_err(|e| KaravaError::compositing(format!("failed to wait for ffmpeg: {e}")))?,
            None => return Err(KaravaError::Cancelled),
        };

        // A killed child exits nonzero; report that as cancellation, not as
        // a compositing failure.
        cancel.checkpoint()?;

        if !status.success() {
            let tail: Vec<String> = tail.into();
            return Err(KaravaError::compositing(format!(
                "ffmpeg exited with status {}: {}",
                status,
                tail.join(" | ")
            )));
        }

        if !spec.out_path.exists() {
            // Clean exit without output points at an encoder/driver
            // misconfiguration (e.g. a hardware encoder that initializes
            // but produces nothing), not a transient fault.
            tracing::error!(
                out = %spec.out_path.display(),
                encoder = self.encoder.name(),
                "ffmpeg exited cleanly but produced no output file"
            );
            return Err(KaravaError::missing_output(
                spec.out_path.display().to_string(),
            ));
        }

        on_progress(1.0);
        Ok(())
    }
}

/// Measured container duration in seconds, via ffprobe.
pub fn probe_duration_secs(path: &Path) -> KaravaResult<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .map_err(|e| KaravaError::compositing(format!("failed to run ffprobe: {e}")))?;
    if !output.status.success() {
        return Err(KaravaError::compositing(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<f64>()
        .map_err(|e| KaravaError::compositing(format!("unparsable ffprobe duration: {e}")))
}

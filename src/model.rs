use crate::error::{KaravaError, KaravaResult};

/// One timed lyric line. Immutable input to a render; layout assumes the
/// list is ordered by `start_ms` but the type does not enforce it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caption {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Syllable/word sub-spans for progressive highlight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<CaptionSegment>>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionSegment {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundKind {
    Black,
    Image,
    Video,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LyricsLayout {
    #[default]
    Traditional,
    Bottom,
}

fn default_dim() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// The full declarative render input: audio, captions, background media and
/// style. Wire names match the editor's JSON payload.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneDescription {
    pub audio_src: String,
    pub captions: Vec<Caption>,
    #[serde(rename = "backgroundType")]
    pub background_kind: BackgroundKind,
    #[serde(default)]
    pub background_src: Option<String>,
    /// Brightness factor for the background: 1 = fully visible, 0 = black.
    /// Despite the name it is not an opacity; see [`Self::dim_overlay_opacity`].
    #[serde(default = "default_dim")]
    pub background_dim: f64,
    /// Background blur radius in pixels (0 = none).
    #[serde(default)]
    pub background_blur: f64,
    /// In-point into the background video, seconds.
    #[serde(rename = "backgroundVideoStartTime", default)]
    pub background_video_start_secs: f64,
    #[serde(rename = "backgroundVideoLoop", default)]
    pub background_video_loop: bool,
    /// Known total background video length, seconds. Detected upstream when
    /// absent.
    #[serde(rename = "backgroundVideoDuration", default)]
    pub background_video_duration_secs: Option<f64>,
    #[serde(default)]
    pub sung_color: Option<String>,
    #[serde(default)]
    pub unsung_color: Option<String>,
    #[serde(default)]
    pub font_size: Option<u32>,
    #[serde(default)]
    pub font_family: Option<String>,
    #[serde(default = "default_true")]
    pub enable_shadow: bool,
    #[serde(default = "default_true")]
    pub enable_scroll_animation: bool,
    #[serde(default)]
    pub lyrics_layout: LyricsLayout,
    /// Explicit total duration override, frames.
    #[serde(default)]
    pub duration_in_frames: Option<u64>,
    pub fps: u32,
}

impl SceneDescription {
    pub fn validate(&self) -> KaravaResult<()> {
        if self.fps == 0 {
            return Err(KaravaError::validation("fps must be > 0"));
        }
        if self.audio_src.trim().is_empty() {
            return Err(KaravaError::validation("audioSrc must be non-empty"));
        }
        if !(0.0..=1.0).contains(&self.background_dim) {
            return Err(KaravaError::validation(
                "backgroundDim must be within [0, 1]",
            ));
        }
        if self.background_blur < 0.0 {
            return Err(KaravaError::validation("backgroundBlur must be >= 0"));
        }
        if self.background_video_start_secs < 0.0 {
            return Err(KaravaError::validation(
                "backgroundVideoStartTime must be >= 0",
            ));
        }
        if self.background_kind != BackgroundKind::Black
            && self
                .background_src
                .as_deref()
                .is_none_or(|s| s.trim().is_empty())
        {
            return Err(KaravaError::validation(format!(
                "backgroundSrc is required for {:?} backgrounds",
                self.background_kind
            )));
        }

        for (i, caption) in self.captions.iter().enumerate() {
            if caption.start_ms > caption.end_ms {
                return Err(KaravaError::validation(format!(
                    "caption {i} has startMs > endMs ({} > {})",
                    caption.start_ms, caption.end_ms
                )));
            }
            // Segments are trusted as-is: real subtitle imports routinely
            // carry syllable timings a few ms outside the line interval.
            if let Some(segments) = &caption.segments {
                for segment in segments {
                    if segment.start_ms < caption.start_ms || segment.end_ms > caption.end_ms {
                        tracing::debug!(
                            caption = i,
                            segment = %segment.text,
                            "caption segment extends past its parent interval"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Whether this scene needs the two-stage pipeline (foreground frames +
    /// external background compositing).
    pub fn has_background(&self) -> bool {
        self.background_kind != BackgroundKind::Black
    }

    /// Opacity of the black darkening layer composited over the background.
    /// `background_dim` is a brightness factor, so the overlay gets the
    /// complement.
    pub fn dim_overlay_opacity(&self) -> f64 {
        (1.0 - self.background_dim).clamp(0.0, 1.0)
    }

    /// A copy of this scene with the background stripped, used to resolve
    /// composition metadata for the two-stage pipeline. Background-driven
    /// duration (a long background video) must not leak into foreground
    /// timing.
    pub fn foreground_only(&self) -> Self {
        Self {
            background_kind: BackgroundKind::Black,
            background_src: None,
            background_dim: 1.0,
            background_blur: 0.0,
            background_video_start_secs: 0.0,
            background_video_loop: false,
            background_video_duration_secs: None,
            ..self.clone()
        }
    }
}

/// Per-submission tuning knobs.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOptions {
    /// Quality factor, lower = higher quality (CRF scale).
    #[serde(default = "RenderOptions::default_crf")]
    pub crf: u32,
    /// Render only the first [`RenderOptions::SAMPLE_CAP_SECS`] seconds for
    /// a quick preview.
    #[serde(default)]
    pub render_sample: bool,
}

impl RenderOptions {
    pub const SAMPLE_CAP_SECS: u64 = 30;

    fn default_crf() -> u32 {
        23
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            crf: Self::default_crf(),
            render_sample: false,
        }
    }
}

/// Submission payload. The current form carries the scene under
/// `inputProps` plus options; the legacy form is the bare scene itself.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum RenderRequest {
    WithOptions {
        #[serde(rename = "inputProps")]
        scene: SceneDescription,
        #[serde(default)]
        options: RenderOptions,
    },
    Legacy(SceneDescription),
}

impl RenderRequest {
    pub fn into_parts(self) -> (SceneDescription, RenderOptions) {
        match self {
            Self::WithOptions { scene, options } => (scene, options),
            Self::Legacy(scene) => (scene, RenderOptions::default()),
        }
    }
}

use std::path::{Path, PathBuf};

use crate::{
    error::{KaravaError, KaravaResult},
    job::CancelToken,
    model::SceneDescription,
};

/// Half-open frame interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameRange {
    pub start: u64,
    pub end: u64, // exclusive
}

impl FrameRange {
    pub fn new(start: u64, end: u64) -> KaravaResult<Self> {
        if start > end {
            return Err(KaravaError::validation("FrameRange start must be <= end"));
        }
        Ok(Self { start, end })
    }

    pub fn len_frames(self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(self) -> bool {
        self.start == self.end
    }
}

/// Composition metadata resolved by evaluating a scene description.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct CompositionMeta {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub duration_in_frames: u64,
}

impl CompositionMeta {
    pub fn validate(&self) -> KaravaResult<()> {
        if self.fps == 0 {
            return Err(KaravaError::validation("composition fps must be > 0"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(KaravaError::validation(
                "composition width/height must be > 0",
            ));
        }
        if self.duration_in_frames == 0 {
            return Err(KaravaError::validation(
                "composition duration must be > 0 frames",
            ));
        }
        Ok(())
    }

    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        frames as f64 / f64::from(self.fps)
    }
}

/// Handle to a prepared ("bundled") scene program, opaque outside the
/// renderer that produced it.
#[derive(Clone, Debug)]
pub struct SceneBundle {
    pub location: PathBuf,
}

/// Per-frame progress callback: `(frames_done, frames_total)`.
pub type ProgressFn<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

/// The consumed frame-rendering capability. Implementations rasterize the
/// animated caption foreground (and, for the single-stage pipeline, the
/// full composite); this crate never rasterizes pixels itself.
///
/// Implementations honor `cancel` by returning [`KaravaError::Cancelled`]
/// from their next per-frame step.
pub trait FrameRenderer: Send + Sync {
    /// Compile the scene into a renderable program.
    fn prepare_scene(&self, scene: &SceneDescription) -> KaravaResult<SceneBundle>;

    /// Resolve effective fps/dimensions/duration from scene props.
    fn resolve_metadata(
        &self,
        bundle: &SceneBundle,
        scene: &SceneDescription,
    ) -> KaravaResult<CompositionMeta>;

    /// Render `range` as sequential still images into `out_dir`. Output
    /// names must carry an embedded numeric frame index; contiguity and
    /// zero-padding are normalized downstream.
    fn render_frame_sequence(
        &self,
        bundle: &SceneBundle,
        scene: &SceneDescription,
        out_dir: &Path,
        range: FrameRange,
        on_progress: &ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> KaravaResult<()>;

    /// Render `range` directly to a muxed video at `out_path`.
    fn render_muxed_media(
        &self,
        bundle: &SceneBundle,
        scene: &SceneDescription,
        out_path: &Path,
        range: FrameRange,
        on_progress: &ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> KaravaResult<()>;
}

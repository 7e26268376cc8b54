#![forbid(unsafe_code)]

pub mod compositor;
pub mod error;
pub mod job;
pub mod model;
pub mod orchestrator;
pub mod renderer;
pub mod sequence;

pub use compositor::{
    BackgroundInput, CompositeSpec, Compositor, FfmpegCompositor, VideoEncoder,
    probe_duration_secs,
};
pub use error::{KaravaError, KaravaResult};
pub use job::{
    CancelRegistry, CancelToken, InMemoryJobStore, JobId, JobRegistry, JobSnapshot, JobStatus,
    JobStore, RegistryConfig,
};
pub use model::{
    BackgroundKind, Caption, CaptionSegment, LyricsLayout, RenderOptions, RenderRequest,
    SceneDescription,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use renderer::{CompositionMeta, FrameRange, FrameRenderer, ProgressFn, SceneBundle};
pub use sequence::{FrameSequence, normalize_frame_sequence};

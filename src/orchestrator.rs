use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use anyhow::Context as _;

use crate::{
    compositor::{BackgroundInput, CompositeSpec, Compositor, ensure_parent_dir},
    error::{KaravaError, KaravaResult},
    job::{CancelRegistry, CancelToken, JobId, JobRegistry, JobSnapshot, JobStatus, RegistryConfig},
    model::{BackgroundKind, RenderOptions, RenderRequest, SceneDescription},
    renderer::{CompositionMeta, FrameRange, FrameRenderer},
    sequence::normalize_frame_sequence,
};

// Stage floors within the 0..=100 progress scale. Frame callbacks map
// linearly into the gap between a stage's floor and its ceiling.
const PROGRESS_BUNDLING: u8 = 1;
const PROGRESS_SELECTING: u8 = 5;
const PROGRESS_RENDER_START: u8 = 10;
const PROGRESS_SINGLE_END: u8 = 95;
const PROGRESS_FG_END: u8 = 70;
const PROGRESS_COMPOSITE_END: u8 = 100;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Web-servable directory for finished videos.
    pub output_dir: PathBuf,
    /// Scratch root for per-job foreground frame directories.
    pub work_dir: PathBuf,
    /// Root against which scene media URIs (`/uploads/...`) are resolved.
    pub media_root: PathBuf,
    pub registry: RegistryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("public/out"),
            work_dir: std::env::temp_dir().join("karava"),
            media_root: PathBuf::from("public"),
            registry: RegistryConfig::default(),
        }
    }
}

/// Drives render jobs end to end: accepts submissions, spawns one worker
/// thread per job, reports progress through the job registry and honors
/// cooperative cancellation at every stage boundary.
pub struct Orchestrator {
    renderer: Arc<dyn FrameRenderer>,
    compositor: Arc<dyn Compositor>,
    jobs: Arc<JobRegistry>,
    cancels: Arc<CancelRegistry>,
    workers: Mutex<HashMap<JobId, JoinHandle<()>>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        renderer: Arc<dyn FrameRenderer>,
        compositor: Arc<dyn Compositor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            renderer,
            compositor,
            jobs: Arc::new(JobRegistry::in_memory(config.registry)),
            cancels: Arc::new(CancelRegistry::new()),
            workers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Accept a render job. Registers the job as `{0, init}` and its cancel
    /// handle before the worker is spawned, so a status query issued right
    /// after submission always sees the job.
    pub fn submit_render(
        &self,
        scene: SceneDescription,
        options: RenderOptions,
    ) -> KaravaResult<JobId> {
        scene.validate()?;
        self.jobs.sweep_expired();
        self.reap_workers();

        let id = JobId::new();
        self.jobs.create(id);
        let token = self.cancels.register(id);

        let worker = JobWorker {
            id,
            scene,
            options,
            token,
            renderer: self.renderer.clone(),
            compositor: self.compositor.clone(),
            jobs: self.jobs.clone(),
            cancels: self.cancels.clone(),
            output_dir: self.config.output_dir.clone(),
            work_dir: self.config.work_dir.clone(),
            media_root: self.config.media_root.clone(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("render-{id}"))
            .spawn(move || worker.run())
            .with_context(|| "spawn render worker thread")?;
        self.workers
            .lock()
            .expect("worker map poisoned")
            .insert(id, handle);

        tracing::info!(%id, "render job submitted");
        Ok(id)
    }

    /// Submission from a wire payload (current or legacy form).
    pub fn submit_request(&self, request: RenderRequest) -> KaravaResult<JobId> {
        let (scene, options) = request.into_parts();
        self.submit_render(scene, options)
    }

    pub fn status(&self, id: JobId) -> KaravaResult<JobSnapshot> {
        self.jobs.get(&id)
    }

    /// Signal an in-flight job to stop. The status flips to `cancelled`
    /// immediately; the worker's own terminal write cannot downgrade it.
    /// Jobs that already finished (or never existed) report not-found.
    pub fn cancel_render(&self, id: JobId) -> KaravaResult<()> {
        let Some(token) = self.cancels.take(&id) else {
            return Err(KaravaError::not_found(id.to_string()));
        };
        token.cancel();
        self.jobs.finish_cancelled(&id);
        tracing::info!(%id, "render job cancelled");
        Ok(())
    }

    /// Join and drop handles of workers that have already exited, so the
    /// handle map stays bounded by the number of in-flight jobs. Runs
    /// opportunistically on each submission. Returns the number reaped.
    pub fn reap_workers(&self) -> usize {
        let mut workers = self.workers.lock().expect("worker map poisoned");
        let finished: Vec<JobId> = workers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            // is_finished above makes this join non-blocking.
            if let Some(handle) = workers.remove(id)
                && handle.join().is_err()
            {
                tracing::error!(%id, "render worker panicked");
            }
        }
        finished.len()
    }

    /// Block until the job's worker thread has fully stopped. Returns false
    /// for unknown (or already joined) jobs. Cleanup ordering in tests and
    /// shutdown paths depends on this.
    pub fn join(&self, id: JobId) -> bool {
        let handle = self.workers.lock().expect("worker map poisoned").remove(&id);
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    tracing::error!(%id, "render worker panicked");
                }
                true
            }
            None => false,
        }
    }
}

struct JobWorker {
    id: JobId,
    scene: SceneDescription,
    options: RenderOptions,
    token: Arc<CancelToken>,
    renderer: Arc<dyn FrameRenderer>,
    compositor: Arc<dyn Compositor>,
    jobs: Arc<JobRegistry>,
    cancels: Arc<CancelRegistry>,
    output_dir: PathBuf,
    work_dir: PathBuf,
    media_root: PathBuf,
}

impl JobWorker {
    fn run(self) {
        let outcome = self.render();
        match outcome {
            Ok(path) => {
                tracing::info!(id = %self.id, out = %path.display(), "render job done");
                self.jobs.finish_done(&self.id, path);
            }
            Err(err) if err.is_cancelled() => {
                tracing::info!(id = %self.id, "render job stopped by cancellation");
                self.jobs.finish_cancelled(&self.id);
            }
            Err(err) => {
                tracing::error!(id = %self.id, %err, "render job failed");
                self.jobs.finish_error(&self.id, err.to_string());
            }
        }

        self.cancels.remove(&self.id);

        // The per-job frame directory is deleted on every exit path so
        // sustained use cannot exhaust the disk.
        let frames_dir = self.frames_dir();
        if frames_dir.exists()
            && let Err(err) = std::fs::remove_dir_all(&frames_dir)
        {
            tracing::warn!(id = %self.id, %err, "failed to remove frame directory");
        }
    }

    fn frames_dir(&self) -> PathBuf {
        self.work_dir.join(self.id.to_string())
    }

    #[tracing::instrument(skip(self), fields(id = %self.id))]
    fn render(&self) -> KaravaResult<PathBuf> {
        let id = self.id;

        self.token.checkpoint()?;
        self.jobs.set_stage(&id, JobStatus::Bundling, PROGRESS_BUNDLING);
        let bundle = self.renderer.prepare_scene(&self.scene)?;

        self.token.checkpoint()?;
        self.jobs.set_stage(&id, JobStatus::Selecting, PROGRESS_SELECTING);
        let two_stage = self.scene.has_background();
        // Two-stage metadata comes from the foreground-only scene so a
        // background video's length cannot drive foreground timing.
        let meta_scene = if two_stage {
            self.scene.foreground_only()
        } else {
            self.scene.clone()
        };
        let meta = self.renderer.resolve_metadata(&bundle, &meta_scene)?;
        meta.validate()?;

        let range = effective_frame_range(&meta, self.options);
        let out_path = self.output_dir.join(format!("karaoke-{id}.mp4"));
        ensure_parent_dir(&out_path)?;

        if !two_stage {
            self.token.checkpoint()?;
            self.jobs.set_stage(&id, JobStatus::Rendering, PROGRESS_RENDER_START);
            let jobs = self.jobs.clone();
            let on_progress = move |done: u64, total: u64| {
                jobs.set_progress(
                    &id,
                    map_frame_progress(done, total, PROGRESS_RENDER_START, PROGRESS_SINGLE_END),
                );
            };
            self.renderer.render_muxed_media(
                &bundle,
                &self.scene,
                &out_path,
                range,
                &on_progress,
                &self.token,
            )?;
            return Ok(out_path);
        }

        self.token.checkpoint()?;
        self.jobs
            .set_stage(&id, JobStatus::RenderingFg, PROGRESS_RENDER_START);
        let frames_dir = self.frames_dir();
        std::fs::create_dir_all(&frames_dir)
            .with_context(|| format!("create frame directory '{}'", frames_dir.display()))?;
        let fg_scene = self.scene.foreground_only();
        {
            let jobs = self.jobs.clone();
            let on_progress = move |done: u64, total: u64| {
                jobs.set_progress(
                    &id,
                    map_frame_progress(done, total, PROGRESS_RENDER_START, PROGRESS_FG_END),
                );
            };
            self.renderer.render_frame_sequence(
                &bundle,
                &fg_scene,
                &frames_dir,
                range,
                &on_progress,
                &self.token,
            )?;
        }

        self.token.checkpoint()?;
        self.jobs
            .set_stage(&id, JobStatus::Compositing, PROGRESS_FG_END);
        let frames = normalize_frame_sequence(&frames_dir)?;
        let duration_secs = meta.frames_to_secs(frames.frame_count);
        let spec = CompositeSpec {
            frames,
            fps: meta.fps,
            width: meta.width,
            height: meta.height,
            duration_secs,
            audio: Some(resolve_media(&self.media_root, &self.scene.audio_src)),
            background: background_input(&self.media_root, &self.scene)?,
            crf: self.options.crf,
            out_path: out_path.clone(),
        };

        self.token.checkpoint()?;
        let jobs = self.jobs.clone();
        let on_progress = move |fraction: f64| {
            jobs.set_progress(
                &id,
                map_fraction_progress(fraction, PROGRESS_FG_END, PROGRESS_COMPOSITE_END),
            );
        };
        self.compositor.composite(&spec, &on_progress, &self.token)?;

        Ok(out_path)
    }
}

/// The frame range to actually render: the full composition, or a capped
/// prefix in sample mode.
fn effective_frame_range(meta: &CompositionMeta, options: RenderOptions) -> FrameRange {
    let total = meta.duration_in_frames;
    let end = if options.render_sample {
        total.min(RenderOptions::SAMPLE_CAP_SECS * u64::from(meta.fps))
    } else {
        total
    };
    FrameRange { start: 0, end }
}

fn map_frame_progress(done: u64, total: u64, floor: u8, ceiling: u8) -> u8 {
    if total == 0 {
        return floor;
    }
    map_fraction_progress(done as f64 / total as f64, floor, ceiling)
}

fn map_fraction_progress(fraction: f64, floor: u8, ceiling: u8) -> u8 {
    let span = f64::from(ceiling - floor);
    let p = f64::from(floor) + span * fraction.clamp(0.0, 1.0);
    (p.floor() as u8).min(ceiling)
}

/// Map a scene media URI (`/uploads/song.mp3`) onto the local media root.
fn resolve_media(media_root: &Path, src: &str) -> PathBuf {
    media_root.join(src.trim_start_matches('/'))
}

fn background_input(
    media_root: &Path,
    scene: &SceneDescription,
) -> KaravaResult<BackgroundInput> {
    let src = || -> KaravaResult<PathBuf> {
        let src = scene
            .background_src
            .as_deref()
            .ok_or_else(|| KaravaError::validation("backgroundSrc missing for media background"))?;
        Ok(resolve_media(media_root, src))
    };

    Ok(match scene.background_kind {
        BackgroundKind::Black => BackgroundInput::None,
        BackgroundKind::Image => BackgroundInput::Image {
            path: src()?,
            overlay_opacity: scene.dim_overlay_opacity(),
            blur_sigma: scene.background_blur,
        },
        BackgroundKind::Video => BackgroundInput::Video {
            path: src()?,
            start_offset_secs: scene.background_video_start_secs,
            loop_playback: scene.background_video_loop,
            overlay_opacity: scene.dim_overlay_opacity(),
            blur_sigma: scene.background_blur,
        },
    })
}

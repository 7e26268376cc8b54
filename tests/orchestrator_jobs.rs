use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use karava::{
    BackgroundInput, BackgroundKind, Caption, CompositeSpec, CompositionMeta, Compositor,
    FrameRange, FrameRenderer, JobStatus, KaravaError, KaravaResult, LyricsLayout, Orchestrator,
    OrchestratorConfig, RegistryConfig, RenderOptions, SceneBundle, SceneDescription,
    compositor::CompositeProgressFn, job::CancelToken, renderer::ProgressFn,
};

fn scene(background: BackgroundKind) -> SceneDescription {
    SceneDescription {
        audio_src: "/uploads/song.mp3".to_string(),
        captions: vec![Caption {
            text: "la la la".to_string(),
            start_ms: 0,
            end_ms: 4000,
            timestamp_ms: None,
            confidence: None,
            segments: None,
        }],
        background_kind: background,
        background_src: match background {
            BackgroundKind::Black => None,
            BackgroundKind::Image => Some("/uploads/bg.jpg".to_string()),
            BackgroundKind::Video => Some("/uploads/bg.mp4".to_string()),
        },
        background_dim: 0.6,
        background_blur: 0.0,
        background_video_start_secs: 0.0,
        background_video_loop: false,
        background_video_duration_secs: None,
        sung_color: None,
        unsung_color: None,
        font_size: None,
        font_family: None,
        enable_shadow: true,
        enable_scroll_animation: true,
        lyrics_layout: LyricsLayout::Traditional,
        duration_in_frames: None,
        fps: 30,
    }
}

#[derive(Clone)]
struct MockRenderer {
    meta: CompositionMeta,
    frame_delay: Duration,
    fail_render: bool,
    hold_prepare: Arc<AtomicBool>,
    metadata_scenes: Arc<Mutex<Vec<SceneDescription>>>,
    rendered_ranges: Arc<Mutex<Vec<FrameRange>>>,
}

impl MockRenderer {
    fn new(duration_in_frames: u64) -> Self {
        Self {
            meta: CompositionMeta {
                fps: 30,
                width: 1920,
                height: 1080,
                duration_in_frames,
            },
            frame_delay: Duration::ZERO,
            fail_render: false,
            hold_prepare: Arc::new(AtomicBool::new(false)),
            metadata_scenes: Arc::new(Mutex::new(Vec::new())),
            rendered_ranges: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl FrameRenderer for MockRenderer {
    fn prepare_scene(&self, _scene: &SceneDescription) -> KaravaResult<SceneBundle> {
        while self.hold_prepare.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(SceneBundle {
            location: PathBuf::from("mock-bundle"),
        })
    }

    fn resolve_metadata(
        &self,
        _bundle: &SceneBundle,
        scene: &SceneDescription,
    ) -> KaravaResult<CompositionMeta> {
        self.metadata_scenes.lock().unwrap().push(scene.clone());
        Ok(self.meta)
    }

    fn render_frame_sequence(
        &self,
        _bundle: &SceneBundle,
        _scene: &SceneDescription,
        out_dir: &Path,
        range: FrameRange,
        on_progress: &ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> KaravaResult<()> {
        self.rendered_ranges.lock().unwrap().push(range);
        if self.fail_render {
            return Err(KaravaError::render("synthetic frame render failure"));
        }
        let total = range.len_frames();
        for i in 0..total {
            cancel.checkpoint()?;
            if !self.frame_delay.is_zero() {
                std::thread::sleep(self.frame_delay);
            }
            // Renderer-native naming: indexed but neither padded nor
            // guaranteed zero-based.
            std::fs::write(out_dir.join(format!("element-{}.png", i + 1)), "px").unwrap();
            on_progress(i + 1, total);
        }
        Ok(())
    }

    fn render_muxed_media(
        &self,
        _bundle: &SceneBundle,
        _scene: &SceneDescription,
        out_path: &Path,
        range: FrameRange,
        on_progress: &ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> KaravaResult<()> {
        self.rendered_ranges.lock().unwrap().push(range);
        if self.fail_render {
            return Err(KaravaError::render("synthetic mux render failure"));
        }
        let total = range.len_frames();
        for i in 0..total {
            cancel.checkpoint()?;
            if !self.frame_delay.is_zero() {
                std::thread::sleep(self.frame_delay);
            }
            on_progress(i + 1, total);
        }
        std::fs::write(out_path, "mp4").unwrap();
        Ok(())
    }
}

#[derive(Default)]
struct FakeCompositor {
    fail: bool,
    specs: Arc<Mutex<Vec<CompositeSpec>>>,
}

impl Compositor for FakeCompositor {
    fn composite(
        &self,
        spec: &CompositeSpec,
        on_progress: &CompositeProgressFn<'_>,
        cancel: &CancelToken,
    ) -> KaravaResult<()> {
        cancel.checkpoint()?;
        self.specs.lock().unwrap().push(spec.clone());
        if self.fail {
            return Err(KaravaError::compositing("synthetic compositing failure"));
        }
        std::fs::write(&spec.out_path, "mp4").unwrap();
        on_progress(1.0);
        Ok(())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    work_dir: PathBuf,
    _root: tempfile::TempDir,
}

fn harness(renderer: MockRenderer, compositor: FakeCompositor) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("work");
    let config = OrchestratorConfig {
        output_dir: root.path().join("out"),
        work_dir: work_dir.clone(),
        media_root: root.path().join("public"),
        registry: RegistryConfig { terminal_ttl: None },
    };
    Harness {
        orchestrator: Orchestrator::new(Arc::new(renderer), Arc::new(compositor), config),
        work_dir,
        _root: root,
    }
}

fn poll_until_terminal(orchestrator: &Orchestrator, id: karava::JobId) -> Vec<(u8, JobStatus)> {
    let mut observed = Vec::new();
    loop {
        let snap = orchestrator.status(id).unwrap();
        observed.push((snap.progress, snap.status));
        if snap.status.is_terminal() {
            return observed;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn submitted_job_is_immediately_visible_as_init() {
    let renderer = MockRenderer::new(10);
    renderer.hold_prepare.store(true, Ordering::SeqCst);
    let hold = renderer.hold_prepare.clone();
    let h = harness(renderer, FakeCompositor::default());

    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Black), RenderOptions::default())
        .unwrap();
    let snap = h.orchestrator.status(id).unwrap();
    assert_eq!(snap.status, JobStatus::Init);
    assert_eq!(snap.progress, 0);

    hold.store(false, Ordering::SeqCst);
    assert!(h.orchestrator.join(id));
    assert_eq!(h.orchestrator.status(id).unwrap().status, JobStatus::Done);
}

#[test]
fn progress_is_monotonic_until_done() {
    let h = harness(MockRenderer::new(50), FakeCompositor::default());
    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Black), RenderOptions::default())
        .unwrap();

    let observed = poll_until_terminal(&h.orchestrator, id);
    h.orchestrator.join(id);

    for pair in observed.windows(2) {
        assert!(
            pair[1].0 >= pair[0].0,
            "progress regressed: {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
    let last = h.orchestrator.status(id).unwrap();
    assert_eq!(last.status, JobStatus::Done);
    assert_eq!(last.progress, 100);
    let out = last.output_path.unwrap();
    assert!(out.exists());
    assert!(
        out.file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("karaoke-{id}"))
    );
}

#[test]
fn cancel_mid_flight_wins_over_the_worker() {
    let mut renderer = MockRenderer::new(2000);
    renderer.frame_delay = Duration::from_millis(3);
    let h = harness(renderer, FakeCompositor::default());
    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Image), RenderOptions::default())
        .unwrap();

    // Wait for the foreground render stage to be underway.
    loop {
        let snap = h.orchestrator.status(id).unwrap();
        if snap.status == JobStatus::RenderingFg && snap.progress > 10 {
            break;
        }
        assert!(!snap.status.is_terminal(), "job finished before cancel");
        std::thread::sleep(Duration::from_millis(1));
    }

    h.orchestrator.cancel_render(id).unwrap();
    assert_eq!(
        h.orchestrator.status(id).unwrap().status,
        JobStatus::Cancelled
    );

    // The worker's own terminal write must not downgrade the status.
    h.orchestrator.join(id);
    let snap = h.orchestrator.status(id).unwrap();
    assert_eq!(snap.status, JobStatus::Cancelled);
    assert_eq!(snap.progress, 0);

    // The handle is single-shot: a second cancel is not-found.
    assert!(matches!(
        h.orchestrator.cancel_render(id),
        Err(KaravaError::NotFound(_))
    ));
}

#[test]
fn cancel_after_done_or_unknown_is_not_found() {
    let h = harness(MockRenderer::new(5), FakeCompositor::default());

    let unknown = karava::JobId::new();
    assert!(matches!(
        h.orchestrator.cancel_render(unknown),
        Err(KaravaError::NotFound(_))
    ));

    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Black), RenderOptions::default())
        .unwrap();
    h.orchestrator.join(id);
    assert_eq!(h.orchestrator.status(id).unwrap().status, JobStatus::Done);

    assert!(matches!(
        h.orchestrator.cancel_render(id),
        Err(KaravaError::NotFound(_))
    ));
    // And the terminal state is untouched.
    assert_eq!(h.orchestrator.status(id).unwrap().status, JobStatus::Done);
}

#[test]
fn sample_mode_renders_a_thirty_second_prefix() {
    let renderer = MockRenderer::new(1800);
    let ranges = renderer.rendered_ranges.clone();
    let compositor = FakeCompositor::default();
    let specs = compositor.specs.clone();
    let h = harness(renderer, compositor);

    let options = RenderOptions {
        render_sample: true,
        ..RenderOptions::default()
    };
    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Image), options)
        .unwrap();
    h.orchestrator.join(id);
    assert_eq!(h.orchestrator.status(id).unwrap().status, JobStatus::Done);

    let ranges = ranges.lock().unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].len_frames(), 900);

    let specs = specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].frames.frame_count, 900);
    assert_eq!(specs[0].duration_secs, 30.0);
}

#[test]
fn compositor_receives_dim_as_overlay_opacity() {
    let compositor = FakeCompositor::default();
    let specs = compositor.specs.clone();
    let h = harness(MockRenderer::new(10), compositor);

    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Image), RenderOptions::default())
        .unwrap();
    h.orchestrator.join(id);

    let specs = specs.lock().unwrap();
    match &specs[0].background {
        BackgroundInput::Image {
            overlay_opacity, ..
        } => assert!((overlay_opacity - 0.4).abs() < 1e-9),
        other => panic!("expected image background, got {other:?}"),
    }
    assert!(specs[0].audio.as_ref().unwrap().ends_with("uploads/song.mp3"));
}

#[test]
fn metadata_is_resolved_on_the_foreground_only_scene() {
    let renderer = MockRenderer::new(10);
    let metadata_scenes = renderer.metadata_scenes.clone();
    let h = harness(renderer, FakeCompositor::default());

    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Video), RenderOptions::default())
        .unwrap();
    h.orchestrator.join(id);

    let seen = metadata_scenes.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].background_kind, BackgroundKind::Black);
    assert!(seen[0].background_src.is_none());
}

#[test]
fn frame_directory_is_removed_on_every_terminal_state() {
    // Done.
    let h = harness(MockRenderer::new(10), FakeCompositor::default());
    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Image), RenderOptions::default())
        .unwrap();
    h.orchestrator.join(id);
    assert_eq!(h.orchestrator.status(id).unwrap().status, JobStatus::Done);
    assert!(!h.work_dir.join(id.to_string()).exists());

    // Error (compositor failure).
    let failing = FakeCompositor {
        fail: true,
        ..FakeCompositor::default()
    };
    let h = harness(MockRenderer::new(10), failing);
    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Image), RenderOptions::default())
        .unwrap();
    h.orchestrator.join(id);
    let snap = h.orchestrator.status(id).unwrap();
    assert_eq!(snap.status, JobStatus::Error);
    assert!(
        snap.error_message
            .unwrap()
            .contains("synthetic compositing failure")
    );
    assert!(!h.work_dir.join(id.to_string()).exists());

    // Cancelled.
    let mut renderer = MockRenderer::new(2000);
    renderer.frame_delay = Duration::from_millis(3);
    let h = harness(renderer, FakeCompositor::default());
    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Image), RenderOptions::default())
        .unwrap();
    loop {
        let snap = h.orchestrator.status(id).unwrap();
        if snap.status == JobStatus::RenderingFg {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    h.orchestrator.cancel_render(id).unwrap();
    h.orchestrator.join(id);
    assert_eq!(
        h.orchestrator.status(id).unwrap().status,
        JobStatus::Cancelled
    );
    assert!(!h.work_dir.join(id.to_string()).exists());
}

#[test]
fn finished_workers_do_not_accumulate_in_the_handle_map() {
    let h = harness(MockRenderer::new(5), FakeCompositor::default());

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            h.orchestrator
                .submit_render(scene(BackgroundKind::Black), RenderOptions::default())
                .unwrap(),
        );
    }
    for id in &ids {
        poll_until_terminal(&h.orchestrator, *id);
    }

    // Terminal status is written before the worker thread exits, so reap
    // until all three threads are actually gone.
    let mut reaped = 0;
    while reaped < 3 {
        reaped += h.orchestrator.reap_workers();
        std::thread::sleep(Duration::from_millis(1));
    }

    // The handles are no longer retained; the job results still are.
    for id in ids {
        assert!(!h.orchestrator.join(id));
        assert_eq!(h.orchestrator.status(id).unwrap().status, JobStatus::Done);
    }
}

#[test]
fn renderer_failure_surfaces_as_error_status() {
    let mut renderer = MockRenderer::new(10);
    renderer.fail_render = true;
    let h = harness(renderer, FakeCompositor::default());

    let id = h
        .orchestrator
        .submit_render(scene(BackgroundKind::Black), RenderOptions::default())
        .unwrap();
    h.orchestrator.join(id);

    let snap = h.orchestrator.status(id).unwrap();
    assert_eq!(snap.status, JobStatus::Error);
    assert_eq!(snap.progress, 0);
    assert!(snap.error_message.unwrap().contains("render error"));
}

#[test]
fn status_of_unknown_job_is_not_found() {
    let h = harness(MockRenderer::new(10), FakeCompositor::default());
    assert!(matches!(
        h.orchestrator.status(karava::JobId::new()),
        Err(KaravaError::NotFound(_))
    ));
}

use std::{
    collections::hash_map::DefaultHasher,
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use approx::assert_relative_eq;
use midly::{
    num::{u15, u28, u4, u7},
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
};
use pianovis_core::{
    export::{
        ffmpeg_available, FrameSink, FrameSinkFactory, Muxer, ThreadLauncher, WorkerHandle,
        WorkerJob, WorkerLauncher,
    },
    CancelToken, ExportEngine, ExportMode, ExportRequest, Frame, PianoVisError, SilentProgress,
    VideoSession, VideoSettings,
};
use tempfile::TempDir;

/// Writes one hash per frame instead of video data, so exports can be
/// compared frame by frame without `ffmpeg`.
#[derive(Clone, Default)]
struct HashingEncoder {
    frames_written: Arc<AtomicUsize>,
    cancel_after: Option<(usize, CancelToken)>,
    /// The write that cancels also fails, like an encoder killed by the same
    /// Ctrl-C.
    break_on_cancel: bool,
}

struct HashingSink {
    path: PathBuf,
    hashes: Vec<String>,
    frames_written: Arc<AtomicUsize>,
    cancel_after: Option<(usize, CancelToken)>,
    break_on_cancel: bool,
}

impl FrameSinkFactory for HashingEncoder {
    fn create(
        &self,
        path: &Path,
        _settings: &VideoSettings,
    ) -> pianovis_core::Result<Box<dyn FrameSink>> {
        fs::write(path, b"")?;
        Ok(Box::new(HashingSink {
            path: path.to_path_buf(),
            hashes: Vec::new(),
            frames_written: Arc::clone(&self.frames_written),
            cancel_after: self.cancel_after.clone(),
            break_on_cancel: self.break_on_cancel,
        }))
    }
}

impl FrameSink for HashingSink {
    fn write_frame(&mut self, frame: &Frame) -> pianovis_core::Result<()> {
        let mut hasher = DefaultHasher::new();
        frame.dimensions().hash(&mut hasher);
        frame.as_raw().hash(&mut hasher);
        self.hashes.push(format!("{:016x}", hasher.finish()));
        let written = self.frames_written.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if written >= *limit {
                token.cancel();
                if self.break_on_cancel {
                    return Err(PianoVisError::Encode(
                        "failed to pipe frame to ffmpeg: Broken pipe (os error 32)".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> pianovis_core::Result<()> {
        fs::write(&self.path, self.hashes.join("\n"))?;
        Ok(())
    }
}

/// Concatenates the video and the audio file name, or fails after leaving a
/// partial output behind.
struct FakeMuxer {
    fail: bool,
}

impl Muxer for FakeMuxer {
    fn mux(
        &self,
        video: &Path,
        audio: &Path,
        _fps: u32,
        output: &Path,
    ) -> pianovis_core::Result<()> {
        if self.fail {
            fs::write(output, b"partial")?;
            return Err(PianoVisError::Mux("simulated failure".into()));
        }
        let mut muxed = fs::read(video)?;
        muxed.extend_from_slice(format!("\naudio:{}", audio.display()).as_bytes());
        fs::write(output, muxed)?;
        Ok(())
    }
}

/// Cancels the export while muxing and then fails, as `ffmpeg` does when it
/// receives the same Ctrl-C.
struct InterruptedMuxer {
    cancel: CancelToken,
}

impl Muxer for InterruptedMuxer {
    fn mux(
        &self,
        _video: &Path,
        _audio: &Path,
        _fps: u32,
        output: &Path,
    ) -> pianovis_core::Result<()> {
        self.cancel.cancel();
        fs::write(output, b"partial")?;
        Err(PianoVisError::Mux("ffmpeg exited with signal: 2 (SIGINT)".into()))
    }
}

/// Runs worker 0 for real; every other worker never finishes and cancels the
/// export after a few polls.
struct StallingLauncher {
    cancel: CancelToken,
    killed: Arc<AtomicUsize>,
}

struct Stalled {
    polls: usize,
    cancel: CancelToken,
    killed: Arc<AtomicUsize>,
    alive: bool,
}

impl WorkerLauncher for StallingLauncher {
    fn launch(&self, job: &WorkerJob) -> pianovis_core::Result<Box<dyn WorkerHandle>> {
        if job.index == 0 {
            return ThreadLauncher.launch(job);
        }
        Ok(Box::new(Stalled {
            polls: 0,
            cancel: self.cancel.clone(),
            killed: Arc::clone(&self.killed),
            alive: true,
        }))
    }
}

impl WorkerHandle for Stalled {
    fn try_wait(&mut self) -> pianovis_core::Result<Option<bool>> {
        self.polls += 1;
        if self.polls == 20 {
            self.cancel.cancel();
        }
        Ok(None)
    }

    fn kill(&mut self) {
        if self.alive {
            self.alive = false;
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Workers listed in `fail` exit unsuccessfully without rendering anything.
struct FlakyLauncher {
    fail: Vec<usize>,
}

struct Failed;

impl WorkerHandle for Failed {
    fn try_wait(&mut self) -> pianovis_core::Result<Option<bool>> {
        Ok(Some(false))
    }

    fn kill(&mut self) {}
}

impl WorkerLauncher for FlakyLauncher {
    fn launch(&self, job: &WorkerJob) -> pianovis_core::Result<Box<dyn WorkerHandle>> {
        if self.fail.contains(&job.index) {
            return Ok(Box::new(Failed));
        }
        ThreadLauncher.launch(job)
    }
}

struct Fixture {
    dir: TempDir,
    scratch: PathBuf,
    session: VideoSession,
}

impl Fixture {
    fn new() -> Self {
        Self::with_offset(0.0)
    }

    fn with_offset(offset: f32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();

        let midi = dir.path().join("song.mid");
        write_midi(&midi);
        let mut session = VideoSession::new(VideoSettings::new(64, 36, 30, offset).unwrap());
        session.add_midi(&midi);
        session.configure("blocks.glow", "true").unwrap();
        session.prepare(&mut SilentProgress).unwrap();

        Self {
            dir,
            scratch,
            session,
        }
    }

    fn output(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn engine(&self, launcher: impl WorkerLauncher + 'static) -> ExportEngine {
        ExportEngine::new(launcher)
            .with_encoder(HashingEncoder::default())
            .with_muxer(FakeMuxer { fail: false })
            .with_temp_root(&self.scratch)
            .with_poll_interval(Duration::from_millis(1))
    }

    fn scratch_is_empty(&self) -> bool {
        fs::read_dir(&self.scratch).unwrap().next().is_none()
    }
}

/// Two consecutive quarter notes at 120 bpm: frames 0..15 and 15..30.
fn write_midi(path: &Path) {
    let midi = |delta: u32, message: MidiMessage| TrackEvent {
        delta: u28::from(delta),
        kind: TrackEventKind::Midi {
            channel: u4::from(0_u8),
            message,
        },
    };
    let on = |key: u8| MidiMessage::NoteOn {
        key: u7::from(key),
        vel: u7::from(100_u8),
    };
    let off = |key: u8| MidiMessage::NoteOff {
        key: u7::from(key),
        vel: u7::from(0_u8),
    };
    let track = vec![
        midi(0, on(60)),
        midi(480, off(60)),
        midi(0, on(67)),
        midi(480, off(67)),
        TrackEvent {
            delta: u28::from(0_u32),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        },
    ];
    let smf = Smf {
        header: Header::new(Format::SingleTrack, Timing::Metrical(u15::from(480_u16))),
        tracks: vec![track],
    };
    smf.save(path).unwrap();
}

#[test]
fn session_parses_synthesized_midi() {
    let fixture = Fixture::new();
    let renderer = fixture.session.renderer().unwrap();
    let notes = renderer.timeline().notes();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].key, 39);
    assert_relative_eq!(notes[1].start_frame, 15.0);
    assert_relative_eq!(notes[1].end_frame, 30.0);
    assert_eq!(fixture.session.total_frames().unwrap(), 60);
}

#[test]
fn sequential_export_without_audio_writes_identical_fallback() {
    let fixture = Fixture::new();
    let output = fixture.output("song.mp4");
    let summary = fixture
        .engine(ThreadLauncher)
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Sequential),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap();

    assert_eq!(summary.frames, 60);
    assert!(!summary.with_audio);
    assert!(summary.missing_frames.is_empty());
    assert_eq!(summary.no_audio, fixture.output("no_audio_song.mp4"));

    let video = fs::read_to_string(&output).unwrap();
    assert_eq!(video.lines().count(), 60);
    assert_eq!(fs::read_to_string(&summary.no_audio).unwrap(), video);
    assert!(fixture.scratch_is_empty());
}

#[test]
fn parallel_and_sequential_exports_match() {
    let fixture = Fixture::new();
    let sequential = fixture.output("sequential.mp4");
    let parallel = fixture.output("parallel.mp4");
    let engine = fixture.engine(ThreadLauncher);

    engine
        .export(
            &fixture.session,
            &ExportRequest::new(&sequential, ExportMode::Sequential),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap();
    let summary = engine
        .export(
            &fixture.session,
            &ExportRequest::new(&parallel, ExportMode::Parallel { workers: 4 }),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap();

    assert!(summary.missing_frames.is_empty());
    assert_eq!(fs::read(&sequential).unwrap(), fs::read(&parallel).unwrap());
    assert!(fixture.scratch_is_empty());
}

#[test]
fn audio_is_muxed_into_output() {
    let mut fixture = Fixture::new();
    fixture.session.set_audio("song.mp3");
    let output = fixture.output("song.mp4");
    let summary = fixture
        .engine(ThreadLauncher)
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Sequential),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap();

    assert!(summary.with_audio);
    let silent = fs::read_to_string(&summary.no_audio).unwrap();
    let muxed = fs::read_to_string(&output).unwrap();
    assert_eq!(muxed, format!("{silent}\naudio:song.mp3"));
}

#[test]
fn mux_failure_keeps_only_the_fallback() {
    let mut fixture = Fixture::new();
    fixture.session.set_audio("song.mp3");
    let output = fixture.output("song.mp4");
    let err = fixture
        .engine(ThreadLauncher)
        .with_muxer(FakeMuxer { fail: true })
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Sequential),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap_err();

    assert!(matches!(err, PianoVisError::Mux(_)));
    assert!(!output.exists());
    assert!(fixture.output("no_audio_song.mp4").is_file());
    assert!(fixture.scratch_is_empty());
}

#[test]
fn invalid_output_is_rejected_before_any_work() {
    let fixture = Fixture::new();
    let encoder = HashingEncoder::default();
    let frames = Arc::clone(&encoder.frames_written);
    let err = fixture
        .engine(ThreadLauncher)
        .with_encoder(encoder)
        .export(
            &fixture.session,
            &ExportRequest::new(
                fixture.output("song.avi"),
                ExportMode::Parallel { workers: 2 },
            ),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap_err();

    assert!(matches!(err, PianoVisError::InvalidPath(_)));
    assert_eq!(frames.load(Ordering::SeqCst), 0);
    assert!(fixture.scratch_is_empty());
}

#[test]
fn cancelling_sequential_export_leaves_nothing_behind() {
    let fixture = Fixture::new();
    let cancel = CancelToken::new();
    let encoder = HashingEncoder {
        cancel_after: Some((10, cancel.clone())),
        ..HashingEncoder::default()
    };
    let frames = Arc::clone(&encoder.frames_written);
    let output = fixture.output("song.mp4");
    let err = fixture
        .engine(ThreadLauncher)
        .with_encoder(encoder)
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Sequential),
            &cancel,
            &mut SilentProgress,
        )
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(frames.load(Ordering::SeqCst), 10);
    assert!(!output.exists());
    assert!(!fixture.output("no_audio_song.mp4").exists());
    assert!(fixture.scratch_is_empty());
}

#[test]
fn encoder_failure_after_ctrl_c_is_reported_as_cancelled() {
    let fixture = Fixture::new();
    let output = fixture.output("song.mp4");
    for mode in [ExportMode::Sequential, ExportMode::Parallel { workers: 2 }] {
        let cancel = CancelToken::new();
        let encoder = HashingEncoder {
            cancel_after: Some((10, cancel.clone())),
            break_on_cancel: true,
            ..HashingEncoder::default()
        };
        let err = fixture
            .engine(ThreadLauncher)
            .with_encoder(encoder)
            .export(
                &fixture.session,
                &ExportRequest::new(&output, mode),
                &cancel,
                &mut SilentProgress,
            )
            .unwrap_err();

        assert!(matches!(err, PianoVisError::Cancelled), "{mode:?}: {err}");
        assert!(!output.exists());
        assert!(fixture.scratch_is_empty());
    }
}

#[test]
fn cancelling_during_mux_removes_both_outputs() {
    let mut fixture = Fixture::new();
    fixture.session.set_audio("song.mp3");
    let cancel = CancelToken::new();
    let output = fixture.output("song.mp4");
    let err = fixture
        .engine(ThreadLauncher)
        .with_muxer(InterruptedMuxer {
            cancel: cancel.clone(),
        })
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Sequential),
            &cancel,
            &mut SilentProgress,
        )
        .unwrap_err();

    assert!(matches!(err, PianoVisError::Cancelled));
    assert!(!output.exists());
    assert!(!fixture.output("no_audio_song.mp4").exists());
    assert!(fixture.scratch_is_empty());
}

#[test]
fn offset_past_every_note_is_an_empty_timeline() {
    // Both notes end by frame 30; -100 pushes them and the tail below zero.
    let fixture = Fixture::with_offset(-100.0);
    assert!(matches!(
        fixture.session.total_frames().unwrap_err(),
        PianoVisError::EmptyTimeline
    ));
    let output = fixture.output("song.mp4");
    for mode in [ExportMode::Sequential, ExportMode::Parallel { workers: 2 }] {
        let err = fixture
            .engine(ThreadLauncher)
            .export(
                &fixture.session,
                &ExportRequest::new(&output, mode),
                &CancelToken::new(),
                &mut SilentProgress,
            )
            .unwrap_err();

        assert!(matches!(err, PianoVisError::EmptyTimeline), "{mode:?}: {err}");
        assert!(!output.exists());
        assert!(!fixture.output("no_audio_song.mp4").exists());
        assert!(fixture.scratch_is_empty());
    }
}

#[test]
fn cancelling_parallel_export_kills_outstanding_workers() {
    let fixture = Fixture::new();
    let cancel = CancelToken::new();
    let killed = Arc::new(AtomicUsize::new(0));
    let launcher = StallingLauncher {
        cancel: cancel.clone(),
        killed: Arc::clone(&killed),
    };
    let output = fixture.output("song.mp4");
    let err = fixture
        .engine(launcher)
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Parallel { workers: 3 }),
            &cancel,
            &mut SilentProgress,
        )
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(killed.load(Ordering::SeqCst), 2);
    assert!(!output.exists());
    assert!(!fixture.output("no_audio_song.mp4").exists());
    assert!(fixture.scratch_is_empty());
}

#[test]
fn failed_worker_frames_are_skipped() {
    let fixture = Fixture::new();
    let output = fixture.output("song.mp4");
    let summary = fixture
        .engine(FlakyLauncher { fail: vec![1] })
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Parallel { workers: 3 }),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap();

    assert_eq!(summary.missing_frames, (20..40).collect::<Vec<_>>());
    assert_eq!(fs::read_to_string(&output).unwrap().lines().count(), 40);
}

#[test]
fn export_fails_when_no_worker_renders() {
    let fixture = Fixture::new();
    let output = fixture.output("song.mp4");
    let err = fixture
        .engine(FlakyLauncher { fail: vec![0, 1] })
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Parallel { workers: 2 }),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap_err();

    assert!(matches!(err, PianoVisError::Worker(_)));
    assert!(!output.exists());
    assert!(fixture.scratch_is_empty());
}

#[test]
fn unprepared_session_cannot_export() {
    let fixture = Fixture::new();
    let session = VideoSession::new(VideoSettings::default());
    assert!(fixture
        .engine(ThreadLauncher)
        .export(
            &session,
            &ExportRequest::new(fixture.output("song.mp4"), ExportMode::Sequential),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .is_err());
    assert!(fixture.scratch_is_empty());
}

#[test]
fn real_ffmpeg_export_when_available() {
    if !ffmpeg_available(Path::new("ffmpeg")) {
        eprintln!("ffmpeg not installed, skipping");
        return;
    }
    let fixture = Fixture::new();
    let output = fixture.output("song.mp4");
    let summary = ExportEngine::new(ThreadLauncher)
        .with_temp_root(&fixture.scratch)
        .export(
            &fixture.session,
            &ExportRequest::new(&output, ExportMode::Parallel { workers: 2 }),
            &CancelToken::new(),
            &mut SilentProgress,
        )
        .unwrap();

    let video = fs::read(&output).unwrap();
    assert!(!video.is_empty());
    assert_eq!(fs::read(&summary.no_audio).unwrap(), video);
    assert!(fixture.scratch_is_empty());
}

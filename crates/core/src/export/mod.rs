//! Offline export of a prepared session to an `.mp4` file.
//!
//! Frames are rendered either on the calling thread straight into the
//! encoder, or by a pool of workers that each write a frame range to a
//! scratch directory which is then encoded in order. The silent video is
//! always kept next to the output as `no_audio_<name>`; if the session has
//! audio, it is muxed into the requested output.

mod encode;
mod worker;

pub use encode::{
    ffmpeg_available, FfmpegEncoderFactory, FfmpegMuxer, FrameSink, FrameSinkFactory, Muxer,
    DEFAULT_CRF,
};
pub use worker::{
    count_frames, frame_file_name, partition_frames, render_range, ProcessLauncher,
    ThreadLauncher, WorkerHandle, WorkerJob, WorkerLauncher,
};

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{
    progress::{ProgressLine, ProgressReporter},
    render::FrameRenderer,
    session::VideoSession,
    PianoVisError, Result,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const INTERMEDIATE_NAME: &str = "video.mp4";
const SNAPSHOT_NAME: &str = "session.json";
const FRAMES_DIR: &str = "frames";

/// Shared flag used to abort a running export from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PianoVisError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Reports any failure after cancellation as [`PianoVisError::Cancelled`].
    /// Children stopped by the same interrupt fail with their own errors,
    /// which would otherwise hide the cancellation.
    fn explain(&self, err: PianoVisError) -> PianoVisError {
        if self.is_cancelled() && !err.is_cancelled() {
            debug!(%err, "error after cancellation");
            PianoVisError::Cancelled
        } else {
            err
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportMode {
    #[default]
    Sequential,
    Parallel {
        workers: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub output: PathBuf,
    pub mode: ExportMode,
    /// Send a desktop notification when done.
    pub notify: bool,
}

impl ExportRequest {
    pub fn new(output: impl Into<PathBuf>, mode: ExportMode) -> Self {
        Self {
            output: output.into(),
            mode,
            notify: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub frames: usize,
    pub output: PathBuf,
    pub no_audio: PathBuf,
    pub with_audio: bool,
    /// Frames no worker produced. Always empty for sequential exports.
    pub missing_frames: Vec<usize>,
}

/// Checks that `path` names an `.mp4` file.
pub fn validate_output_path(path: &Path) -> Result<()> {
    let is_mp4 = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
    let has_name = path.file_stem().is_some_and(|stem| !stem.is_empty());
    if is_mp4 && has_name {
        Ok(())
    } else {
        Err(PianoVisError::InvalidPath(path.to_path_buf()))
    }
}

/// Location of the silent fallback for `output`: same directory, file name
/// prefixed with `no_audio_`.
pub fn no_audio_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("no_audio_{name}"))
}

/// Best-effort desktop notification. Failures are only logged.
pub fn notify_completion(message: &str) {
    if !cfg!(target_os = "linux") {
        return;
    }
    let result = Command::new("notify-send")
        .args(["PianoVis", message])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        debug!(%err, "desktop notification unavailable");
    }
}

/// Drives an export. Encoder, muxer and worker launcher are pluggable so the
/// pipeline can run without `ffmpeg` or a worker binary.
pub struct ExportEngine {
    encoder: Box<dyn FrameSinkFactory>,
    muxer: Box<dyn Muxer>,
    launcher: Box<dyn WorkerLauncher>,
    temp_root: Option<PathBuf>,
    poll_interval: Duration,
}

impl ExportEngine {
    /// `ffmpeg` from `PATH` for encoding and muxing, `launcher` for workers.
    pub fn new(launcher: impl WorkerLauncher + 'static) -> Self {
        Self {
            encoder: Box::new(FfmpegEncoderFactory::default()),
            muxer: Box::new(FfmpegMuxer::default()),
            launcher: Box::new(launcher),
            temp_root: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_encoder(mut self, encoder: impl FrameSinkFactory + 'static) -> Self {
        self.encoder = Box::new(encoder);
        self
    }

    pub fn with_muxer(mut self, muxer: impl Muxer + 'static) -> Self {
        self.muxer = Box::new(muxer);
        self
    }

    /// Directory in which the private scratch area is created. Defaults to
    /// the system temp dir.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Renders every frame of `session`, encodes, and writes the output and
    /// its silent fallback.
    ///
    /// On error or cancellation the scratch area is removed and the final
    /// output is not left behind.
    pub fn export(
        &self,
        session: &VideoSession,
        request: &ExportRequest,
        cancel: &CancelToken,
        progress: &mut dyn ProgressReporter,
    ) -> Result<ExportSummary> {
        validate_output_path(&request.output)?;
        let renderer = session.renderer()?;
        let total = renderer.timeline().total_frames()?;

        let work = self.scratch_dir()?;
        debug!(dir = %work.path().display(), "created scratch area");
        let intermediate = work.path().join(INTERMEDIATE_NAME);

        let started = Instant::now();
        let outcome = match request.mode {
            ExportMode::Sequential => {
                info!(frames = total, "exporting sequentially");
                self.render_sequential(renderer, total, &intermediate, cancel, progress)
                    .map(|()| Vec::new())
            }
            ExportMode::Parallel { workers } => {
                info!(frames = total, workers, "exporting in parallel");
                self.render_parallel(
                    session,
                    total,
                    workers,
                    &work,
                    &intermediate,
                    cancel,
                    progress,
                )
            }
        };
        let missing_frames = match outcome {
            Ok(missing) => missing,
            Err(err) => {
                progress.clear();
                return Err(cancel.explain(err));
            }
        };
        cancel.check()?;

        let no_audio = no_audio_path(&request.output);
        let finished = self.finish_outputs(
            &intermediate,
            session.audio_path(),
            session.settings().fps,
            &request.output,
            &no_audio,
        );
        let with_audio = match finished {
            Ok(with_audio) => with_audio,
            Err(err) if cancel.is_cancelled() => {
                for path in [&request.output, &no_audio] {
                    let _ = fs::remove_file(path);
                }
                return Err(cancel.explain(err));
            }
            Err(err) => return Err(err),
        };
        drop(work);

        info!(
            output = %request.output.display(),
            elapsed = ?started.elapsed(),
            "export finished"
        );
        if request.notify {
            notify_completion("Finished exporting an animation!");
        }
        Ok(ExportSummary {
            frames: total,
            output: request.output.clone(),
            no_audio,
            with_audio,
            missing_frames,
        })
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pianovis-export-");
        Ok(match &self.temp_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        })
    }

    fn render_sequential(
        &self,
        renderer: &FrameRenderer,
        total: usize,
        intermediate: &Path,
        cancel: &CancelToken,
        progress: &mut dyn ProgressReporter,
    ) -> Result<()> {
        let mut sink = self.encoder.create(intermediate, renderer.settings())?;
        let started = Instant::now();
        for frame in 0..total {
            cancel.check()?;
            sink.write_frame(&renderer.render(frame as f64))?;
            let label = format!("Exporting frame {} of {total}", frame + 1);
            let line = ProgressLine::new(&label, frame + 1, total, started.elapsed());
            progress.report(&line.to_string());
        }
        sink.finish()?;
        progress.finish(&format!("Exported {total} frames"));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn render_parallel(
        &self,
        session: &VideoSession,
        total: usize,
        workers: usize,
        work: &TempDir,
        intermediate: &Path,
        cancel: &CancelToken,
        progress: &mut dyn ProgressReporter,
    ) -> Result<Vec<usize>> {
        let frames_dir = work.path().join(FRAMES_DIR);
        fs::create_dir(&frames_dir)?;
        let snapshot = work.path().join(SNAPSHOT_NAME);
        session.snapshot()?.write_json(&snapshot)?;

        let mut pool = WorkerPool::default();
        for (index, frames) in partition_frames(total, workers).into_iter().enumerate() {
            cancel.check()?;
            let job = WorkerJob {
                index,
                snapshot: snapshot.clone(),
                frames,
                output_dir: frames_dir.clone(),
            };
            pool.handles.push(self.launcher.launch(&job)?);
        }

        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                pool.kill_all();
                return Err(PianoVisError::Cancelled);
            }
            let done = count_frames(&frames_dir)?;
            let label = format!("Rendering frames, {done} of {total} finished");
            let line = ProgressLine::new(&label, done, total, started.elapsed());
            progress.report(&line.to_string());
            if !pool.poll()? {
                break;
            }
            std::thread::sleep(self.poll_interval);
        }
        if pool.failures > 0 {
            warn!(failed = pool.failures, "some render workers failed");
        }
        progress.finish(&format!("Rendered frames with {} workers", pool.handles.len()));

        self.encode_frames(&frames_dir, total, session, intermediate, cancel, progress)
    }

    fn encode_frames(
        &self,
        frames_dir: &Path,
        total: usize,
        session: &VideoSession,
        intermediate: &Path,
        cancel: &CancelToken,
        progress: &mut dyn ProgressReporter,
    ) -> Result<Vec<usize>> {
        let mut sink = self.encoder.create(intermediate, session.settings())?;
        let mut missing = Vec::new();
        let started = Instant::now();
        for frame in 0..total {
            cancel.check()?;
            let path = frames_dir.join(frame_file_name(frame));
            if path.is_file() {
                sink.write_frame(&image::open(&path)?.to_rgb8())?;
            } else {
                warn!(frame, "frame missing, skipping");
                missing.push(frame);
            }
            let label = format!("Encoding frame {} of {total}", frame + 1);
            let line = ProgressLine::new(&label, frame + 1, total, started.elapsed());
            progress.report(&line.to_string());
        }
        if missing.len() == total {
            return Err(PianoVisError::Worker("no frames were rendered".into()));
        }
        sink.finish()?;
        progress.finish(&format!("Encoded {} frames", total - missing.len()));
        Ok(missing)
    }

    /// Writes the silent fallback, then the output itself. Returns whether
    /// audio was muxed in.
    fn finish_outputs(
        &self,
        intermediate: &Path,
        audio: Option<&Path>,
        fps: u32,
        output: &Path,
        no_audio: &Path,
    ) -> Result<bool> {
        if let Err(err) = fs::copy(intermediate, no_audio) {
            let _ = fs::remove_file(no_audio);
            return Err(err.into());
        }
        let Some(audio) = audio else {
            if let Err(err) = fs::copy(intermediate, output) {
                let _ = fs::remove_file(output);
                return Err(err.into());
            }
            return Ok(false);
        };
        if let Err(err) = self.muxer.mux(intermediate, audio, fps, output) {
            if output.exists() {
                let _ = fs::remove_file(output);
            }
            warn!(fallback = %no_audio.display(), "muxing failed, silent video kept");
            return Err(match err {
                PianoVisError::Mux(_) => err,
                other => PianoVisError::Mux(other.to_string()),
            });
        }
        Ok(true)
    }
}

/// Running workers. Anything still alive when the pool is dropped is killed.
#[derive(Default)]
struct WorkerPool {
    handles: Vec<Box<dyn WorkerHandle>>,
    exited: Vec<bool>,
    failures: usize,
}

impl WorkerPool {
    /// Reaps finished workers. Returns true while any are still running.
    fn poll(&mut self) -> Result<bool> {
        self.exited.resize(self.handles.len(), false);
        let mut running = false;
        for (handle, exited) in self.handles.iter_mut().zip(self.exited.iter_mut()) {
            if *exited {
                continue;
            }
            match handle.try_wait()? {
                Some(success) => {
                    *exited = true;
                    if !success {
                        self.failures += 1;
                    }
                }
                None => running = true,
            }
        }
        Ok(running)
    }

    fn kill_all(&mut self) {
        for handle in &mut self.handles {
            handle.kill();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.kill_all();
    }
}

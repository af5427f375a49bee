//! Frame-range workers for parallel export.
//!
//! Each worker renders a contiguous frame range into numbered PNG files in a
//! shared scratch directory. The coordinator learns about progress only by
//! counting those files.

use std::{
    ffi::OsStr,
    fs,
    ops::Range,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use image::ImageFormat;
use tracing::{debug, warn};

use super::encode::own_process_group;
use crate::{render::FrameRenderer, session::SessionSnapshot, PianoVisError, Result};

const FRAME_EXTENSION: &str = "png";
const PARTIAL_SUFFIX: &str = "part";

/// Splits `[0, total)` into at most `workers` contiguous, non-overlapping
/// ranges whose lengths differ by at most one.
pub fn partition_frames(total: usize, workers: usize) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let count = workers.clamp(1, total);
    let base = total / count;
    let remainder = total % count;

    let mut ranges = Vec::with_capacity(count);
    let mut start = 0;
    for index in 0..count {
        let len = base + usize::from(index < remainder);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

pub fn frame_file_name(frame: usize) -> String {
    format!("{frame}.{FRAME_EXTENSION}")
}

/// Number of completed frame files in `dir`.
pub fn count_frames(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        if entry?.path().extension() == Some(OsStr::new(FRAME_EXTENSION)) {
            count += 1;
        }
    }
    Ok(count)
}

/// Renders `frames` into `dir`. Each file is written under a temporary name
/// and renamed when complete, so readers never see a partial image.
pub fn render_range(
    renderer: &FrameRenderer,
    frames: Range<usize>,
    dir: &Path,
    should_stop: &dyn Fn() -> bool,
) -> Result<usize> {
    let mut written = 0;
    for frame in frames {
        if should_stop() {
            return Err(PianoVisError::Cancelled);
        }
        let image = renderer.render(frame as f64);
        let path = dir.join(frame_file_name(frame));
        let partial = path.with_extension(format!("{FRAME_EXTENSION}.{PARTIAL_SUFFIX}"));
        image.save_with_format(&partial, ImageFormat::Png)?;
        fs::rename(&partial, &path)?;
        written += 1;
    }
    Ok(written)
}

/// Description of one worker's share of a parallel export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub index: usize,
    pub snapshot: PathBuf,
    pub frames: Range<usize>,
    pub output_dir: PathBuf,
}

impl WorkerJob {
    /// Runs the job in the current process.
    pub fn run(&self, should_stop: &dyn Fn() -> bool) -> Result<usize> {
        let renderer = SessionSnapshot::read_json(&self.snapshot)?.into_renderer()?;
        render_range(&renderer, self.frames.clone(), &self.output_dir, should_stop)
    }
}

/// A running worker.
pub trait WorkerHandle {
    /// `Some(success)` once the worker has exited, `None` while it runs.
    fn try_wait(&mut self) -> Result<Option<bool>>;
    /// Stops the worker and waits for it to go away.
    fn kill(&mut self);
}

/// Starts workers for jobs.
pub trait WorkerLauncher {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerHandle>>;
}

/// Runs each job in a child process: `<program> render-worker ...`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub const SUBCOMMAND: &'static str = "render-worker";

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Re-launches the running executable, which must understand
    /// [`Self::SUBCOMMAND`].
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    fn command(&self, job: &WorkerJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(Self::SUBCOMMAND)
            .arg("--snapshot")
            .arg(&job.snapshot)
            .arg("--start")
            .arg(job.frames.start.to_string())
            .arg("--end")
            .arg(job.frames.end.to_string())
            .arg("--output")
            .arg(&job.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        own_process_group(&mut cmd);
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerHandle>> {
        let child = self.command(job).spawn().map_err(|err| {
            PianoVisError::Worker(format!(
                "failed to start worker {} ({}): {err}",
                job.index,
                self.program.display()
            ))
        })?;
        debug!(worker = job.index, pid = child.id(), frames = ?job.frames, "worker started");
        Ok(Box::new(ProcessHandle {
            index: job.index,
            child,
            exited: false,
        }))
    }
}

struct ProcessHandle {
    index: usize,
    child: Child,
    exited: bool,
}

impl WorkerHandle for ProcessHandle {
    fn try_wait(&mut self) -> Result<Option<bool>> {
        let status = self.child.try_wait()?;
        if let Some(status) = status {
            self.exited = true;
            if !status.success() {
                warn!(worker = self.index, %status, "worker exited unsuccessfully");
            }
        }
        Ok(status.map(|s| s.success()))
    }

    fn kill(&mut self) {
        if !self.exited {
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.exited = true;
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs each job on a thread of the current process. Useful where the host
/// binary has no worker subcommand.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerHandle>> {
        let stop = Arc::new(AtomicBool::new(false));
        let job = job.clone();
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name(format!("render-worker-{}", job.index))
            .spawn(move || job.run(&|| flag.load(Ordering::Relaxed)))?;
        Ok(Box::new(ThreadHandle {
            stop,
            thread: Some(thread),
        }))
    }
}

struct ThreadHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<usize>>>,
}

impl WorkerHandle for ThreadHandle {
    fn try_wait(&mut self) -> Result<Option<bool>> {
        match &self.thread {
            Some(thread) if !thread.is_finished() => Ok(None),
            Some(_) => {
                let outcome = self.thread.take().map(|t| t.join());
                let success = matches!(outcome, Some(Ok(Ok(_))));
                if let Some(Ok(Err(err))) = outcome {
                    warn!(%err, "worker thread failed");
                }
                Ok(Some(success))
            }
            None => Ok(Some(true)),
        }
    }

    fn kill(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

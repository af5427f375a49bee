//! Video encoding and audio muxing through an external `ffmpeg`.

use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
};

use tracing::{debug, info};

use crate::{config::VideoSettings, render::Frame, PianoVisError, Result};

/// Ordered consumer of rendered frames that produces a video file.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    /// Flushes and closes the stream. Dropping a sink without finishing it
    /// abandons the output.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens [`FrameSink`]s for a target path.
pub trait FrameSinkFactory {
    fn create(&self, path: &Path, settings: &VideoSettings) -> Result<Box<dyn FrameSink>>;
}

/// Combines a silent video with an audio track.
pub trait Muxer {
    fn mux(&self, video: &Path, audio: &Path, fps: u32, output: &Path) -> Result<()>;
}

/// x264 constant rate factor used unless overridden.
pub const DEFAULT_CRF: u8 = 18;

/// Puts a child in its own process group. A terminal Ctrl-C then reaches only
/// this process, and children are stopped through cancellation instead of
/// dying mid-write.
pub(crate) fn own_process_group(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Returns true if `program -version` runs successfully.
pub fn ffmpeg_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Spawns one `ffmpeg` per video, fed raw RGB frames on stdin.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    program: PathBuf,
    crf: u8,
}

impl Default for FfmpegEncoderFactory {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegEncoderFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            crf: DEFAULT_CRF,
        }
    }

    /// Quality for libx264, lower is better. ffmpeg accepts 0 to 51.
    pub fn with_crf(mut self, crf: u8) -> Self {
        self.crf = crf;
        self
    }

    fn command(&self, path: &Path, settings: &VideoSettings) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-y", "-nostdin", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{}x{}", settings.width, settings.height))
            .arg("-r")
            .arg(settings.fps.to_string())
            .args(["-i", "pipe:0"])
            // yuv420p needs even dimensions.
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg("-crf")
            .arg(self.crf.to_string())
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        own_process_group(&mut cmd);
        cmd
    }
}

impl FrameSinkFactory for FfmpegEncoderFactory {
    fn create(&self, path: &Path, settings: &VideoSettings) -> Result<Box<dyn FrameSink>> {
        debug!(
            program = %self.program.display(),
            path = %path.display(),
            crf = self.crf,
            "starting encoder"
        );
        let mut child = self.command(path, settings).spawn().map_err(|err| {
            PianoVisError::Encode(format!(
                "failed to start {}: {err}",
                self.program.display()
            ))
        })?;
        let stdin = child.stdin.take();
        Ok(Box::new(FfmpegEncoder {
            child: Some(child),
            stdin,
            width: settings.width,
            height: settings.height,
        }))
    }
}

struct FfmpegEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl FrameSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(PianoVisError::Encode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PianoVisError::Encode("encoder input already closed".into()))?;
        stdin.write_all(frame.as_raw()).map_err(|err| {
            PianoVisError::Encode(format!("failed to pipe frame to ffmpeg: {err}"))
        })
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if !status.success() {
            return Err(PianoVisError::Encode(format!("ffmpeg exited with {status}")));
        }
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Muxes with `ffmpeg`, resampling the audio so it stays in sync.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: PathBuf,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Muxer for FfmpegMuxer {
    fn mux(&self, video: &Path, audio: &Path, fps: u32, output: &Path) -> Result<()> {
        info!(audio = %audio.display(), output = %output.display(), "combining with audio");
        let mut cmd = Command::new(&self.program);
        cmd.args(["-y", "-nostdin", "-loglevel", "error", "-i"])
            .arg(audio)
            .arg("-r")
            .arg(fps.to_string())
            .arg("-i")
            .arg(video)
            .args(["-filter:a", "aresample=async=1", "-c:a", "aac", "-c:v", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        let status = own_process_group(&mut cmd).status().map_err(|err| {
            PianoVisError::Mux(format!("failed to start {}: {err}", self.program.display()))
        })?;
        if !status.success() {
            return Err(PianoVisError::Mux(format!("ffmpeg exited with {status}")));
        }
        Ok(())
    }
}

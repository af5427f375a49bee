use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use tracing::{debug, warn};

/// Delay before audio starts, roughly the time the first frame takes to show.
pub const AUDIO_START_DELAY: Duration = Duration::from_millis(200);

/// Plays an audio file with `ffplay` alongside the preview.
///
/// Playback is never synchronised with the displayed frame; it simply starts
/// after a fixed delay and runs on its own.
#[derive(Debug, Clone)]
pub struct AudioPlayer {
    program: PathBuf,
    delay: Duration,
}

impl Default for AudioPlayer {
    fn default() -> Self {
        Self::new("ffplay", AUDIO_START_DELAY)
    }
}

impl AudioPlayer {
    pub fn new(program: impl Into<PathBuf>, delay: Duration) -> Self {
        Self {
            program: program.into(),
            delay,
        }
    }

    /// Starts playback on a background thread. Failures are logged only.
    /// The player is stopped when the returned guard is dropped.
    pub fn play(&self, path: &Path) -> AudioPlayback {
        let stopped = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(None::<Child>));

        let mut cmd = Command::new(&self.program);
        cmd.args(["-nodisp", "-autoexit", "-loglevel", "quiet"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let delay = self.delay;
        let thread_stopped = Arc::clone(&stopped);
        let thread_child = Arc::clone(&child);
        let spawned = thread::Builder::new()
            .name("preview-audio".into())
            .spawn(move || {
                thread::sleep(delay);
                let Ok(mut slot) = thread_child.lock() else {
                    return;
                };
                if thread_stopped.load(Ordering::SeqCst) {
                    return;
                }
                match cmd.spawn() {
                    Ok(process) => {
                        debug!(pid = process.id(), "audio playback started");
                        *slot = Some(process);
                    }
                    Err(err) => warn!(%err, "audio playback unavailable"),
                }
            });
        if let Err(err) = spawned {
            warn!(%err, "failed to start audio thread");
        }

        AudioPlayback { stopped, child }
    }
}

/// Handle to a running (or pending) audio playback.
#[derive(Debug)]
pub struct AudioPlayback {
    stopped: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
}

impl AudioPlayback {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.child.lock() {
            if let Some(mut process) = slot.take() {
                let _ = process.kill();
                let _ = process.wait();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.child
            .lock()
            .map(|mut slot| match slot.as_mut() {
                Some(process) => matches!(process.try_wait(), Ok(None)),
                None => false,
            })
            .unwrap_or(false)
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

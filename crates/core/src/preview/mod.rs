//! Interactive preview: a fixed-rate loop that renders the current frame on
//! demand and lets the user scrub through the timeline.

mod audio;

pub use audio::{AudioPlayback, AudioPlayer, AUDIO_START_DELAY};

use std::{
    fmt,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use tracing::info;

use crate::{
    render::{Frame, FrameRenderer},
    session::VideoSession,
    timeline::NoteCounts,
    Result,
};

pub const SMALL_STEP: i64 = 100;
pub const LARGE_STEP: i64 = 1000;

const CLOCK_GRANULARITY: Duration = Duration::from_millis(1);

/// User input understood by the preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewInput {
    /// Left arrow.
    StepBack,
    /// Right arrow.
    StepForward,
    /// Down arrow.
    JumpBack,
    /// Up arrow.
    JumpForward,
    TogglePlayback,
    Quit,
}

/// Where preview frames are shown and where input comes from.
pub trait PreviewSurface {
    /// Input received since the last call.
    fn poll(&mut self) -> Result<Vec<PreviewInput>>;
    /// Displays `frame`, scaled to the surface. `stats` is `None` when
    /// metrics are disabled.
    fn present(&mut self, frame: &Frame, stats: Option<&PreviewStats>) -> Result<()>;
}

/// Playback position and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewState {
    frame: usize,
    total_frames: usize,
    playing: bool,
}

impl PreviewState {
    pub fn new(total_frames: usize) -> Self {
        Self {
            frame: 0,
            total_frames,
            playing: true,
        }
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Applies one input. Returns false on quit.
    pub fn apply(&mut self, input: PreviewInput) -> bool {
        match input {
            PreviewInput::StepBack => self.seek(-SMALL_STEP),
            PreviewInput::StepForward => self.seek(SMALL_STEP),
            PreviewInput::JumpBack => self.seek(-LARGE_STEP),
            PreviewInput::JumpForward => self.seek(LARGE_STEP),
            PreviewInput::TogglePlayback => self.playing = !self.playing,
            PreviewInput::Quit => return false,
        }
        true
    }

    /// Moves one frame forward while playing, stopping at the last frame.
    pub fn advance(&mut self) {
        if self.playing {
            self.frame = (self.frame + 1).min(self.last_frame());
        }
    }

    fn seek(&mut self, by: i64) {
        let target = self.frame as i64 + by;
        self.frame = target.clamp(0, self.last_frame() as i64) as usize;
    }

    fn last_frame(&self) -> usize {
        self.total_frames.saturating_sub(1)
    }
}

/// Fixed-rate ticker. Each deadline is exactly one interval after the
/// previous one, so a late tick does not push later ticks back.
#[derive(Debug, Clone)]
pub struct FrameClock {
    interval: Duration,
    next_tick: Instant,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        Self {
            interval,
            next_tick: Instant::now() + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// Waits for the current deadline, then schedules the next one.
    pub fn tick(&mut self) {
        loop {
            let now = Instant::now();
            if now >= self.next_tick {
                break;
            }
            thread::sleep((self.next_tick - now).min(CLOCK_GRANULARITY));
        }
        self.next_tick += self.interval;
    }
}

/// Live metrics shown with the preview.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewStats {
    pub frame: usize,
    pub render_time: Duration,
    /// Frame interval minus render time.
    pub idle_time: Duration,
    /// Measured over the previous iteration.
    pub fps: f64,
    pub notes: NoteCounts,
}

impl fmt::Display for PreviewStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame: {}  Render: {:.2} ms  Idle: {:.2} ms  FPS: {:.1}  Notes: {} played, {} playing, {} to play",
            self.frame,
            self.render_time.as_secs_f64() * 1000.0,
            self.idle_time.as_secs_f64() * 1000.0,
            self.fps,
            self.notes.played,
            self.notes.playing,
            self.notes.to_play,
        )
    }
}

/// The preview loop over a prepared renderer.
pub struct PreviewLoop<'a> {
    renderer: &'a FrameRenderer,
    show_meta: bool,
    audio: Option<PathBuf>,
    player: AudioPlayer,
}

impl<'a> PreviewLoop<'a> {
    pub fn new(renderer: &'a FrameRenderer) -> Self {
        Self {
            renderer,
            show_meta: true,
            audio: None,
            player: AudioPlayer::default(),
        }
    }

    /// Preview of a prepared session, playing its audio if it has any.
    pub fn for_session(session: &'a VideoSession) -> Result<Self> {
        let mut preview = Self::new(session.renderer()?);
        preview.audio = session.audio_path().map(PathBuf::from);
        Ok(preview)
    }

    pub fn show_meta(mut self, show: bool) -> Self {
        self.show_meta = show;
        self
    }

    pub fn with_audio(mut self, path: Option<PathBuf>, player: AudioPlayer) -> Self {
        self.audio = path;
        self.player = player;
        self
    }

    /// Runs until the surface reports [`PreviewInput::Quit`]. Returns the
    /// number of frames presented.
    pub fn run(&self, surface: &mut dyn PreviewSurface) -> Result<usize> {
        let total = self.renderer.timeline().total_frames()?;
        let fps = self.renderer.settings().fps;
        info!(frames = total, fps, "starting preview");

        let mut state = PreviewState::new(total);
        let mut clock = FrameClock::new(fps);
        let _playback = self.audio.as_deref().map(|path| self.player.play(path));

        let mut presented = 0;
        let mut measured_fps = 0.0;
        let mut last_iteration = Instant::now();
        loop {
            clock.tick();
            for input in surface.poll()? {
                if !state.apply(input) {
                    info!(presented, "preview closed");
                    return Ok(presented);
                }
            }

            let frame_index = state.frame() as f64;
            let started = Instant::now();
            let frame = self.renderer.render(frame_index);
            let render_time = started.elapsed();

            let stats = self.show_meta.then(|| PreviewStats {
                frame: state.frame(),
                render_time,
                idle_time: clock.interval().saturating_sub(render_time),
                fps: measured_fps,
                notes: self.renderer.timeline().counts_at(frame_index),
            });
            surface.present(&frame, stats.as_ref())?;
            presented += 1;

            let now = Instant::now();
            let elapsed = now.duration_since(last_iteration).as_secs_f64();
            if elapsed > 0.0 {
                measured_fps = 1.0 / elapsed;
            }
            last_iteration = now;
            state.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RenderOptions, VideoSettings},
        timeline::{Note, NoteTimeline},
    };

    #[test]
    fn seeking_clamps_to_timeline() {
        let mut state = PreviewState::new(250);
        state.apply(PreviewInput::StepBack);
        assert_eq!(state.frame(), 0);
        state.apply(PreviewInput::StepForward);
        state.apply(PreviewInput::StepForward);
        assert_eq!(state.frame(), 200);
        state.apply(PreviewInput::JumpForward);
        assert_eq!(state.frame(), 249);
        state.apply(PreviewInput::JumpBack);
        assert_eq!(state.frame(), 0);
    }

    #[test]
    fn advance_respects_pause_and_end() {
        let mut state = PreviewState::new(3);
        state.advance();
        state.advance();
        state.advance();
        assert_eq!(state.frame(), 2);

        state.apply(PreviewInput::TogglePlayback);
        assert!(!state.is_playing());
        state.apply(PreviewInput::StepBack);
        state.advance();
        assert_eq!(state.frame(), 0);
        assert!(!state.apply(PreviewInput::Quit));
    }

    #[test]
    fn clock_deadlines_do_not_drift() {
        let mut clock = FrameClock::new(500);
        let first = clock.next_tick();
        thread::sleep(Duration::from_millis(7));
        for _ in 0..4 {
            clock.tick();
        }
        assert_eq!(clock.next_tick(), first + clock.interval() * 4);
        assert!(Instant::now() >= first + clock.interval() * 3);
    }

    #[test]
    fn stats_render_as_one_line() {
        let stats = PreviewStats {
            frame: 12,
            render_time: Duration::from_micros(2500),
            idle_time: Duration::from_micros(30_833),
            fps: 29.96,
            notes: NoteCounts {
                played: 4,
                playing: 2,
                to_play: 9,
            },
        };
        assert_eq!(
            stats.to_string(),
            "Frame: 12  Render: 2.50 ms  Idle: 30.83 ms  FPS: 30.0  Notes: 4 played, 2 playing, 9 to play"
        );
    }

    /// Feeds one batch of inputs per poll and records what was shown.
    struct ScriptedSurface {
        script: Vec<Vec<PreviewInput>>,
        shown: Vec<(Frame, Option<PreviewStats>)>,
    }

    impl PreviewSurface for ScriptedSurface {
        fn poll(&mut self) -> Result<Vec<PreviewInput>> {
            if self.script.is_empty() {
                return Ok(vec![PreviewInput::Quit]);
            }
            Ok(self.script.remove(0))
        }

        fn present(&mut self, frame: &Frame, stats: Option<&PreviewStats>) -> Result<()> {
            self.shown.push((frame.clone(), stats.copied()));
            Ok(())
        }
    }

    fn renderer() -> FrameRenderer {
        FrameRenderer::new(
            VideoSettings::new(64, 36, 500, 0.0).unwrap(),
            RenderOptions::default(),
            NoteTimeline::new(vec![
                Note::new(10, 0.0, 150.0),
                Note::new(50, 300.0, 400.0),
            ]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn loop_renders_scrubs_and_quits() {
        let renderer = renderer();
        let mut surface = ScriptedSurface {
            script: vec![
                vec![],
                vec![],
                vec![PreviewInput::StepForward],
                vec![PreviewInput::TogglePlayback],
                vec![],
            ],
            shown: Vec::new(),
        };
        let presented = PreviewLoop::new(&renderer).run(&mut surface).unwrap();
        assert_eq!(presented, 5);

        let frames: Vec<usize> = surface.shown.iter().map(|(_, s)| s.unwrap().frame).collect();
        assert_eq!(frames, vec![0, 1, 102, 103, 103]);
        assert_eq!(surface.shown[0].0, renderer.render(0.0));
        assert_eq!(surface.shown[2].1.unwrap().notes.playing, 1);
    }

    #[test]
    fn metrics_can_be_hidden() {
        let renderer = renderer();
        let mut surface = ScriptedSurface {
            script: vec![vec![]],
            shown: Vec::new(),
        };
        PreviewLoop::new(&renderer)
            .show_meta(false)
            .run(&mut surface)
            .unwrap();
        assert_eq!(surface.shown.len(), 1);
        assert!(surface.shown[0].1.is_none());
    }

    #[test]
    fn empty_timeline_cannot_be_previewed() {
        let renderer = FrameRenderer::new(
            VideoSettings::new(64, 36, 30, 0.0).unwrap(),
            RenderOptions::default(),
            NoteTimeline::default(),
            None,
        )
        .unwrap();
        let mut surface = ScriptedSurface {
            script: Vec::new(),
            shown: Vec::new(),
        };
        assert!(PreviewLoop::new(&renderer).run(&mut surface).is_err());
    }
}

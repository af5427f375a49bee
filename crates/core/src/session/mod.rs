use std::path::{Path, PathBuf};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::{RenderOptions, VideoSettings},
    progress::ProgressReporter,
    render::{Frame, FrameRenderer},
    timeline::NoteTimeline,
    PianoVisError, Result,
};

/// Everything needed to render and export one piano-roll video.
///
/// Lifecycle: construct, add MIDI files (and optionally audio and an overlay),
/// configure, [`prepare`](Self::prepare), then render, export or preview.
#[derive(Debug, Clone)]
pub struct VideoSession {
    settings: VideoSettings,
    midi_paths: Vec<PathBuf>,
    audio_path: Option<PathBuf>,
    overlay_path: Option<PathBuf>,
    options: RenderOptions,
    renderer: Option<FrameRenderer>,
}

impl VideoSession {
    pub fn new(settings: VideoSettings) -> Self {
        Self {
            settings,
            midi_paths: Vec::new(),
            audio_path: None,
            overlay_path: None,
            options: RenderOptions::default(),
            renderer: None,
        }
    }

    pub fn settings(&self) -> &VideoSettings {
        &self.settings
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn midi_paths(&self) -> &[PathBuf] {
        &self.midi_paths
    }

    pub fn audio_path(&self) -> Option<&Path> {
        self.audio_path.as_deref()
    }

    pub fn add_midi(&mut self, path: impl Into<PathBuf>) {
        self.midi_paths.push(path.into());
    }

    pub fn set_audio(&mut self, path: impl Into<PathBuf>) {
        self.audio_path = Some(path.into());
    }

    pub fn set_overlay(&mut self, path: impl Into<PathBuf>) {
        self.overlay_path = Some(path.into());
    }

    /// Sets one option by its flat key. If the session is already prepared,
    /// the renderer is rebuilt so the change takes effect immediately.
    pub fn configure(&mut self, key: &str, raw_value: &str) -> Result<()> {
        let mut options = self.options.clone();
        options.set(key, raw_value)?;
        self.set_options(options)
    }

    pub fn set_options(&mut self, options: RenderOptions) -> Result<()> {
        options.validate()?;
        if let Some(renderer) = &self.renderer {
            let rebuilt = FrameRenderer::new(
                self.settings,
                options.clone(),
                renderer.timeline().clone(),
                load_overlay(self.overlay_path.as_deref())?,
            )?;
            self.renderer = Some(rebuilt);
        }
        self.options = options;
        Ok(())
    }

    /// Parses every MIDI file and builds the renderer.
    pub fn prepare(&mut self, progress: &mut dyn ProgressReporter) -> Result<&FrameRenderer> {
        let timeline = NoteTimeline::parse(
            &self.midi_paths,
            self.settings.fps as f64,
            self.settings.offset_frames as f64,
            progress,
        )?;
        info!(
            midis = self.midi_paths.len(),
            notes = timeline.len(),
            "session prepared"
        );
        let renderer = FrameRenderer::new(
            self.settings,
            self.options.clone(),
            timeline,
            load_overlay(self.overlay_path.as_deref())?,
        )?;
        let renderer: &FrameRenderer = self.renderer.insert(renderer);
        Ok(renderer)
    }

    pub fn is_prepared(&self) -> bool {
        self.renderer.is_some()
    }

    pub fn renderer(&self) -> Result<&FrameRenderer> {
        self.renderer
            .as_ref()
            .ok_or_else(|| PianoVisError::msg("session has not been prepared"))
    }

    pub fn render(&self, frame: f64) -> Result<Frame> {
        Ok(self.renderer()?.render(frame))
    }

    pub fn total_frames(&self) -> Result<usize> {
        self.renderer()?.timeline().total_frames()
    }

    /// Read-only copy of the prepared state, for handing to render workers.
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        let renderer = self.renderer()?;
        Ok(SessionSnapshot {
            settings: self.settings,
            options: self.options.clone(),
            timeline: renderer.timeline().clone(),
            overlay_path: self.overlay_path.clone(),
        })
    }
}

/// Serializable prepared session. Workers rebuild a renderer from it without
/// re-parsing MIDI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub settings: VideoSettings,
    pub options: RenderOptions,
    pub timeline: NoteTimeline,
    pub overlay_path: Option<PathBuf>,
}

impl SessionSnapshot {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        Ok(serde_json::from_reader(file)?)
    }

    pub fn into_renderer(self) -> Result<FrameRenderer> {
        let overlay = load_overlay(self.overlay_path.as_deref())?;
        FrameRenderer::new(self.settings, self.options, self.timeline, overlay)
    }
}

fn load_overlay(path: Option<&Path>) -> Result<Option<RgbaImage>> {
    path.map(|path| Ok(image::open(path)?.to_rgba8())).transpose()
}

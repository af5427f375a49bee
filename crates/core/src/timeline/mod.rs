//! Conversion of MIDI event streams into frame-based note intervals.

use std::path::{Path, PathBuf};

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    keys::{KEY_COUNT, LOWEST_MIDI_NOTE},
    progress::ProgressReporter,
    PianoVisError, Result,
};

/// Microseconds per quarter note until the first tempo event (120 bpm).
pub const DEFAULT_TEMPO: u32 = 500_000;

/// Frames appended after the last note so the final release is visible.
pub const TAIL_FRAMES: usize = 30;

/// A sounded key between two frame positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub key: usize,
    pub start_frame: f64,
    pub end_frame: f64,
}

impl Note {
    pub fn new(key: usize, start_frame: f64, end_frame: f64) -> Self {
        Self {
            key,
            start_frame,
            end_frame,
        }
    }

    pub fn is_playing_at(&self, frame: f64) -> bool {
        self.start_frame <= frame && frame <= self.end_frame
    }
}

/// How ticks relate to wall-clock time for one file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickTiming {
    /// Ticks per quarter note; real time depends on the current tempo.
    Metrical(u16),
    /// Fixed ticks per second (SMPTE timing); tempo events are ignored.
    Timecode(f64),
}

/// Minimal event vocabulary the timeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineEvent {
    /// New tempo in microseconds per quarter note.
    Tempo(u32),
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    /// Anything else still advances time.
    Other,
}

/// Event preceded by the ticks elapsed since the previous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub delta_ticks: u32,
    pub event: TimelineEvent,
}

impl TimedEvent {
    pub fn new(delta_ticks: u32, event: TimelineEvent) -> Self {
        Self { delta_ticks, event }
    }
}

/// Counts of notes relative to a frame, as shown by the preview metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoteCounts {
    pub played: usize,
    pub playing: usize,
    pub to_play: usize,
}

/// All note intervals of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteTimeline {
    notes: Vec<Note>,
}

impl NoteTimeline {
    pub fn new(notes: Vec<Note>) -> Self {
        Self { notes }
    }

    /// Parses every file in order and concatenates their notes. Any file that
    /// fails to parse aborts the whole operation.
    pub fn parse<P: AsRef<Path>>(
        paths: &[P],
        fps: f64,
        offset_frames: f64,
        progress: &mut dyn ProgressReporter,
    ) -> Result<Self> {
        let total = paths.len();
        let mut notes = Vec::new();
        for (index, path) in paths.iter().enumerate() {
            progress.report(&format!("Parsing midi {} of {}", index + 1, total));
            let parsed = parse_file(path.as_ref(), fps, offset_frames);
            progress.clear();
            notes.extend(parsed?);
        }
        progress.finish(&format!("Finished parsing {total} midis."));
        Ok(Self { notes })
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Number of frames needed to show every note plus a short tail.
    ///
    /// Fails with [`PianoVisError::EmptyTimeline`] when there are no notes or
    /// when a negative offset pushes every note so far back that not a
    /// single frame is left.
    pub fn total_frames(&self) -> Result<usize> {
        let max_end = self
            .notes
            .iter()
            .map(|note| note.end_frame)
            .fold(None, |max: Option<f64>, end| {
                Some(max.map_or(end, |m| m.max(end)))
            })
            .ok_or(PianoVisError::EmptyTimeline)?;
        let frames = max_end.floor() + TAIL_FRAMES as f64;
        if frames < 1.0 {
            return Err(PianoVisError::EmptyTimeline);
        }
        Ok(frames as usize)
    }

    /// Keys sounding at `frame`, as a membership table indexed by key.
    pub fn playing_keys(&self, frame: f64) -> [bool; KEY_COUNT] {
        let mut playing = [false; KEY_COUNT];
        for note in self.notes.iter().filter(|n| n.is_playing_at(frame)) {
            if let Some(slot) = playing.get_mut(note.key) {
                *slot = true;
            }
        }
        playing
    }

    pub fn counts_at(&self, frame: f64) -> NoteCounts {
        let mut counts = NoteCounts::default();
        for note in &self.notes {
            if note.end_frame < frame {
                counts.played += 1;
            } else if note.start_frame > frame {
                counts.to_play += 1;
            } else {
                counts.playing += 1;
            }
        }
        counts
    }
}

/// Reads and parses one MIDI file.
pub fn parse_file(path: &Path, fps: f64, offset_frames: f64) -> Result<Vec<Note>> {
    let data = std::fs::read(path).map_err(|err| PianoVisError::MidiParse {
        path: path.to_path_buf(),
        source: Box::new(err),
    })?;
    parse_bytes(path, &data, fps, offset_frames)
}

/// Parses an in-memory MIDI file. `path` is only used for error messages.
pub fn parse_bytes(path: &Path, data: &[u8], fps: f64, offset_frames: f64) -> Result<Vec<Note>> {
    let smf = Smf::parse(data).map_err(|err| PianoVisError::MidiParse {
        path: path.to_path_buf(),
        source: Box::new(err),
    })?;

    let timing = match smf.header.timing {
        Timing::Metrical(tpb) if tpb.as_int() > 0 => TickTiming::Metrical(tpb.as_int()),
        Timing::Metrical(_) => return Err(PianoVisError::UnsupportedTiming(PathBuf::from(path))),
        Timing::Timecode(smpte, subframes) => {
            let ticks_per_second = smpte.as_f32() as f64 * subframes as f64;
            if ticks_per_second <= 0.0 {
                return Err(PianoVisError::UnsupportedTiming(PathBuf::from(path)));
            }
            TickTiming::Timecode(ticks_per_second)
        }
    };

    debug!(
        path = %path.display(),
        tracks = smf.tracks.len(),
        ?timing,
        "parsing midi"
    );

    let events = merge_tracks(&smf);
    let notes = notes_from_events(events, timing, fps, offset_frames);
    debug!(path = %path.display(), notes = notes.len(), "parsed midi");
    Ok(notes)
}

/// Flattens all tracks into one stream ordered by absolute tick. Events on
/// the same tick keep their track order.
fn merge_tracks(smf: &Smf<'_>) -> Vec<TimedEvent> {
    let mut absolute: Vec<(u64, TimelineEvent)> = Vec::new();
    for track in &smf.tracks {
        let mut tick = 0u64;
        for event in track {
            tick += u64::from(event.delta.as_int());
            absolute.push((tick, convert(&event.kind)));
        }
    }
    absolute.sort_by_key(|(tick, _)| *tick);

    let mut previous = 0u64;
    absolute
        .into_iter()
        .map(|(tick, event)| {
            let delta = (tick - previous).min(u64::from(u32::MAX)) as u32;
            previous = tick;
            TimedEvent::new(delta, event)
        })
        .collect()
}

fn convert(kind: &TrackEventKind<'_>) -> TimelineEvent {
    match kind {
        TrackEventKind::Midi { message, .. } => match *message {
            MidiMessage::NoteOn { key, vel } => TimelineEvent::NoteOn {
                note: key.as_int(),
                velocity: vel.as_int(),
            },
            MidiMessage::NoteOff { key, .. } => TimelineEvent::NoteOff { note: key.as_int() },
            _ => TimelineEvent::Other,
        },
        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => TimelineEvent::Tempo(tempo.as_int()),
        _ => TimelineEvent::Other,
    }
}

/// Walks a time-ordered event stream and pairs presses with releases.
///
/// A press on a key that is already held replaces the earlier start. A
/// release with no recorded press is dropped.
pub fn notes_from_events(
    events: impl IntoIterator<Item = TimedEvent>,
    timing: TickTiming,
    fps: f64,
    offset_frames: f64,
) -> Vec<Note> {
    let mut notes = Vec::new();
    let mut starts: [Option<f64>; KEY_COUNT] = [None; KEY_COUNT];
    let mut tempo = DEFAULT_TEMPO;
    let mut frame = offset_frames;

    for TimedEvent { delta_ticks, event } in events {
        let seconds = match timing {
            TickTiming::Metrical(tpb) => {
                delta_ticks as f64 / tpb as f64 * tempo as f64 / 1_000_000.0
            }
            TickTiming::Timecode(ticks_per_second) => delta_ticks as f64 / ticks_per_second,
        };
        frame += seconds * fps;

        match event {
            TimelineEvent::Tempo(next) => tempo = next,
            TimelineEvent::NoteOn { note, velocity } if velocity > 0 => {
                if let Some(key) = key_index(note) {
                    starts[key] = Some(frame);
                }
            }
            TimelineEvent::NoteOn { note, .. } | TimelineEvent::NoteOff { note } => {
                if let Some(key) = key_index(note) {
                    if let Some(start_frame) = starts[key].take() {
                        notes.push(Note::new(key, start_frame, frame));
                    }
                }
            }
            TimelineEvent::Other => {}
        }
    }
    notes
}

fn key_index(note: u8) -> Option<usize> {
    let key = usize::from(note.checked_sub(LOWEST_MIDI_NOTE)?);
    if key < KEY_COUNT {
        Some(key)
    } else {
        debug!(note, "ignoring note outside the piano range");
        None
    }
}

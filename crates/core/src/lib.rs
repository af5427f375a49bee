//! Core library for the PianoVis piano-roll visualiser.
//!
//! Each module owns one stage of the pipeline: key geometry, key colouring,
//! MIDI note timelines, frame rendering, and the two consumers of rendered
//! frames (offline export to video and the interactive preview). A
//! [`VideoSession`] ties them together.

pub mod color;
pub mod config;
pub mod error;
pub mod export;
pub mod keys;
pub mod preview;
pub mod progress;
pub mod render;
pub mod session;
pub mod timeline;

pub use color::{ColorGradient, ColorGrading, ColorStop, Hsv, Rgb};
pub use config::{OptionKey, RenderOptions, VideoSettings};
pub use error::{PianoVisError, Result};
pub use export::{CancelToken, ExportEngine, ExportMode, ExportRequest, ExportSummary};
pub use keys::{KeyGeometry, KeyLayout, KEY_COUNT};
pub use preview::{PreviewInput, PreviewLoop, PreviewStats, PreviewSurface};
pub use progress::{ProgressReporter, SilentProgress, TerminalProgress};
pub use render::{Frame, FrameRenderer};
pub use session::{SessionSnapshot, VideoSession};
pub use timeline::{Note, NoteTimeline};

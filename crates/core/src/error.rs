use std::path::PathBuf;

/// Result alias that carries the custom [`PianoVisError`] type.
pub type Result<T> = std::result::Result<T, PianoVisError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum PianoVisError {
    /// The export target does not carry the required container extension.
    #[error("output path `{}` must end with .mp4", .0.display())]
    InvalidPath(PathBuf),
    /// A MIDI file could not be read or decoded. Aborts the whole parse.
    #[error("failed to parse midi `{}`: {source}", path.display())]
    MidiParse {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("midi `{}` uses an unsupported timing format", .0.display())]
    UnsupportedTiming(PathBuf),
    /// Parsing produced zero notes, or every note ends before the first
    /// frame, so there is nothing to render.
    #[error("timeline contains no notes to render")]
    EmptyTimeline,
    /// The color-stop table is empty, unsorted or otherwise malformed.
    #[error("gradient lookup failed: {0}")]
    GradientLookup(String),
    #[error("configuration error: {0}")]
    Config(String),
    /// The export was interrupted by the user. Temporary files are gone.
    #[error("export cancelled")]
    Cancelled,
    #[error("video encoding failed: {0}")]
    Encode(String),
    /// The external audio/video mux step failed. The no-audio fallback is kept.
    #[error("audio mux failed: {0}")]
    Mux(String),
    #[error("render worker failed: {0}")]
    Worker(String),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form message for front ends that have no better category.
    #[error("{0}")]
    Message(String),
}

impl PianoVisError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns true for user-initiated interruption, which callers usually
    /// report differently from genuine failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<&str> for PianoVisError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for PianoVisError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use pianovis_core::{
    export::{ffmpeg_available, FfmpegEncoderFactory, ProcessLauncher, WorkerJob, DEFAULT_CRF},
    CancelToken, ExportEngine, ExportMode, ExportRequest, PianoVisError, RenderOptions,
    TerminalProgress, VideoSession, VideoSettings,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "window")]
mod window;

fn main() -> pianovis_core::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Preview {
            session,
            window: size,
            no_meta,
        } => {
            init_tracing("info");
            run_preview(&session, size, !no_meta)
        }
        Commands::Export {
            session,
            output,
            parallel,
            workers,
            crf,
            notify,
        } => {
            init_tracing("info");
            let options = ExportOptions {
                parallel,
                workers,
                crf,
                notify,
            };
            run_export(&session, output, options)
        }
        Commands::RenderWorker {
            snapshot,
            start,
            end,
            output,
        } => {
            init_tracing("warn");
            run_worker(snapshot, start, end, output)
        }
    }
}

fn build_session(args: &SessionArgs) -> pianovis_core::Result<VideoSession> {
    let settings = VideoSettings::new(
        args.resolution.width,
        args.resolution.height,
        args.fps,
        args.offset,
    )?;
    let mut session = VideoSession::new(settings);
    for midi in &args.midi {
        session.add_midi(midi);
    }
    if let Some(audio) = &args.audio {
        session.set_audio(audio);
    }
    if let Some(overlay) = &args.overlay {
        session.set_overlay(overlay);
    }

    let mut options = match &args.config {
        Some(path) => RenderOptions::from_json_file(path)?,
        None => RenderOptions::default(),
    };
    for assignment in &args.set {
        options.apply_assignment(assignment)?;
    }
    session.set_options(options)?;

    session.prepare(&mut TerminalProgress::stderr())?;
    Ok(session)
}

#[cfg(feature = "window")]
fn run_preview(
    args: &SessionArgs,
    size: Resolution,
    show_meta: bool,
) -> pianovis_core::Result<()> {
    use pianovis_core::PreviewLoop;

    let session = build_session(args)?;
    let mut surface = window::SdlSurface::open(size.width, size.height)?;
    PreviewLoop::for_session(&session)?
        .show_meta(show_meta)
        .run(&mut surface)?;
    Ok(())
}

#[cfg(not(feature = "window"))]
fn run_preview(
    _args: &SessionArgs,
    _size: Resolution,
    _show_meta: bool,
) -> pianovis_core::Result<()> {
    Err(PianoVisError::msg(
        "preview needs a window; rebuild with `--features window`",
    ))
}

/// Export flags that do not describe the session itself.
#[derive(Debug, Clone, Copy)]
struct ExportOptions {
    parallel: bool,
    workers: Option<usize>,
    crf: u8,
    notify: bool,
}

fn run_export(
    args: &SessionArgs,
    output: PathBuf,
    options: ExportOptions,
) -> pianovis_core::Result<()> {
    if !ffmpeg_available(Path::new("ffmpeg")) {
        return Err(PianoVisError::msg("ffmpeg was not found on PATH"));
    }
    let session = build_session(args)?;

    let mode = if options.parallel {
        let workers = options.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        });
        ExportMode::Parallel { workers }
    } else {
        ExportMode::Sequential
    };
    let mut request = ExportRequest::new(output, mode);
    request.notify = options.notify;

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || handler.cancel())
        .map_err(|err| PianoVisError::msg(format!("failed to install Ctrl-C handler: {err}")))?;

    let engine = ExportEngine::new(ProcessLauncher::current_exe()?)
        .with_encoder(FfmpegEncoderFactory::default().with_crf(options.crf));
    let summary = engine.export(&session, &request, &cancel, &mut TerminalProgress::stderr())?;
    if !summary.missing_frames.is_empty() {
        warn!(missing = summary.missing_frames.len(), "some frames were skipped");
    }
    info!(
        output = %summary.output.display(),
        no_audio = %summary.no_audio.display(),
        frames = summary.frames,
        with_audio = summary.with_audio,
        "export complete"
    );
    Ok(())
}

fn run_worker(
    snapshot: PathBuf,
    start: usize,
    end: usize,
    output: PathBuf,
) -> pianovis_core::Result<()> {
    let job = WorkerJob {
        index: 0,
        snapshot,
        frames: start..end,
        output_dir: output,
    };
    job.run(&|| false)?;
    Ok(())
}

fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resolution {
    width: u32,
    height: u32,
}

fn parse_resolution(raw: &str) -> Result<Resolution, String> {
    let (width, height) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{raw}`"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|err| format!("invalid dimension `{v}`: {err}"))
    };
    Ok(Resolution {
        width: parse(width)?,
        height: parse(height)?,
    })
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Piano-roll MIDI visualiser", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Inputs and settings shared by preview and export.
#[derive(Args, Debug)]
struct SessionArgs {
    /// MIDI file to visualise. Repeat to combine several files.
    #[arg(short, long = "midi", required = true)]
    midi: Vec<PathBuf>,
    /// Audio track to play or mux into the video.
    #[arg(short, long)]
    audio: Option<PathBuf>,
    /// Image drawn in the bottom quarter of every frame.
    #[arg(long)]
    overlay: Option<PathBuf>,
    /// Video resolution.
    #[arg(short, long, default_value = "1920x1080", value_parser = parse_resolution)]
    resolution: Resolution,
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Frames of lead-in before the first MIDI event.
    #[arg(long, default_value_t = 0.0)]
    offset: f32,
    /// JSON file with render options.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Overrides one option, e.g. `--set blocks.speed=240`. Values are JSON.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play the animation in a window. Arrows scrub, space pauses.
    Preview {
        #[command(flatten)]
        session: SessionArgs,
        /// Window size.
        #[arg(long, default_value = "1600x900", value_parser = parse_resolution)]
        window: Resolution,
        /// Hide frame timing and note counts.
        #[arg(long)]
        no_meta: bool,
    },
    /// Render the animation to an .mp4 file.
    Export {
        #[command(flatten)]
        session: SessionArgs,
        /// Output video path, must end in .mp4.
        output: PathBuf,
        /// Render frames in several worker processes.
        #[arg(long)]
        parallel: bool,
        /// Number of workers. Defaults to the number of CPUs.
        #[arg(long, requires = "parallel")]
        workers: Option<usize>,
        /// x264 quality, 0 (lossless) to 51. Lower is better and larger.
        #[arg(
            long,
            default_value_t = DEFAULT_CRF,
            value_parser = clap::value_parser!(u8).range(0..=51)
        )]
        crf: u8,
        /// Send a desktop notification when done.
        #[arg(long)]
        notify: bool,
    },
    /// Render a frame range from a session snapshot. Used by parallel export.
    #[command(hide = true)]
    RenderWorker {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        start: usize,
        #[arg(long)]
        end: usize,
        #[arg(long)]
        output: PathBuf,
    },
}

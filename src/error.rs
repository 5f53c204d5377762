use std::path::PathBuf;
use thiserror::Error;

/// Metadata could not be extracted for one clip. Never fatal to a run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    #[error("clip not found: {0}")]
    NotFound(PathBuf),
    #[error("no probe tool available (ffprobe and ffmpeg both missing)")]
    NoTool,
    #[error("failed to run {tool}: {detail}")]
    Spawn { tool: &'static str, detail: String },
    #[error("{tool} exited with an error: {detail}")]
    ToolFailed { tool: &'static str, detail: String },
    #[error("unparseable probe output: {0}")]
    Parse(String),
    #[error("no video stream in {0}")]
    NoVideoStream(PathBuf),
    #[error("missing duration for {0}")]
    MissingDuration(PathBuf),
    /// The run was cancelled mid-probe. Never cached; the clip stays pending.
    #[error("probe cancelled")]
    Cancelled,
}

/// One encoder attempt failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EncodeError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(String),
    #[error("encoder exited with {status}: {stderr_tail}")]
    Exit { status: String, stderr_tail: String },
    #[error("encoding cancelled")]
    Cancelled,
}

/// Filesystem failures scoped to a single operation.
#[derive(Debug, Error)]
#[error("{op} {path}: {source}")]
pub struct IoError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl IoError {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Internal invariant violations. These surface to the caller as-is.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FatalError {
    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),
    #[error("batch {0} has no clips")]
    EmptyBatch(usize),
    #[error("batch {batch} references unresolved clip {path}")]
    UnresolvedClip { batch: usize, path: PathBuf },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Encode(EncodeError::Cancelled) | Error::Probe(ProbeError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

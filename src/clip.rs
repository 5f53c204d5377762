use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_vertical(self) -> bool {
        self.height > self.width
    }

    pub fn aspect(self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What the resolver learned about a clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipMeta {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

impl ClipMeta {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProbeStatus {
    Pending,
    Resolved(ClipMeta),
    Failed(String),
}

/// One input clip. `index` is its position in the caller's list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub index: usize,
    pub path: PathBuf,
    pub status: ProbeStatus,
}

impl Clip {
    pub fn pending(index: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
            status: ProbeStatus::Pending,
        }
    }

    pub fn resolved(index: usize, path: impl Into<PathBuf>, meta: ClipMeta) -> Self {
        Self {
            index,
            path: path.into(),
            status: ProbeStatus::Resolved(meta),
        }
    }

    pub fn meta(&self) -> Option<&ClipMeta> {
        match &self.status {
            ProbeStatus::Resolved(meta) => Some(meta),
            _ => None,
        }
    }

    /// Duration used for scheduling. Pending clips count as zero.
    pub fn scheduling_duration(&self) -> f64 {
        self.meta().map(|m| m.duration_seconds).unwrap_or(0.0)
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.meta().map(ClipMeta::resolution)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ProbeStatus::Failed(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, ProbeStatus::Pending)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

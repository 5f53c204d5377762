//! Clip metadata resolution.
//!
//! Two strategies sit behind [`ProbeStrategy`]: structured JSON from
//! `ffprobe`, and a text fallback that scrapes `ffmpeg -i` diagnostics when
//! `ffprobe` is missing or fails. Results land in a [`MetadataCache`] that
//! each path is written to at most once.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock, RwLock};
use std::thread::JoinHandle;

use crate::clip::{Clip, ClipMeta, ProbeStatus};
use crate::error::ProbeError;
use crate::ffmpeg::{run_captured, CaptureError, Captured};
use crate::runner::CancelToken;
use crate::util::Tools;

pub trait ProbeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Must return [`ProbeError::Cancelled`] promptly once `cancel` fires,
    /// killing any child process it started.
    fn probe(&self, path: &Path, cancel: &CancelToken) -> Result<ClipMeta, ProbeError>;
}

fn capture(tool: &'static str, cmd: Command, cancel: &CancelToken) -> Result<Captured, ProbeError> {
    run_captured(cmd, cancel).map_err(|e| match e {
        CaptureError::Cancelled => ProbeError::Cancelled,
        CaptureError::Spawn(e) => ProbeError::Spawn {
            tool,
            detail: e.to_string(),
        },
    })
}

pub struct StructuredProbe {
    ffprobe: PathBuf,
    single_thread: bool,
}

impl StructuredProbe {
    pub fn new(ffprobe: impl Into<PathBuf>, single_thread: bool) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            single_thread,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeDoc {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl ProbeStrategy for StructuredProbe {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    fn probe(&self, path: &Path, cancel: &CancelToken) -> Result<ClipMeta, ProbeError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.arg("-v").arg("quiet").arg("-print_format").arg("json");
        if self.single_thread {
            cmd.arg("-threads").arg("1");
        }
        cmd.arg("-show_format").arg("-show_streams").arg(path);
        let out = capture("ffprobe", cmd, cancel)?;
        if !out.status.success() {
            return Err(ProbeError::ToolFailed {
                tool: "ffprobe",
                detail: format!("{} {}", out.status, stderr_tail(&out.stderr)),
            });
        }
        parse_ffprobe_json(path, &out.stdout)
    }
}

fn parse_ffprobe_json(path: &Path, raw: &[u8]) -> Result<ClipMeta, ProbeError> {
    let doc: ProbeDoc =
        serde_json::from_slice(raw).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let video = doc
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;
    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(ProbeError::NoVideoStream(path.to_path_buf())),
    };
    let has_audio = doc
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let duration_seconds = doc
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .or_else(|| {
            video
                .duration
                .as_deref()
                .and_then(|d| d.trim().parse::<f64>().ok())
        })
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| ProbeError::MissingDuration(path.to_path_buf()))?;

    Ok(ClipMeta {
        duration_seconds,
        width,
        height,
        has_audio,
    })
}

pub struct DiagnosticTextFallback {
    ffmpeg: PathBuf,
}

impl DiagnosticTextFallback {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl ProbeStrategy for DiagnosticTextFallback {
    fn name(&self) -> &'static str {
        "ffmpeg-diagnostics"
    }

    fn probe(&self, path: &Path, cancel: &CancelToken) -> Result<ClipMeta, ProbeError> {
        // ffmpeg exits non-zero without an output file; the banner is still on stderr.
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner").arg("-i").arg(path);
        let out = capture("ffmpeg", cmd, cancel)?;
        parse_diagnostic_text(path, &String::from_utf8_lossy(&out.stderr))
    }
}

struct DiagnosticPatterns {
    duration: Regex,
    video: Regex,
    audio: Regex,
}

fn patterns() -> &'static DiagnosticPatterns {
    static PATTERNS: OnceLock<DiagnosticPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| DiagnosticPatterns {
        duration: Regex::new(r"Duration:\s(\d+):(\d+):(\d+(?:\.\d+)?)").expect("duration pattern"),
        video: Regex::new(r"Stream #.*Video:.*?\s(\d{2,5})x(\d{2,5})").expect("video pattern"),
        audio: Regex::new(r"Stream #.*Audio:").expect("audio pattern"),
    })
}

fn parse_diagnostic_text(path: &Path, text: &str) -> Result<ClipMeta, ProbeError> {
    let p = patterns();

    let caps = p
        .duration
        .captures(text)
        .ok_or_else(|| ProbeError::MissingDuration(path.to_path_buf()))?;
    let field = |i: usize| -> Result<f64, ProbeError> {
        caps[i]
            .parse::<f64>()
            .map_err(|e| ProbeError::Parse(format!("duration field {}: {}", &caps[i], e)))
    };
    let duration_seconds = field(1)? * 3600.0 + field(2)? * 60.0 + field(3)?;

    let caps = p
        .video
        .captures(text)
        .ok_or_else(|| ProbeError::NoVideoStream(path.to_path_buf()))?;
    let width = caps[1]
        .parse::<u32>()
        .map_err(|e| ProbeError::Parse(e.to_string()))?;
    let height = caps[2]
        .parse::<u32>()
        .map_err(|e| ProbeError::Parse(e.to_string()))?;

    Ok(ClipMeta {
        duration_seconds,
        width,
        height,
        has_audio: p.audio.is_match(text),
    })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let mut tail: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .rev()
        .take(4)
        .collect();
    tail.reverse();
    tail.join(" | ")
}

/// Run-scoped metadata cache. Each path is published once; later
/// publications for the same path are ignored.
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<PathBuf, Result<ClipMeta, ProbeError>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call performed the write.
    pub fn publish(&self, path: &Path, result: Result<ClipMeta, ProbeError>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if entries.contains_key(path) {
            return false;
        }
        entries.insert(path.to_path_buf(), result);
        true
    }

    pub fn get(&self, path: &Path) -> Option<Result<ClipMeta, ProbeError>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(path).cloned()
    }

    pub fn status(&self, path: &Path) -> ProbeStatus {
        match self.get(path) {
            None => ProbeStatus::Pending,
            Some(Ok(meta)) => ProbeStatus::Resolved(meta),
            Some(Err(err)) => ProbeStatus::Failed(err.to_string()),
        }
    }

    /// Current view of `paths` as clips, in order.
    pub fn clips(&self, paths: &[PathBuf]) -> Vec<Clip> {
        paths
            .iter()
            .enumerate()
            .map(|(index, path)| Clip {
                index,
                path: path.clone(),
                status: self.status(path),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves clips through an ordered list of strategies and caches the
/// outcome.
#[derive(Clone)]
pub struct MetadataResolver {
    strategies: Arc<Vec<Box<dyn ProbeStrategy>>>,
    cache: Arc<MetadataCache>,
}

impl MetadataResolver {
    pub fn new(strategies: Vec<Box<dyn ProbeStrategy>>, cache: Arc<MetadataCache>) -> Self {
        Self {
            strategies: Arc::new(strategies),
            cache,
        }
    }

    /// Picks strategies by tool availability: ffprobe first when present,
    /// then the ffmpeg diagnostic scrape.
    pub fn from_tools(tools: &Tools, single_thread: bool, cache: Arc<MetadataCache>) -> Self {
        let mut strategies: Vec<Box<dyn ProbeStrategy>> = vec![];
        if let Some(ffprobe) = &tools.ffprobe {
            strategies.push(Box::new(StructuredProbe::new(ffprobe, single_thread)));
        }
        if let Some(ffmpeg) = &tools.ffmpeg {
            strategies.push(Box::new(DiagnosticTextFallback::new(ffmpeg)));
        }
        Self::new(strategies, cache)
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Blocking resolution. Cached results are returned without probing.
    pub fn resolve(&self, path: &Path) -> Result<ClipMeta, ProbeError> {
        self.resolve_with(path, &CancelToken::new())
    }

    /// [`resolve`](Self::resolve) under a cancel token. A cancelled probe
    /// is not cached, so the clip stays [`ProbeStatus::Pending`].
    pub fn resolve_with(&self, path: &Path, cancel: &CancelToken) -> Result<ClipMeta, ProbeError> {
        if let Some(cached) = self.cache.get(path) {
            return cached;
        }
        let result = self.probe_uncached(path, cancel);
        if result == Err(ProbeError::Cancelled) {
            return result;
        }
        self.cache.publish(path, result);
        // Another worker may have won the race; the cache is authoritative.
        self.cache.get(path).unwrap_or_else(|| Err(ProbeError::NoTool))
    }

    /// Resolves on a background thread.
    pub fn resolve_async(&self, path: PathBuf) -> JoinHandle<Result<ClipMeta, ProbeError>> {
        let resolver = self.clone();
        std::thread::spawn(move || resolver.resolve(&path))
    }

    fn probe_uncached(&self, path: &Path, cancel: &CancelToken) -> Result<ClipMeta, ProbeError> {
        if !path.is_file() {
            return Err(ProbeError::NotFound(path.to_path_buf()));
        }
        let mut last_err = ProbeError::NoTool;
        for strategy in self.strategies.iter() {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            match strategy.probe(path, cancel) {
                Ok(meta) => {
                    tracing::debug!(
                        path = %path.display(),
                        strategy = strategy.name(),
                        duration = meta.duration_seconds,
                        width = meta.width,
                        height = meta.height,
                        "clip resolved"
                    );
                    return Ok(meta);
                }
                Err(ProbeError::Cancelled) => return Err(ProbeError::Cancelled),
                Err(err) => {
                    tracing::debug!(
                        path = %path.display(),
                        strategy = strategy.name(),
                        error = %err,
                        "probe strategy failed"
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

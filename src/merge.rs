//! Per-batch merge: fast copy or transcode, written atomically.
//!
//! Every strategy writes into a hidden partial file next to the final
//! output and renames it into place only on success. Transcodes go through
//! a bounded retry chain: hardware encoder (when available), one software
//! retry, then the per-clip internal fallback when the tier allows it.

use filetime::FileTime;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::canvas::fit_geometry;
use crate::clip::{Clip, Resolution};
use crate::crashlog::{CrashKind, CrashLog, CrashRecord};
use crate::error::{EncodeError, Error, FatalError, IoError};
use crate::ffmpeg::{EncodeInput, EncodeJob, EncodeSettings, MediaBackend, VideoEncoder};
use crate::planner::Batch;
use crate::runner::CancelToken;
use crate::tier::TierTuning;
use crate::util::{self, OutputNaming};

const COPY_BUF_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    FastCopy,
    Transcode,
    /// Transcoded in `blocks` groups, then joined by stream copy.
    Staged { blocks: usize },
}

impl MergeStrategy {
    pub fn label(self) -> String {
        match self {
            MergeStrategy::FastCopy => "fast-copy".to_string(),
            MergeStrategy::Transcode => "transcode".to_string(),
            MergeStrategy::Staged { blocks } => format!("staged x{}", blocks),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Copy,
    Hardware,
    Software,
    InternalFallback,
    Join,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub kind: AttemptKind,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeResult {
    pub batch_index: usize,
    pub status: MergeStatus,
    pub output_path: PathBuf,
    pub strategy: MergeStrategy,
    pub attempts: Vec<Attempt>,
    pub error_detail: Option<String>,
}

impl MergeResult {
    pub fn cancelled(batch_index: usize, output_path: PathBuf, strategy: MergeStrategy) -> Self {
        Self {
            batch_index,
            status: MergeStatus::Cancelled,
            output_path,
            strategy,
            attempts: vec![],
            error_detail: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == MergeStatus::Success
    }
}

pub struct Orchestrator {
    backend: Arc<dyn MediaBackend>,
    tuning: TierTuning,
    hardware_encoder: Option<String>,
    crash_log: Option<Arc<CrashLog>>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn MediaBackend>, tuning: TierTuning) -> Self {
        Self {
            backend,
            tuning,
            hardware_encoder: None,
            crash_log: None,
        }
    }

    pub fn with_hardware_encoder(mut self, encoder: Option<String>) -> Self {
        self.hardware_encoder = encoder;
        self
    }

    /// Attached only when the tier enables crash logging.
    pub fn with_crash_log(mut self, log: Option<Arc<CrashLog>>) -> Self {
        self.crash_log = log.filter(|_| self.tuning.crash_logging_enabled);
        self
    }

    pub fn tuning(&self) -> &TierTuning {
        &self.tuning
    }

    pub fn choose_strategy(&self, batch: &Batch, canvas: Resolution) -> MergeStrategy {
        if batch.is_standalone_solo
            && batch.clips.len() == 1
            && batch.clips[0].resolution() == Some(canvas)
        {
            return MergeStrategy::FastCopy;
        }
        match self.tuning.max_batch_clips {
            Some(n) if n > 0 && batch.clips.len() > n => MergeStrategy::Staged {
                blocks: batch.clips.len().div_ceil(n),
            },
            _ => MergeStrategy::Transcode,
        }
    }

    /// Final path for a batch; identical to what [`Orchestrator::merge`] writes.
    pub fn planned_output(
        &self,
        batch: &Batch,
        canvas: Resolution,
        naming: &OutputNaming,
        total_batches: usize,
    ) -> PathBuf {
        let copy_ext = match self.choose_strategy(batch, canvas) {
            MergeStrategy::FastCopy => batch.clips.first().and_then(|c| util::source_extension(&c.path)),
            _ => None,
        };
        naming.output_path(batch, total_batches, copy_ext.as_deref())
    }

    pub fn merge(
        &self,
        batch: &Batch,
        canvas: Resolution,
        naming: &OutputNaming,
        total_batches: usize,
        cancel: &CancelToken,
    ) -> MergeResult {
        let strategy = self.choose_strategy(batch, canvas);
        let output_path = self.planned_output(batch, canvas, naming, total_batches);
        if cancel.is_cancelled() {
            return MergeResult::cancelled(batch.index, output_path, strategy);
        }

        let mut attempts = vec![];
        let outcome = validate_batch(batch)
            .and_then(|_| self.write_output(batch, canvas, strategy, &output_path, cancel, &mut attempts));

        let (status, error_detail) = match outcome {
            Ok(()) => {
                tracing::info!(
                    batch = batch.index,
                    strategy = %strategy.label(),
                    output = %output_path.display(),
                    "batch merged"
                );
                (MergeStatus::Success, None)
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(batch = batch.index, "batch cancelled");
                (MergeStatus::Cancelled, None)
            }
            Err(e) => {
                tracing::warn!(batch = batch.index, error = %e, "batch failed");
                self.log_crash(&e, batch.index, &output_path);
                (MergeStatus::Failed, Some(e.to_string()))
            }
        };

        MergeResult {
            batch_index: batch.index,
            status,
            output_path,
            strategy,
            attempts,
            error_detail,
        }
    }

    pub fn log_crash(&self, err: &Error, batch_index: usize, output_path: &Path) {
        let Some(log) = &self.crash_log else {
            return;
        };
        let kind = match err {
            Error::Encode(_) | Error::Probe(_) => CrashKind::Encode,
            Error::Io(_) | Error::Config(_) => CrashKind::Io,
            Error::Fatal(_) => CrashKind::Fatal,
        };
        log.record(
            CrashRecord::new(self.tuning.tier, kind, err.to_string())
                .batch(batch_index)
                .output(output_path),
        );
    }

    fn write_output(
        &self,
        batch: &Batch,
        canvas: Resolution,
        strategy: MergeStrategy,
        output_path: &Path,
        cancel: &CancelToken,
        attempts: &mut Vec<Attempt>,
    ) -> Result<(), Error> {
        if let Some(dir) = output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| IoError::new("create", dir, e))?;
        }
        let partial = util::partial_path_for(output_path);

        let res = match strategy {
            MergeStrategy::FastCopy => {
                let res = copy_verified(&batch.clips[0].path, &partial, cancel);
                attempts.push(Attempt {
                    kind: AttemptKind::Copy,
                    error: res.as_ref().err().map(|e| e.to_string()),
                });
                match res {
                    Err(e) if !e.is_cancelled() => {
                        tracing::warn!(
                            batch = batch.index,
                            error = %e,
                            "fast copy failed, falling back to transcode"
                        );
                        remove_quietly(&partial);
                        self.transcode(&batch.clips, canvas, &partial, cancel, attempts)
                            .map_err(Error::from)
                    }
                    res => res,
                }
            }
            MergeStrategy::Transcode | MergeStrategy::Staged { .. } => self
                .transcode(&batch.clips, canvas, &partial, cancel, attempts)
                .map_err(Error::from),
        };

        match res {
            Ok(()) => std::fs::rename(&partial, output_path).map_err(|e| {
                remove_quietly(&partial);
                IoError::new("rename", output_path, e).into()
            }),
            Err(e) => {
                remove_quietly(&partial);
                Err(e)
            }
        }
    }

    fn transcode(
        &self,
        clips: &[Clip],
        canvas: Resolution,
        output: &Path,
        cancel: &CancelToken,
        attempts: &mut Vec<Attempt>,
    ) -> Result<(), EncodeError> {
        let inputs: Vec<EncodeInput> = clips.iter().map(|c| encode_input(c, canvas)).collect();

        let primary = match self.tuning.max_batch_clips {
            Some(n) if n > 0 && inputs.len() > n => {
                let blocks: Vec<Vec<EncodeInput>> = inputs.chunks(n).map(<[_]>::to_vec).collect();
                self.encode_blocks(blocks, canvas, output, cancel, attempts, false)
            }
            _ => self.encode_with_retry(inputs.clone(), canvas, output, cancel, attempts),
        };

        match primary {
            Err(e) if e != EncodeError::Cancelled
                && self.tuning.internal_fallback_enabled
                && inputs.len() > 1 =>
            {
                tracing::warn!(error = %e, clips = inputs.len(), "transcode failed, normalizing clips one by one");
                let singles = inputs.into_iter().map(|i| vec![i]).collect();
                self.encode_blocks(singles, canvas, output, cancel, attempts, true)
            }
            other => other,
        }
    }

    /// Hardware first when available, then exactly one software attempt.
    fn encode_with_retry(
        &self,
        inputs: Vec<EncodeInput>,
        canvas: Resolution,
        output: &Path,
        cancel: &CancelToken,
        attempts: &mut Vec<Attempt>,
    ) -> Result<(), EncodeError> {
        let mut chain = vec![];
        if let Some(hw) = &self.hardware_encoder {
            chain.push((AttemptKind::Hardware, VideoEncoder::Hardware(hw.clone())));
        }
        chain.push((AttemptKind::Software, VideoEncoder::Software));

        let mut job = EncodeJob {
            inputs,
            canvas,
            output: output.to_path_buf(),
            settings: EncodeSettings::from(&self.tuning),
            encoder: VideoEncoder::Software,
        };
        let mut last = EncodeError::Spawn("no encoder attempted".to_string());
        for (kind, encoder) in chain {
            job.encoder = encoder;
            match self.backend.transcode(&job, cancel) {
                Ok(()) => {
                    attempts.push(Attempt { kind, error: None });
                    return Ok(());
                }
                Err(EncodeError::Cancelled) => return Err(EncodeError::Cancelled),
                Err(e) => {
                    tracing::warn!(encoder = job.encoder.label(), error = %e, "encode attempt failed");
                    attempts.push(Attempt {
                        kind,
                        error: Some(e.to_string()),
                    });
                    remove_quietly(output);
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Encodes each group to an intermediate, then joins them by stream copy.
    fn encode_blocks(
        &self,
        groups: Vec<Vec<EncodeInput>>,
        canvas: Resolution,
        output: &Path,
        cancel: &CancelToken,
        attempts: &mut Vec<Attempt>,
        fallback: bool,
    ) -> Result<(), EncodeError> {
        let mut parts: Vec<PathBuf> = Vec::with_capacity(groups.len());
        let res = (|| {
            for (i, group) in groups.into_iter().enumerate() {
                let part = intermediate_path(output, if fallback { "clip" } else { "block" }, i);
                parts.push(part.clone());
                if fallback {
                    let job = EncodeJob {
                        inputs: group,
                        canvas,
                        output: part,
                        settings: EncodeSettings::from(&self.tuning),
                        encoder: VideoEncoder::Software,
                    };
                    let r = self.backend.transcode(&job, cancel);
                    attempts.push(Attempt {
                        kind: AttemptKind::InternalFallback,
                        error: r.as_ref().err().map(|e| e.to_string()),
                    });
                    r?;
                } else {
                    self.encode_with_retry(group, canvas, &part, cancel, attempts)?;
                }
            }
            let r = self.backend.concat_copy(&parts, output, cancel);
            attempts.push(Attempt {
                kind: AttemptKind::Join,
                error: r.as_ref().err().map(|e| e.to_string()),
            });
            r
        })();
        for p in &parts {
            remove_quietly(p);
        }
        res
    }
}

fn validate_batch(batch: &Batch) -> Result<(), Error> {
    if batch.clips.is_empty() {
        return Err(FatalError::EmptyBatch(batch.index).into());
    }
    if let Some(c) = batch.clips.iter().find(|c| c.meta().is_none()) {
        return Err(FatalError::UnresolvedClip {
            batch: batch.index,
            path: c.path.clone(),
        }
        .into());
    }
    Ok(())
}

fn encode_input(clip: &Clip, canvas: Resolution) -> EncodeInput {
    let meta = clip.meta();
    EncodeInput {
        path: clip.path.clone(),
        geometry: fit_geometry(clip.resolution(), canvas),
        has_audio: meta.map(|m| m.has_audio).unwrap_or(false),
        duration_seconds: meta.map(|m| m.duration_seconds).unwrap_or(0.0),
    }
}

/// Sibling of a partial file; stays hidden and partial-tagged.
fn intermediate_path(partial: &Path, label: &str, i: usize) -> PathBuf {
    let stem = partial
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| ".output.partial-0".to_string());
    let ext = partial
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    partial.with_file_name(format!("{}.{}{}.{}", stem, label, i, ext))
}

fn remove_quietly(p: &Path) {
    if p.exists() {
        if let Err(e) = std::fs::remove_file(p) {
            tracing::warn!(path = %p.display(), error = %e, "could not remove partial file");
        }
    }
}

/// Chunked copy with cancellation, CRC32 verification and mtime preservation.
fn copy_verified(src: &Path, dst: &Path, cancel: &CancelToken) -> Result<(), Error> {
    let src_meta = std::fs::metadata(src).map_err(|e| IoError::new("stat", src, e))?;
    let input = File::open(src).map_err(|e| IoError::new("open", src, e))?;
    let output = File::create(dst).map_err(|e| IoError::new("create", dst, e))?;

    let mut reader = BufReader::with_capacity(COPY_BUF_BYTES, input);
    let mut writer = BufWriter::with_capacity(COPY_BUF_BYTES, output);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        if cancel.is_cancelled() {
            return Err(EncodeError::Cancelled.into());
        }
        let n = reader.read(&mut buf).map_err(|e| IoError::new("read", src, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(|e| IoError::new("write", dst, e))?;
    }
    writer.flush().map_err(|e| IoError::new("flush", dst, e))?;
    drop(writer);

    let expected = hasher.finalize();
    let got = file_crc32(dst)?;
    if got != expected {
        return Err(IoError::new(
            "verify",
            dst,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("crc32 mismatch: source {:08x}, copy {:08x}", expected, got),
            ),
        )
        .into());
    }

    let mtime = FileTime::from_last_modification_time(&src_meta);
    filetime::set_file_mtime(dst, mtime).map_err(|e| IoError::new("set mtime", dst, e))?;
    Ok(())
}

fn file_crc32(p: &Path) -> Result<u32, IoError> {
    let f = File::open(p).map_err(|e| IoError::new("open", p, e))?;
    let mut reader = BufReader::with_capacity(COPY_BUF_BYTES, f);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = reader.read(&mut buf).map_err(|e| IoError::new("read", p, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

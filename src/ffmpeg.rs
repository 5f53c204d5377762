use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::canvas::FitGeometry;
use crate::clip::Resolution;
use crate::error::EncodeError;
use crate::runner::CancelToken;
use crate::tier::{EncodePreset, TierTuning};

const CANCEL_POLL: Duration = Duration::from_millis(100);
const CAPTURE_POLL: Duration = Duration::from_millis(20);
const STDERR_TAIL_LINES: usize = 20;
const AUDIO_RATE: u32 = 44_100;
const CRF: u8 = 23;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoEncoder {
    Software,
    /// ffmpeg encoder name, e.g. `h264_nvenc`.
    Hardware(String),
}

impl VideoEncoder {
    pub fn label(&self) -> &str {
        match self {
            VideoEncoder::Software => "libx264",
            VideoEncoder::Hardware(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeSettings {
    pub preset: EncodePreset,
    pub thread_count: usize,
    pub io_queue_depth: Option<u32>,
}

impl From<&TierTuning> for EncodeSettings {
    fn from(t: &TierTuning) -> Self {
        Self {
            preset: t.encode_preset,
            thread_count: t.thread_count,
            io_queue_depth: t.io_queue_depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeInput {
    pub path: PathBuf,
    pub geometry: FitGeometry,
    pub has_audio: bool,
    pub duration_seconds: f64,
}

/// One encoder invocation: N inputs normalized onto `canvas` and concatenated.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub inputs: Vec<EncodeInput>,
    pub canvas: Resolution,
    pub output: PathBuf,
    pub settings: EncodeSettings,
    pub encoder: VideoEncoder,
}

/// The narrow interface to the media binaries.
pub trait MediaBackend: Send + Sync {
    fn transcode(&self, job: &EncodeJob, cancel: &CancelToken) -> Result<(), EncodeError>;

    /// Joins already-normalized parts without re-encoding.
    fn concat_copy(&self, parts: &[PathBuf], output: &Path, cancel: &CancelToken)
        -> Result<(), EncodeError>;
}

pub struct FfmpegBackend {
    ffmpeg: PathBuf,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn transcode(&self, job: &EncodeJob, cancel: &CancelToken) -> Result<(), EncodeError> {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(transcode_args(job));
        tracing::debug!(
            output = %job.output.display(),
            inputs = job.inputs.len(),
            encoder = job.encoder.label(),
            "spawning transcode"
        );
        run_cancellable(cmd, cancel)
    }

    fn concat_copy(
        &self,
        parts: &[PathBuf],
        output: &Path,
        cancel: &CancelToken,
    ) -> Result<(), EncodeError> {
        let list_path = output.with_extension("concat.txt");
        write_concat_list(&list_path, parts)
            .map_err(|e| EncodeError::Spawn(format!("write concat list: {}", e)))?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"]);
        if wants_faststart(output) {
            cmd.args(["-movflags", "+faststart"]);
        }
        cmd.arg(output);

        let res = run_cancellable(cmd, cancel);
        let _ = std::fs::remove_file(&list_path);
        res
    }
}

fn write_concat_list(list_path: &Path, parts: &[PathBuf]) -> std::io::Result<()> {
    let mut f = std::fs::File::create(list_path)?;
    for p in parts {
        let abs = std::fs::canonicalize(p).unwrap_or_else(|_| p.clone());
        let escaped = abs.to_string_lossy().replace('\'', r"'\''");
        writeln!(f, "file '{}'", escaped)?;
    }
    f.flush()
}

fn wants_faststart(output: &Path) -> bool {
    output
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .map(|e| matches!(e.as_str(), "mp4" | "mov" | "m4v"))
        .unwrap_or(false)
}

/// `filter_complex` graph: per-input video fit + audio normalization, then concat.
pub fn filter_graph(job: &EncodeJob) -> String {
    let mut parts = Vec::with_capacity(job.inputs.len() * 2 + 1);
    for (i, input) in job.inputs.iter().enumerate() {
        parts.push(format!(
            "[{}:v]{}[v{}]",
            i,
            input.geometry.filter_chain(job.canvas),
            i
        ));
        if input.has_audio {
            parts.push(format!(
                "[{i}:a]aresample={AUDIO_RATE},aformat=sample_fmts=fltp:sample_rates={AUDIO_RATE}:channel_layouts=stereo[a{i}]"
            ));
        } else {
            parts.push(format!(
                "anullsrc=channel_layout=stereo:sample_rate={}:d={:.3}[a{}]",
                AUDIO_RATE,
                input.duration_seconds.max(0.001),
                i
            ));
        }
    }
    let joined: String = (0..job.inputs.len())
        .map(|i| format!("[v{}][a{}]", i, i))
        .collect();
    parts.push(format!(
        "{}concat=n={}:v=1:a=1[vout][aout]",
        joined,
        job.inputs.len()
    ));
    parts.join(";")
}

pub fn transcode_args(job: &EncodeJob) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-nostdin"]
        .into_iter()
        .map(OsString::from)
        .collect();
    for input in &job.inputs {
        args.push("-i".into());
        args.push(input.path.clone().into_os_string());
    }
    let threads = job.settings.thread_count.max(1).to_string();
    args.push("-filter_complex".into());
    args.push(filter_graph(job).into());
    args.push("-filter_complex_threads".into());
    args.push(threads.clone().into());
    for m in ["-map", "[vout]", "-map", "[aout]"] {
        args.push(m.into());
    }

    match &job.encoder {
        VideoEncoder::Software => {
            for a in ["-c:v", "libx264", "-preset", job.settings.preset.x264_name()] {
                args.push(a.into());
            }
            args.push("-crf".into());
            args.push(CRF.to_string().into());
        }
        VideoEncoder::Hardware(name) => {
            args.push("-c:v".into());
            args.push(name.into());
            args.push("-preset".into());
            args.push(job.settings.preset.nvenc_name().into());
            args.push("-cq".into());
            args.push(CRF.to_string().into());
        }
    }
    args.push("-threads".into());
    args.push(threads.into());
    for a in ["-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", "128k"] {
        args.push(a.into());
    }
    if let Some(depth) = job.settings.io_queue_depth {
        args.push("-max_muxing_queue_size".into());
        args.push(depth.to_string().into());
    }
    if wants_faststart(&job.output) {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }
    args.push(job.output.clone().into_os_string());
    args
}

/// Spawns `cmd` and waits, killing the child if `cancel` fires.
pub fn run_cancellable(mut cmd: Command, cancel: &CancelToken) -> Result<(), EncodeError> {
    if cancel.is_cancelled() {
        return Err(EncodeError::Cancelled);
    }
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EncodeError::Spawn(e.to_string()))?;
    let stderr_handle = child.stderr.take().map(spawn_stderr_collector);

    let status = match wait_or_kill(&mut child, cancel, CANCEL_POLL) {
        Ok(Waited::Exited(status)) => status,
        // The collector is left detached; a killed child's pipe may be held open by its own children.
        Ok(Waited::Killed) => return Err(EncodeError::Cancelled),
        Err(e) => return Err(EncodeError::Spawn(e.to_string())),
    };

    let stderr_lines = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    if !status.success() {
        let tail = if stderr_lines.is_empty() {
            "<no ffmpeg stderr>".to_string()
        } else {
            stderr_lines.join(" | ")
        };
        return Err(EncodeError::Exit {
            status: status.to_string(),
            stderr_tail: tail,
        });
    }
    Ok(())
}

/// Full output of a child that ran to completion.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug)]
pub enum CaptureError {
    Spawn(std::io::Error),
    Cancelled,
}

/// Like [`run_cancellable`], but keeps stdout and stderr. Used for short
/// metadata queries, so the poll interval is tighter.
pub fn run_captured(mut cmd: Command, cancel: &CancelToken) -> Result<Captured, CaptureError> {
    if cancel.is_cancelled() {
        return Err(CaptureError::Cancelled);
    }
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(CaptureError::Spawn)?;
    let stdout_handle = child.stdout.take().map(spawn_drain);
    let stderr_handle = child.stderr.take().map(spawn_drain);

    let status = match wait_or_kill(&mut child, cancel, CAPTURE_POLL) {
        Ok(Waited::Exited(status)) => status,
        Ok(Waited::Killed) => return Err(CaptureError::Cancelled),
        Err(e) => return Err(CaptureError::Spawn(e)),
    };
    let collect = |h: Option<JoinHandle<Vec<u8>>>| h.and_then(|h| h.join().ok()).unwrap_or_default();
    Ok(Captured {
        status,
        stdout: collect(stdout_handle),
        stderr: collect(stderr_handle),
    })
}

enum Waited {
    Exited(ExitStatus),
    Killed,
}

fn wait_or_kill(child: &mut Child, cancel: &CancelToken, poll: Duration) -> std::io::Result<Waited> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Waited::Exited(status)),
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(Waited::Killed);
        }
        std::thread::sleep(poll);
    }
}

fn spawn_drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = VecDeque::new();
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line).unwrap_or(0);
            if read == 0 {
                break;
            }
            let cleaned = line.trim().to_string();
            if cleaned.is_empty() {
                continue;
            }
            lines.push_back(cleaned);
            if lines.len() > STDERR_TAIL_LINES {
                lines.pop_front();
            }
        }

        lines.into_iter().collect::<Vec<_>>()
    })
}

/// Looks for an NVIDIA card and an ffmpeg build with NVENC.
pub fn detect_hardware_encoder(ffmpeg: &Path) -> Option<String> {
    let gpu = Command::new("nvidia-smi")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !gpu {
        return None;
    }
    let out = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .ok()?;
    let listing = String::from_utf8_lossy(&out.stdout);
    ["h264_nvenc", "hevc_nvenc"]
        .into_iter()
        .find(|name| listing.contains(name))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(encoder: VideoEncoder) -> EncodeJob {
        let canvas = Resolution::new(1920, 1080);
        EncodeJob {
            inputs: vec![
                EncodeInput {
                    path: PathBuf::from("a.mp4"),
                    geometry: FitGeometry::Exact,
                    has_audio: true,
                    duration_seconds: 12.0,
                },
                EncodeInput {
                    path: PathBuf::from("b.mov"),
                    geometry: crate::canvas::fit_geometry(Some(Resolution::new(1080, 1920)), canvas),
                    has_audio: false,
                    duration_seconds: 7.25,
                },
            ],
            canvas,
            output: PathBuf::from("out/merged.mp4"),
            settings: EncodeSettings {
                preset: EncodePreset::Fastest,
                thread_count: 1,
                io_queue_depth: Some(1024),
            },
            encoder,
        }
    }

    fn args_text(job: &EncodeJob) -> Vec<String> {
        transcode_args(job)
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn filter_graph_pads_and_fills_silence() {
        let graph = filter_graph(&job(VideoEncoder::Software));
        assert_eq!(
            graph,
            "[0:v]setsar=1[v0];\
             [0:a]aresample=44100,aformat=sample_fmts=fltp:sample_rates=44100:channel_layouts=stereo[a0];\
             [1:v]scale=608:1080,pad=1920:1080:656:0:color=black,setsar=1[v1];\
             anullsrc=channel_layout=stereo:sample_rate=44100:d=7.250[a1];\
             [v0][a0][v1][a1]concat=n=2:v=1:a=1[vout][aout]"
        );
    }

    #[test]
    fn software_args_carry_tier_settings() {
        let args = args_text(&job(VideoEncoder::Software));
        let joined = args.join(" ");
        assert!(joined.contains("-i a.mp4 -i b.mov"));
        assert!(joined.contains("-c:v libx264 -preset ultrafast -crf 23"));
        assert!(joined.contains("-threads 1"));
        assert!(joined.contains("-max_muxing_queue_size 1024"));
        assert!(joined.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("out/merged.mp4"));
    }

    #[test]
    fn hardware_args_use_nvenc_presets() {
        let mut j = job(VideoEncoder::Hardware("h264_nvenc".to_string()));
        j.settings.preset = EncodePreset::Balanced;
        j.settings.io_queue_depth = None;
        j.output = PathBuf::from("out/merged.mkv");
        let joined = args_text(&j).join(" ");
        assert!(joined.contains("-c:v h264_nvenc -preset p4 -cq 23"));
        assert!(!joined.contains("max_muxing_queue_size"));
        assert!(!joined.contains("faststart"));
    }

    #[test]
    fn unprobed_input_is_fitted_by_ffmpeg() {
        let mut j = job(VideoEncoder::Software);
        j.inputs[1].geometry = crate::canvas::fit_geometry(None, j.canvas);
        let graph = filter_graph(&j);
        assert!(graph.contains(
            "[1:v]scale=1920:1080:force_original_aspect_ratio=decrease:force_divisible_by=2,\
             pad=1920:1080:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1[v1]"
        ));
    }

    #[test]
    fn concat_list_escapes_quotes() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let list = tmp.path().join("list.txt");
        write_concat_list(
            &list,
            &[PathBuf::from("/x/it's.mp4"), PathBuf::from("/x/b.mp4")],
        )
        .expect("write list");
        let text = std::fs::read_to_string(&list).expect("read list");
        assert_eq!(text, "file '/x/it'\\''s.mp4'\nfile '/x/b.mp4'\n");
    }

    #[test]
    fn cancelled_token_skips_spawn() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let cmd = Command::new("definitely-not-a-real-binary");
        assert_eq!(run_cancellable(cmd, &cancel), Err(EncodeError::Cancelled));
    }

    #[cfg(unix)]
    #[test]
    fn captured_run_keeps_both_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf out; printf err >&2; exit 3"]);
        let out = run_captured(cmd, &CancelToken::new()).expect("sh runs");
        assert_eq!(out.stdout, b"out");
        assert_eq!(out.stderr, b"err");
        assert_eq!(out.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn cancelling_kills_a_long_running_query() {
        let cancel = CancelToken::new();
        let trip = cancel.clone();
        let timer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trip.cancel();
        });
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 20; echo late"]);
        let started = std::time::Instant::now();
        let res = run_captured(cmd, &cancel);
        assert!(matches!(res, Err(CaptureError::Cancelled)), "{:?}", res);
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        timer.join().expect("timer joins");
    }
}

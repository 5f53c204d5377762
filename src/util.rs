use clap::ValueEnum;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

use crate::error::IoError;
use crate::planner::Batch;

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "mkv", "avi", "webm", "m4v", "mts", "m2ts", "ts", "flv", "wmv", "mpg", "mpeg",
];

const FALLBACK_TITLE: &str = "Project";

/// Resolved paths of the external media tools.
#[derive(Debug, Clone, PartialEq)]
pub struct Tools {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

impl Tools {
    /// Checks each candidate with `-version`; a missing tool stays `None`.
    pub fn discover(ffmpeg: Option<&Path>, ffprobe: Option<&Path>) -> Self {
        let ffmpeg = ffmpeg
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let ffprobe = ffprobe.map(Path::to_path_buf).unwrap_or_else(|| {
            // Prefer the ffprobe shipped next to an explicit ffmpeg.
            sibling_tool(&ffmpeg, "ffprobe")
                .filter(|p| p.is_file())
                .unwrap_or_else(|| PathBuf::from("ffprobe"))
        });
        Self {
            ffmpeg: tool_responds(&ffmpeg).then_some(ffmpeg),
            ffprobe: tool_responds(&ffprobe).then_some(ffprobe),
        }
    }
}

fn sibling_tool(ffmpeg: &Path, name: &str) -> Option<PathBuf> {
    let dir = ffmpeg.parent().filter(|d| !d.as_os_str().is_empty())?;
    let file = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };
    Some(dir.join(file))
}

pub fn tool_responds(tool: &Path) -> bool {
    Command::new(tool)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn is_video_file(p: &Path) -> bool {
    p.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// Expands inputs in the order given. Directories contribute their video
/// files sorted by path; plain files are kept even with unknown extensions.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, IoError> {
    let mut out = vec![];
    for input in inputs {
        if input.is_dir() {
            let mut found = vec![];
            for entry in WalkDir::new(input).follow_links(true) {
                let e = entry.map_err(|e| {
                    let path = e.path().unwrap_or(input).to_path_buf();
                    IoError::new("scan", path, e.into())
                })?;
                if e.file_type().is_file() && is_video_file(e.path()) {
                    found.push(e.path().to_path_buf());
                }
            }
            found.sort();
            out.extend(found);
        } else {
            out.push(input.clone());
        }
    }
    Ok(out)
}

/// Keeps alphanumerics, spaces, dashes and underscores.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum NamingMode {
    /// `{title} clip-{start}-{end} merge {part}.{ext}`
    Auto,
    /// `{stem}_part{n}.{ext}`, or the exact output path for one batch.
    Parts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputNaming {
    pub mode: NamingMode,
    pub title: String,
    pub output_dir: PathBuf,
    /// Stem for `Parts` naming and exact single-batch output.
    pub base_name: String,
    pub extension: String,
}

impl OutputNaming {
    pub fn new(output_dir: impl Into<PathBuf>, title: impl Into<String>) -> Self {
        Self {
            mode: NamingMode::Auto,
            title: title.into(),
            output_dir: output_dir.into(),
            base_name: "merged".to_string(),
            extension: "mp4".to_string(),
        }
    }

    /// Output path for a batch. Used for previews and for real writes.
    /// `copy_ext` is the source extension when the batch is fast-copied.
    pub fn output_path(&self, batch: &Batch, total_batches: usize, copy_ext: Option<&str>) -> PathBuf {
        let ext = copy_ext
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| self.extension.trim_start_matches('.').to_string());
        let name = match self.mode {
            NamingMode::Auto => format!(
                "{} clip-{}-{} merge {}.{}",
                sanitize_title(&self.title),
                batch.start_marker(),
                batch.end_marker(),
                batch.part_number(),
                ext
            ),
            NamingMode::Parts if total_batches <= 1 => format!("{}.{}", self.base_name, ext),
            NamingMode::Parts => format!("{}_part{}.{}", self.base_name, batch.part_number(), ext),
        };
        self.output_dir.join(name)
    }
}

/// Hidden sibling used while an output is being written.
pub fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut id = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut id);
    let suffix: String = id.iter().map(|b| format!("{:02x}", b)).collect();
    let name = final_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let ext = final_path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    // Keep the real extension last so ffmpeg can pick the muxer.
    final_path.with_file_name(format!(".{}.partial-{}.{}", name, suffix, ext))
}

pub fn is_partial_file(p: &Path) -> bool {
    p.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with('.') && n.contains(".partial-")
        })
        .unwrap_or(false)
}

pub fn source_extension(p: &Path) -> Option<String> {
    p.extension().map(|e| e.to_string_lossy().to_lowercase())
}

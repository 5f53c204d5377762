use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::clip::Resolution;
use crate::error::{Error, Result};
use crate::tier::{EncodePreset, PerformanceTier};

/// Optional TOML configuration. Every field may be omitted; CLI flags win.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub tools: ToolsConfig,
    pub plan: PlanConfig,
    pub canvas: CanvasConfig,
    pub tier: TierOverrides,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanConfig {
    pub max_duration_seconds: Option<f64>,
    pub max_clips: Option<usize>,
    pub standalone_threshold_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanvasConfig {
    pub horizontal: Resolution,
    pub vertical: Resolution,
    pub square: Resolution,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            horizontal: Resolution::new(1920, 1080),
            vertical: Resolution::new(1080, 1920),
            square: Resolution::new(1080, 1080),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierOverrides {
    pub force: Option<PerformanceTier>,
    /// 0 disables staging.
    pub max_batch_clips: Option<usize>,
    pub encode_preset: Option<EncodePreset>,
    pub thread_count: Option<usize>,
    /// 0 disables the muxing queue flag.
    pub io_queue_depth: Option<u32>,
    pub internal_fallback_enabled: Option<bool>,
    pub crash_logging_enabled: Option<bool>,
    pub probe_workers: Option<usize>,
    pub merge_workers: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub extension: Option<String>,
    pub crash_log: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::parse(&raw).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let cfg: FileConfig = toml::from_str(raw).map_err(|e| e.to_string())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        for (name, res) in [
            ("horizontal", self.canvas.horizontal),
            ("vertical", self.canvas.vertical),
            ("square", self.canvas.square),
        ] {
            if res.width < 16 || res.height < 16 || res.width % 2 != 0 || res.height % 2 != 0 {
                return Err(format!(
                    "canvas.{} must be even and at least 16x16, got {}",
                    name, res
                ));
            }
        }
        if let Some(d) = self.plan.max_duration_seconds {
            if !d.is_finite() || d < 0.0 {
                return Err("plan.max_duration_seconds must be >= 0".to_string());
            }
        }
        if let Some(ext) = &self.output.extension {
            if ext.trim().trim_start_matches('.').is_empty() {
                return Err("output.extension must not be empty".to_string());
            }
        }
        Ok(())
    }
}

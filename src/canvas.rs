//! Canvas selection and per-clip fit geometry.
//!
//! Every clip in a batch is scaled to fit the batch canvas with its aspect
//! ratio preserved, then padded with black bars (centered) so the encoder
//! sees identical frame sizes at the concat stage.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::clip::{Clip, Resolution};
use crate::config::CanvasConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    Auto,
    Horizontal,
    Vertical,
    Square,
}

const PAD_COLOR: &str = "black";

pub fn target_canvas(clips: &[Clip], mode: ResolutionMode, canvases: &CanvasConfig) -> Resolution {
    match mode {
        ResolutionMode::Horizontal => canvases.horizontal,
        ResolutionMode::Vertical => canvases.vertical,
        ResolutionMode::Square => canvases.square,
        ResolutionMode::Auto => {
            let mut resolved = clips.iter().filter_map(Clip::resolution).peekable();
            if resolved.peek().is_none() {
                return canvases.horizontal;
            }
            if resolved.all(Resolution::is_vertical) {
                canvases.vertical
            } else {
                canvases.horizontal
            }
        }
    }
}

/// How one clip is brought onto the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitGeometry {
    /// Source already matches the canvas.
    Exact,
    /// Same aspect as the canvas, only a resize is needed.
    Scale { width: u32, height: u32 },
    /// Resize to fit, then pad. `pad_x`/`pad_y` are the left/top offsets.
    ScalePad {
        width: u32,
        height: u32,
        pad_x: u32,
        pad_y: u32,
    },
    /// Source size unknown; ffmpeg computes the fit at runtime.
    ///
    /// The merge path never produces this: unresolved clips fail batch
    /// validation first. It exists for callers that build
    /// [`EncodeJob`](crate::ffmpeg::EncodeJob)s directly for inputs they
    /// have not probed.
    Dynamic,
}

pub fn fit_geometry(source: Option<Resolution>, canvas: Resolution) -> FitGeometry {
    let Some(src) = source else {
        return FitGeometry::Dynamic;
    };
    if src.width == 0 || src.height == 0 {
        return FitGeometry::Dynamic;
    }
    if src == canvas {
        return FitGeometry::Exact;
    }

    let scale = f64::min(
        canvas.width as f64 / src.width as f64,
        canvas.height as f64 / src.height as f64,
    );
    let width = even_floor((src.width as f64 * scale).round() as u32).clamp(2, canvas.width);
    let height = even_floor((src.height as f64 * scale).round() as u32).clamp(2, canvas.height);

    if width == canvas.width && height == canvas.height {
        return FitGeometry::Scale { width, height };
    }

    FitGeometry::ScalePad {
        width,
        height,
        pad_x: (canvas.width - width) / 2,
        pad_y: (canvas.height - height) / 2,
    }
}

fn even_floor(v: u32) -> u32 {
    v - (v % 2)
}

impl FitGeometry {
    /// Video filter chain (without stream labels) for this geometry.
    pub fn filter_chain(self, canvas: Resolution) -> String {
        let (cw, ch) = (canvas.width, canvas.height);
        match self {
            FitGeometry::Exact => "setsar=1".to_string(),
            FitGeometry::Scale { width, height } => {
                format!("scale={}:{},setsar=1", width, height)
            }
            FitGeometry::ScalePad {
                width,
                height,
                pad_x,
                pad_y,
            } => format!(
                "scale={}:{},pad={}:{}:{}:{}:color={},setsar=1",
                width, height, cw, ch, pad_x, pad_y, PAD_COLOR
            ),
            FitGeometry::Dynamic => format!(
                "scale={cw}:{ch}:force_original_aspect_ratio=decrease:force_divisible_by=2,\
                 pad={cw}:{ch}:(ow-iw)/2:(oh-ih)/2:color={PAD_COLOR},setsar=1"
            ),
        }
    }

    pub fn needs_padding(self) -> bool {
        matches!(self, FitGeometry::ScalePad { .. } | FitGeometry::Dynamic)
    }
}

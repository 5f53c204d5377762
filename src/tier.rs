use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::TierOverrides;

const GIB: u64 = 1024 * 1024 * 1024;
const ROCKET_FLOOR_BYTES: u64 = 5 * GIB;
const POTATO_FLOOR_BYTES: u64 = 5 * GIB / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Rocket,
    Potato,
    #[value(alias = "stability")]
    #[serde(alias = "stability")]
    UltimateStability,
}

impl PerformanceTier {
    pub fn from_available_bytes(avail: u64) -> Self {
        if avail > ROCKET_FLOOR_BYTES {
            PerformanceTier::Rocket
        } else if avail >= POTATO_FLOOR_BYTES {
            PerformanceTier::Potato
        } else {
            PerformanceTier::UltimateStability
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PerformanceTier::Rocket => "rocket",
            PerformanceTier::Potato => "potato",
            PerformanceTier::UltimateStability => "ultimate-stability",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum EncodePreset {
    Balanced,
    Fast,
    Fastest,
}

impl EncodePreset {
    pub fn x264_name(self) -> &'static str {
        match self {
            EncodePreset::Balanced => "medium",
            EncodePreset::Fast => "veryfast",
            EncodePreset::Fastest => "ultrafast",
        }
    }

    pub fn nvenc_name(self) -> &'static str {
        match self {
            EncodePreset::Balanced => "p4",
            EncodePreset::Fast => "p2",
            EncodePreset::Fastest => "p1",
        }
    }
}

/// Tuning derived from the tier. Fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierTuning {
    pub tier: PerformanceTier,
    /// Max inputs per encoder invocation; `None` means no staging.
    pub max_batch_clips: Option<usize>,
    pub encode_preset: EncodePreset,
    /// Encoder threads per invocation.
    pub thread_count: usize,
    pub io_queue_depth: Option<u32>,
    pub internal_fallback_enabled: bool,
    pub crash_logging_enabled: bool,
    pub probe_workers: usize,
    pub merge_workers: usize,
}

impl TierTuning {
    pub fn for_tier(tier: PerformanceTier, cores: usize) -> Self {
        let cores = cores.max(1);
        match tier {
            PerformanceTier::Rocket => {
                let merge_workers = (cores / 4).clamp(1, 4);
                Self {
                    tier,
                    max_batch_clips: None,
                    encode_preset: EncodePreset::Balanced,
                    thread_count: (cores / merge_workers).max(1),
                    io_queue_depth: None,
                    internal_fallback_enabled: true,
                    crash_logging_enabled: false,
                    probe_workers: cores.clamp(1, 8),
                    merge_workers,
                }
            }
            PerformanceTier::Potato => {
                let merge_workers = (cores / 2).clamp(1, 2);
                Self {
                    tier,
                    max_batch_clips: Some(4),
                    encode_preset: EncodePreset::Fast,
                    thread_count: ((cores / 2) / merge_workers).max(1),
                    io_queue_depth: None,
                    internal_fallback_enabled: true,
                    crash_logging_enabled: false,
                    probe_workers: (cores / 2).clamp(1, 4),
                    merge_workers,
                }
            }
            PerformanceTier::UltimateStability => Self {
                tier,
                max_batch_clips: Some(2),
                encode_preset: EncodePreset::Fastest,
                thread_count: 1,
                io_queue_depth: Some(1024),
                internal_fallback_enabled: false,
                crash_logging_enabled: true,
                probe_workers: 1,
                merge_workers: 1,
            },
        }
    }

    /// Applies config overrides. UltimateStability keeps concurrency at 1
    /// no matter what the overrides ask for.
    pub fn with_overrides(mut self, overrides: &TierOverrides) -> Self {
        if let Some(v) = overrides.max_batch_clips {
            self.max_batch_clips = if v == 0 { None } else { Some(v) };
        }
        if let Some(v) = overrides.encode_preset {
            self.encode_preset = v;
        }
        if let Some(v) = overrides.thread_count {
            self.thread_count = v.max(1);
        }
        if let Some(v) = overrides.io_queue_depth {
            self.io_queue_depth = if v == 0 { None } else { Some(v) };
        }
        if let Some(v) = overrides.internal_fallback_enabled {
            self.internal_fallback_enabled = v;
        }
        if let Some(v) = overrides.crash_logging_enabled {
            self.crash_logging_enabled = v;
        }
        if let Some(v) = overrides.probe_workers {
            self.probe_workers = v.max(1);
        }
        if let Some(v) = overrides.merge_workers {
            self.merge_workers = v.max(1);
        }
        if self.tier == PerformanceTier::UltimateStability {
            self.thread_count = 1;
            self.probe_workers = 1;
            self.merge_workers = 1;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct TierDecision {
    pub tuning: TierTuning,
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub cores: usize,
    pub forced: bool,
}

/// Reads host memory once and derives the run's tuning.
pub fn select_tier(forced: Option<PerformanceTier>, overrides: &TierOverrides) -> TierDecision {
    let cores = num_cpus::get().max(1);
    let (total_bytes, available_bytes) = system_ram_bytes();
    let forced_tier = forced.or(overrides.force);
    let tier = forced_tier.unwrap_or_else(|| PerformanceTier::from_available_bytes(available_bytes));
    let tuning = TierTuning::for_tier(tier, cores).with_overrides(overrides);

    tracing::info!(
        tier = tier.label(),
        forced = forced_tier.is_some(),
        avail_gib = available_bytes as f64 / GIB as f64,
        total_gib = total_bytes as f64 / GIB as f64,
        cores,
        "performance tier selected"
    );

    TierDecision {
        tuning,
        available_bytes,
        total_bytes,
        cores,
        forced: forced_tier.is_some(),
    }
}

fn system_ram_bytes() -> (u64, u64) {
    let mut sys = System::new();
    sys.refresh_memory();
    // sysinfo >= 0.30 reports bytes
    (sys.total_memory(), sys.available_memory())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_map_to_tiers() {
        assert_eq!(
            PerformanceTier::from_available_bytes(8 * GIB),
            PerformanceTier::Rocket
        );
        assert_eq!(
            PerformanceTier::from_available_bytes(5 * GIB),
            PerformanceTier::Potato
        );
        assert_eq!(
            PerformanceTier::from_available_bytes(5 * GIB / 2),
            PerformanceTier::Potato
        );
        assert_eq!(
            PerformanceTier::from_available_bytes(5 * GIB / 2 - 1),
            PerformanceTier::UltimateStability
        );
        assert_eq!(
            PerformanceTier::from_available_bytes(0),
            PerformanceTier::UltimateStability
        );
    }

    #[test]
    fn stability_forces_single_worker() {
        let t = TierTuning::for_tier(PerformanceTier::UltimateStability, 16);
        assert_eq!(t.thread_count, 1);
        assert_eq!(t.merge_workers, 1);
        assert_eq!(t.probe_workers, 1);
        assert_eq!(t.max_batch_clips, Some(2));
        assert_eq!(t.io_queue_depth, Some(1024));
        assert!(!t.internal_fallback_enabled);
        assert!(t.crash_logging_enabled);

        let overridden = t.with_overrides(&TierOverrides {
            merge_workers: Some(8),
            thread_count: Some(4),
            ..TierOverrides::default()
        });
        assert_eq!(overridden.merge_workers, 1);
        assert_eq!(overridden.thread_count, 1);
    }

    #[test]
    fn rocket_splits_cores_across_merge_workers() {
        let t = TierTuning::for_tier(PerformanceTier::Rocket, 16);
        assert_eq!(t.merge_workers, 4);
        assert_eq!(t.thread_count, 4);
        assert_eq!(t.max_batch_clips, None);
        assert_eq!(t.encode_preset.x264_name(), "medium");

        let small = TierTuning::for_tier(PerformanceTier::Rocket, 2);
        assert_eq!(small.merge_workers, 1);
        assert_eq!(small.thread_count, 2);
    }

    #[test]
    fn potato_halves_thread_budget() {
        let t = TierTuning::for_tier(PerformanceTier::Potato, 8);
        assert_eq!(t.merge_workers, 2);
        assert_eq!(t.thread_count, 2);
        assert_eq!(t.max_batch_clips, Some(4));
        assert_eq!(t.encode_preset, EncodePreset::Fast);
    }

    #[test]
    fn overrides_replace_fields() {
        let t = TierTuning::for_tier(PerformanceTier::Rocket, 8).with_overrides(&TierOverrides {
            max_batch_clips: Some(6),
            encode_preset: Some(EncodePreset::Fastest),
            io_queue_depth: Some(2048),
            ..TierOverrides::default()
        });
        assert_eq!(t.max_batch_clips, Some(6));
        assert_eq!(t.encode_preset, EncodePreset::Fastest);
        assert_eq!(t.io_queue_depth, Some(2048));
    }
}

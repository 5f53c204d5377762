//! Batch partitioning.
//!
//! Pure and synchronous: reads only the metadata already attached to each
//! [`Clip`] and never probes or spawns. Pending clips are scheduled as
//! zero-length placeholders, so the plan is provisional until every clip
//! resolves; callers re-run [`compute_plan`] after each resolution.

use serde::Serialize;

use crate::canvas::{self, ResolutionMode};
use crate::clip::{Clip, Resolution};
use crate::config::CanvasConfig;

pub const DEFAULT_STANDALONE_THRESHOLD_SECONDS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlanLimits {
    pub max_duration_seconds: Option<f64>,
    pub max_clips: Option<usize>,
    pub standalone_threshold_seconds: Option<f64>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_duration_seconds: None,
            max_clips: None,
            standalone_threshold_seconds: Some(DEFAULT_STANDALONE_THRESHOLD_SECONDS),
        }
    }
}

impl PlanLimits {
    /// Treats zero/negative values as "unset", the way the CLI flags work.
    pub fn normalized(self) -> Self {
        Self {
            max_duration_seconds: self.max_duration_seconds.filter(|d| d.is_finite() && *d > 0.0),
            max_clips: self.max_clips.filter(|c| *c > 0),
            standalone_threshold_seconds: self
                .standalone_threshold_seconds
                .filter(|t| t.is_finite() && *t > 0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub clips: Vec<Clip>,
    pub aggregate_duration: f64,
    pub is_standalone_solo: bool,
    pub target_canvas: Option<Resolution>,
}

impl Batch {
    /// 1-based position of the first clip in the caller's list.
    pub fn start_marker(&self) -> usize {
        self.clips.first().map(|c| c.index + 1).unwrap_or(0)
    }

    /// 1-based position of the last clip in the caller's list.
    pub fn end_marker(&self) -> usize {
        self.clips.last().map(|c| c.index + 1).unwrap_or(0)
    }

    pub fn part_number(&self) -> usize {
        self.index + 1
    }

    pub fn has_pending(&self) -> bool {
        self.clips.iter().any(Clip::is_pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePlan {
    pub batches: Vec<Batch>,
    /// Clips whose probe failed; never scheduled.
    pub excluded: Vec<Clip>,
    pub limits: PlanLimits,
}

impl MergePlan {
    pub fn is_provisional(&self) -> bool {
        self.batches.iter().any(Batch::has_pending)
    }

    pub fn clip_count(&self) -> usize {
        self.batches.iter().map(|b| b.clips.len()).sum()
    }

    pub fn total_duration(&self) -> f64 {
        self.batches.iter().map(|b| b.aggregate_duration).sum()
    }

    /// Fills every batch's `target_canvas`.
    pub fn normalize(&mut self, mode: ResolutionMode, canvases: &CanvasConfig) {
        for batch in &mut self.batches {
            batch.target_canvas = Some(canvas::target_canvas(&batch.clips, mode, canvases));
        }
    }
}

struct OpenBatch {
    clips: Vec<Clip>,
    duration: f64,
}

impl OpenBatch {
    fn new() -> Self {
        Self {
            clips: vec![],
            duration: 0.0,
        }
    }

    fn accepts(&self, duration: f64, limits: &PlanLimits) -> bool {
        if self.clips.is_empty() {
            return true;
        }
        if let Some(max) = limits.max_clips {
            if self.clips.len() + 1 > max {
                return false;
            }
        }
        if let Some(max) = limits.max_duration_seconds {
            if self.duration + duration > max {
                return false;
            }
        }
        true
    }

    fn push(&mut self, clip: Clip, duration: f64) {
        self.duration += duration;
        self.clips.push(clip);
    }

    fn close_into(&mut self, batches: &mut Vec<Batch>) {
        if self.clips.is_empty() {
            return;
        }
        batches.push(Batch {
            index: batches.len(),
            clips: std::mem::take(&mut self.clips),
            aggregate_duration: self.duration,
            is_standalone_solo: false,
            target_canvas: None,
        });
        self.duration = 0.0;
    }
}

pub fn compute_plan(clips: &[Clip], limits: &PlanLimits) -> MergePlan {
    let limits = limits.normalized();
    let mut batches: Vec<Batch> = vec![];
    let mut excluded = vec![];
    let mut open = OpenBatch::new();

    for clip in clips {
        if clip.is_failed() {
            excluded.push(clip.clone());
            continue;
        }
        let duration = clip.scheduling_duration();

        let standalone = limits
            .standalone_threshold_seconds
            .map(|t| !clip.is_pending() && duration >= t)
            .unwrap_or(false);
        if standalone {
            open.close_into(&mut batches);
            batches.push(Batch {
                index: batches.len(),
                clips: vec![clip.clone()],
                aggregate_duration: duration,
                is_standalone_solo: true,
                target_canvas: None,
            });
            continue;
        }

        if !open.accepts(duration, &limits) {
            open.close_into(&mut batches);
        }
        open.push(clip.clone(), duration);
    }
    open.close_into(&mut batches);

    MergePlan {
        batches,
        excluded,
        limits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{ClipMeta, ProbeStatus};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn clip(i: usize, secs: f64) -> Clip {
        Clip::resolved(
            i,
            format!("clip{:03}.mp4", i),
            ClipMeta {
                duration_seconds: secs,
                width: 1920,
                height: 1080,
                has_audio: true,
            },
        )
    }

    fn clips(durations: &[f64]) -> Vec<Clip> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| clip(i, *d))
            .collect()
    }

    fn durations(plan: &MergePlan) -> Vec<Vec<f64>> {
        plan.batches
            .iter()
            .map(|b| b.clips.iter().map(|c| c.scheduling_duration()).collect())
            .collect()
    }

    fn limits(t: Option<f64>, c: Option<usize>, solo: Option<f64>) -> PlanLimits {
        PlanLimits {
            max_duration_seconds: t,
            max_clips: c,
            standalone_threshold_seconds: solo,
        }
    }

    #[test]
    fn mixed_limits_example() {
        let input = clips(&[30.0, 40.0, 70.0, 20.0, 15.0]);
        let plan = compute_plan(&input, &limits(Some(60.0), Some(3), Some(60.0)));
        assert_eq!(
            durations(&plan),
            vec![vec![30.0], vec![40.0], vec![70.0], vec![20.0, 15.0]]
        );
        let solo: Vec<bool> = plan.batches.iter().map(|b| b.is_standalone_solo).collect();
        assert_eq!(solo, vec![false, false, true, false]);
        assert_eq!(plan.batches[3].aggregate_duration, 35.0);
        assert_eq!(plan.batches[3].start_marker(), 4);
        assert_eq!(plan.batches[3].end_marker(), 5);
        assert_eq!(plan.batches[3].part_number(), 4);
    }

    #[test]
    fn limits_are_inclusive() {
        let input = clips(&[20.0, 20.0, 20.0, 5.0]);
        let plan = compute_plan(&input, &limits(Some(60.0), None, None));
        assert_eq!(durations(&plan), vec![vec![20.0, 20.0, 20.0], vec![5.0]]);

        let plan = compute_plan(&input, &limits(None, Some(2), None));
        assert_eq!(durations(&plan), vec![vec![20.0, 20.0], vec![20.0, 5.0]]);
    }

    #[test]
    fn over_limit_singleton_gets_own_batch() {
        let input = clips(&[10.0, 45.0, 10.0]);
        let plan = compute_plan(&input, &limits(Some(30.0), None, None));
        assert_eq!(durations(&plan), vec![vec![10.0], vec![45.0], vec![10.0]]);
        assert!(plan.batches.iter().all(|b| !b.is_standalone_solo));
    }

    #[test]
    fn no_limits_yields_single_batch() {
        let input = clips(&[5.0, 6.0, 7.0]);
        let plan = compute_plan(&input, &limits(None, None, None));
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].clips.len(), 3);
        assert!(compute_plan(&[], &PlanLimits::default()).batches.is_empty());
    }

    #[test]
    fn zero_values_disable_limits() {
        let input = clips(&[100.0, 5.0]);
        let plan = compute_plan(&input, &limits(Some(0.0), Some(0), Some(0.0)));
        assert_eq!(durations(&plan), vec![vec![100.0, 5.0]]);
    }

    #[test]
    fn pending_clips_are_zero_length_placeholders() {
        let mut input = clips(&[50.0, 0.0, 20.0]);
        input[1] = Clip::pending(1, "clip001.mp4");
        let plan = compute_plan(&input, &limits(Some(60.0), None, Some(60.0)));
        assert!(plan.is_provisional());
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0].clips.len(), 2);

        // Once resolved, the plan is regenerated wholesale.
        input[1] = clip(1, 90.0);
        let plan = compute_plan(&input, &limits(Some(60.0), None, Some(60.0)));
        assert!(!plan.is_provisional());
        assert_eq!(durations(&plan), vec![vec![50.0], vec![90.0], vec![20.0]]);
        assert!(plan.batches[1].is_standalone_solo);
    }

    #[test]
    fn failed_clips_are_excluded_not_dropped_silently() {
        let mut input = clips(&[10.0, 10.0, 10.0]);
        input[1].status = ProbeStatus::Failed("no video stream".to_string());
        let plan = compute_plan(&input, &PlanLimits::default());
        assert_eq!(plan.excluded.len(), 1);
        assert_eq!(plan.excluded[0].index, 1);
        assert_eq!(plan.clip_count(), 2);
        assert_eq!(plan.batches[0].start_marker(), 1);
        assert_eq!(plan.batches[0].end_marker(), 3);
    }

    #[test]
    fn normalize_assigns_canvas_per_batch() {
        let mut input = clips(&[10.0, 90.0]);
        if let ProbeStatus::Resolved(meta) = &mut input[1].status {
            meta.width = 1080;
            meta.height = 1920;
        }
        let mut plan = compute_plan(&input, &PlanLimits::default());
        plan.normalize(ResolutionMode::Auto, &CanvasConfig::default());
        assert_eq!(plan.batches[0].target_canvas, Some(Resolution::new(1920, 1080)));
        assert_eq!(plan.batches[1].target_canvas, Some(Resolution::new(1080, 1920)));
    }

    #[test]
    fn randomized_plans_hold_partition_and_limit_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..300 {
            let n = rng.gen_range(0..40);
            let input: Vec<Clip> = (0..n)
                .map(|i| clip(i, (rng.gen_range(0..1200) as f64) / 10.0))
                .collect();
            let t = if rng.gen_bool(0.7) {
                Some(rng.gen_range(10..200) as f64)
            } else {
                None
            };
            let c = if rng.gen_bool(0.7) {
                Some(rng.gen_range(1..8))
            } else {
                None
            };
            let solo = if rng.gen_bool(0.7) { Some(60.0) } else { None };
            let lim = limits(t, c, solo);

            let plan = compute_plan(&input, &lim);

            let flattened: Vec<usize> = plan
                .batches
                .iter()
                .flat_map(|b| b.clips.iter().map(|c| c.index))
                .collect();
            assert_eq!(flattened, (0..n).collect::<Vec<_>>());

            for (i, b) in plan.batches.iter().enumerate() {
                assert_eq!(b.index, i);
                assert!(!b.clips.is_empty());
                if b.clips.len() > 1 {
                    if let Some(max) = c {
                        assert!(b.clips.len() <= max);
                    }
                    if let Some(max) = t {
                        assert!(b.aggregate_duration <= max + 1e-9);
                    }
                }
                for clip in &b.clips {
                    if let Some(threshold) = solo {
                        if clip.scheduling_duration() >= threshold {
                            assert!(b.is_standalone_solo);
                            assert_eq!(b.clips.len(), 1);
                        }
                    }
                }
            }

            assert_eq!(plan, compute_plan(&input, &lim));
        }
    }
}

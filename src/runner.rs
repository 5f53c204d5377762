//! Worker threads for probing and merging, with cooperative cancellation.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::canvas::ResolutionMode;
use crate::clip::{ClipMeta, Resolution};
use crate::config::CanvasConfig;
use crate::crashlog::CrashLog;
use crate::error::{Error, FatalError, ProbeError};
use crate::ffmpeg::MediaBackend;
use crate::merge::{MergeResult, MergeStatus, MergeStrategy, Orchestrator};
use crate::planner::{self, Batch, MergePlan, PlanLimits};
use crate::probe::MetadataResolver;
use crate::tier::{PerformanceTier, TierTuning};
use crate::util::OutputNaming;

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ClipResolved {
        index: usize,
        path: PathBuf,
        meta: ClipMeta,
    },
    ClipFailed {
        index: usize,
        path: PathBuf,
        error: ProbeError,
    },
    /// Plan re-derived after a resolution.
    PlanUpdated(MergePlan),
    ProbeFinished {
        resolved: usize,
        failed: usize,
        cancelled: bool,
    },
    BatchStarted {
        batch_index: usize,
        clips: usize,
        output_path: PathBuf,
    },
    BatchFinished(MergeResult),
    RunFinished(RunSummary),
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub tier: PerformanceTier,
    /// One result per batch, ordered by batch index.
    pub results: Vec<MergeResult>,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl RunSummary {
    fn count(&self, status: MergeStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(MergeStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(MergeStatus::Failed)
    }

    pub fn cancelled_batches(&self) -> usize {
        self.count(MergeStatus::Cancelled)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(MergeResult::is_success)
    }
}

/// What a batch will become, without running anything.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPreview {
    pub batch_index: usize,
    pub canvas: Resolution,
    pub strategy: MergeStrategy,
    pub output_path: PathBuf,
}

pub struct ProbeHandle {
    events: Receiver<ProgressEvent>,
    join: JoinHandle<MergePlan>,
    cancel: CancelToken,
}

impl ProbeHandle {
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Cancels this probe run only. Clips already resolved stay cached.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Final plan once every worker has stopped.
    pub fn wait(self) -> Result<MergePlan, FatalError> {
        self.join
            .join()
            .map_err(|p| FatalError::WorkerPanic(panic_message(p.as_ref())))
    }
}

pub struct RunHandle {
    events: Receiver<ProgressEvent>,
    join: JoinHandle<RunSummary>,
    cancel: CancelToken,
}

impl RunHandle {
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn wait(self) -> Result<RunSummary, FatalError> {
        self.join
            .join()
            .map_err(|p| FatalError::WorkerPanic(panic_message(p.as_ref())))
    }
}

pub struct Controller {
    tuning: TierTuning,
    resolver: MetadataResolver,
    backend: Arc<dyn MediaBackend>,
    canvases: CanvasConfig,
    hardware_encoder: Option<String>,
    crash_log: Option<Arc<CrashLog>>,
    /// Token of the most recent `resolve` or `start`.
    current: Mutex<CancelToken>,
}

impl Controller {
    pub fn new(tuning: TierTuning, resolver: MetadataResolver, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            tuning,
            resolver,
            backend,
            canvases: CanvasConfig::default(),
            hardware_encoder: None,
            crash_log: None,
            current: Mutex::new(CancelToken::new()),
        }
    }

    pub fn with_canvases(mut self, canvases: CanvasConfig) -> Self {
        self.canvases = canvases;
        self
    }

    pub fn with_hardware_encoder(mut self, encoder: Option<String>) -> Self {
        self.hardware_encoder = encoder;
        self
    }

    pub fn with_crash_log(mut self, log: Option<Arc<CrashLog>>) -> Self {
        self.crash_log = log;
        self
    }

    pub fn tuning(&self) -> &TierTuning {
        &self.tuning
    }

    pub fn resolver(&self) -> &MetadataResolver {
        &self.resolver
    }

    /// Stops the current run. Running subprocesses are killed within one
    /// poll interval; batches not yet started report `Cancelled`. The next
    /// `resolve` or `start` gets a fresh token.
    pub fn cancel(&self) {
        tracing::info!("cancellation requested");
        self.current.lock().unwrap_or_else(|p| p.into_inner()).cancel();
    }

    fn begin_run(&self) -> CancelToken {
        let token = CancelToken::new();
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        token
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.backend.clone(), self.tuning.clone())
            .with_hardware_encoder(self.hardware_encoder.clone())
            .with_crash_log(self.crash_log.clone())
    }

    /// Strategy and output path per batch, using the same naming as a real run.
    pub fn preview(&self, plan: &MergePlan, mode: ResolutionMode, naming: &OutputNaming) -> Vec<BatchPreview> {
        let mut plan = plan.clone();
        plan.normalize(mode, &self.canvases);
        let orch = self.orchestrator();
        let total = plan.batches.len();
        plan.batches
            .iter()
            .map(|b| {
                let canvas = b.target_canvas.unwrap_or(self.canvases.horizontal);
                BatchPreview {
                    batch_index: b.index,
                    canvas,
                    strategy: orch.choose_strategy(b, canvas),
                    output_path: orch.planned_output(b, canvas, naming, total),
                }
            })
            .collect()
    }

    /// Probes `paths` on up to `probe_workers` threads, re-planning after
    /// every resolution.
    pub fn resolve(&self, paths: Vec<PathBuf>, limits: PlanLimits) -> ProbeHandle {
        let (event_tx, event_rx) = unbounded();
        let resolver = self.resolver.clone();
        let cancel = self.begin_run();
        let run_cancel = cancel.clone();
        let workers = self.tuning.probe_workers.clamp(1, paths.len().max(1));
        let limits = limits.normalized();

        let join = std::thread::spawn(move || {
            let (job_tx, job_rx) = bounded::<(usize, PathBuf)>(paths.len().max(1));
            for job in paths.iter().cloned().enumerate() {
                let _ = job_tx.send(job);
            }
            drop(job_tx);

            let (res_tx, res_rx) = unbounded();
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                let resolver = resolver.clone();
                let cancel = cancel.clone();
                handles.push(std::thread::spawn(move || {
                    for (index, path) in job_rx.iter() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let res = resolver.resolve_with(&path, &cancel);
                        if res == Err(ProbeError::Cancelled) {
                            break;
                        }
                        if res_tx.send((index, path, res)).is_err() {
                            break;
                        }
                    }
                }));
            }
            drop(res_tx);

            let mut plan = planner::compute_plan(&resolver.cache().clips(&paths), &limits);
            let (mut resolved, mut failed) = (0usize, 0usize);
            for (index, path, res) in res_rx.iter() {
                let ev = match res {
                    Ok(meta) => {
                        resolved += 1;
                        ProgressEvent::ClipResolved { index, path, meta }
                    }
                    Err(error) => {
                        failed += 1;
                        tracing::warn!(path = %path.display(), error = %error, "probe failed");
                        ProgressEvent::ClipFailed { index, path, error }
                    }
                };
                send(&event_tx, ev);
                plan = planner::compute_plan(&resolver.cache().clips(&paths), &limits);
                send(&event_tx, ProgressEvent::PlanUpdated(plan.clone()));
            }

            for h in handles {
                if h.join().is_err() {
                    tracing::error!("probe worker panicked");
                }
            }
            send(
                &event_tx,
                ProgressEvent::ProbeFinished {
                    resolved,
                    failed,
                    cancelled: cancel.is_cancelled(),
                },
            );
            plan
        });

        ProbeHandle {
            events: event_rx,
            join,
            cancel: run_cancel,
        }
    }

    /// Merges every batch of `plan` on up to `merge_workers` threads.
    pub fn start(&self, mut plan: MergePlan, mode: ResolutionMode, naming: OutputNaming) -> RunHandle {
        let (event_tx, event_rx) = unbounded();
        plan.normalize(mode, &self.canvases);

        let orch = Arc::new(self.orchestrator());
        let cancel = self.begin_run();
        let run_cancel = cancel.clone();
        let fallback_canvas = self.canvases.horizontal;
        let workers = self.tuning.merge_workers.clamp(1, plan.batches.len().max(1));
        let tier = self.tuning.tier;

        let join = std::thread::spawn(move || {
            let started = Instant::now();
            let total = plan.batches.len();
            let naming = Arc::new(naming);
            tracing::info!(batches = total, workers, tier = tier.label(), "merge run started");

            let (job_tx, job_rx) = bounded::<Batch>(total.max(1));
            for batch in plan.batches {
                let _ = job_tx.send(batch);
            }
            drop(job_tx);

            let results: Arc<Mutex<Vec<MergeResult>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let event_tx = event_tx.clone();
                let orch = orch.clone();
                let naming = naming.clone();
                let cancel = cancel.clone();
                let results = results.clone();
                handles.push(std::thread::spawn(move || {
                    for batch in job_rx.iter() {
                        let canvas = batch.target_canvas.unwrap_or(fallback_canvas);
                        let result = if cancel.is_cancelled() {
                            MergeResult::cancelled(
                                batch.index,
                                orch.planned_output(&batch, canvas, &naming, total),
                                orch.choose_strategy(&batch, canvas),
                            )
                        } else {
                            send(
                                &event_tx,
                                ProgressEvent::BatchStarted {
                                    batch_index: batch.index,
                                    clips: batch.clips.len(),
                                    output_path: orch.planned_output(&batch, canvas, &naming, total),
                                },
                            );
                            merge_guarded(&orch, &batch, canvas, &naming, total, &cancel)
                        };
                        send(&event_tx, ProgressEvent::BatchFinished(result.clone()));
                        results
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .push(result);
                    }
                }));
            }

            for h in handles {
                if h.join().is_err() {
                    tracing::error!("merge worker panicked outside a batch");
                }
            }

            let mut results = std::mem::take(&mut *results.lock().unwrap_or_else(|p| p.into_inner()));
            results.sort_by_key(|r| r.batch_index);
            let summary = RunSummary {
                tier,
                results,
                elapsed: started.elapsed(),
                cancelled: cancel.is_cancelled(),
            };
            tracing::info!(
                succeeded = summary.succeeded(),
                failed = summary.failed(),
                cancelled = summary.cancelled_batches(),
                "merge run finished"
            );
            send(&event_tx, ProgressEvent::RunFinished(summary.clone()));
            summary
        });

        RunHandle {
            events: event_rx,
            join,
            cancel: run_cancel,
        }
    }
}

/// A panicking merge becomes a failed result instead of taking the run down.
fn merge_guarded(
    orch: &Orchestrator,
    batch: &Batch,
    canvas: Resolution,
    naming: &OutputNaming,
    total: usize,
    cancel: &CancelToken,
) -> MergeResult {
    match catch_unwind(AssertUnwindSafe(|| orch.merge(batch, canvas, naming, total, cancel))) {
        Ok(result) => result,
        Err(payload) => {
            let err = Error::from(FatalError::WorkerPanic(panic_message(payload.as_ref())));
            let output_path = orch.planned_output(batch, canvas, naming, total);
            tracing::error!(batch = batch.index, error = %err, "merge worker panicked");
            orch.log_crash(&err, batch.index, &output_path);
            MergeResult {
                batch_index: batch.index,
                status: MergeStatus::Failed,
                output_path,
                strategy: orch.choose_strategy(batch, canvas),
                attempts: vec![],
                error_detail: Some(err.to_string()),
            }
        }
    }
}

fn send(tx: &Sender<ProgressEvent>, ev: ProgressEvent) {
    // Receiver may be gone if the caller stopped listening.
    let _ = tx.send(ev);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use reelmerge::canvas::ResolutionMode;
use reelmerge::config::FileConfig;
use reelmerge::crashlog::{CrashLog, DEFAULT_CRASH_LOG};
use reelmerge::ffmpeg::{self, FfmpegBackend};
use reelmerge::merge::MergeStatus;
use reelmerge::planner::{MergePlan, PlanLimits, DEFAULT_STANDALONE_THRESHOLD_SECONDS};
use reelmerge::probe::{MetadataCache, MetadataResolver};
use reelmerge::progress::{format_clock, Phase, ProgressConfig, ProgressMode, ProgressReporter};
use reelmerge::runner::{Controller, ProgressEvent, RunSummary};
use reelmerge::tier::{self, PerformanceTier, TierDecision};
use reelmerge::util::{self, NamingMode, OutputNaming, Tools};

#[derive(Parser)]
#[command(
    name = "reelmerge",
    version,
    about = "Batch, normalize and merge video clips (ffmpeg backed, memory-aware)"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe clips and print duration, resolution and audio presence
    Probe {
        /// Video files or directories (scanned for video extensions, sorted by path)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show how clips would be batched and named, without writing anything
    Plan {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        limits: LimitArgs,

        #[command(flatten)]
        output: OutputArgs,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Merge clips into one output per batch
    Merge {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        limits: LimitArgs,

        #[command(flatten)]
        output: OutputArgs,

        /// Hardware encoding: auto (detect NVENC), on, off.
        #[arg(long, value_enum, default_value_t = HwAccel::Auto)]
        hwaccel: HwAccel,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show the performance tier and tuning picked for this machine
    Tier {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force a performance tier instead of deriving it from free memory.
    #[arg(long, value_enum)]
    tier: Option<PerformanceTier>,

    /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
    #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,
}

#[derive(Args)]
struct LimitArgs {
    /// Max total seconds per batch (0 disables).
    #[arg(long)]
    max_duration: Option<f64>,

    /// Max clips per batch (0 disables).
    #[arg(long)]
    max_clips: Option<usize>,

    /// Clips at least this long (seconds) are output alone (0 disables).
    #[arg(long)]
    standalone_threshold: Option<f64>,
}

#[derive(Args)]
struct OutputArgs {
    /// Target canvas: auto, horizontal, vertical, square.
    #[arg(long, value_enum, default_value_t = ResolutionMode::Auto)]
    mode: ResolutionMode,

    /// Project title used by auto naming.
    #[arg(long)]
    title: Option<String>,

    /// Output naming: auto or parts.
    #[arg(long, value_enum, default_value_t = NamingMode::Auto)]
    naming: NamingMode,

    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// File stem for `parts` naming.
    #[arg(long, default_value = "merged")]
    output_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
enum HwAccel {
    Auto,
    On,
    Off,
}

struct Session {
    cfg: FileConfig,
    decision: TierDecision,
    progress: ProgressConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Tier { common } => {
            let session = load_session(&common)?;
            print_tier(&session.decision);
        }

        Commands::Probe { inputs, common } => {
            let session = load_session(&common)?;
            let paths = util::collect_inputs(&inputs).context("collect inputs")?;
            if paths.is_empty() {
                bail!("no video files found in the given inputs");
            }
            let tools = discover_tools(&session.cfg);
            let ctl = build_controller(&session, &tools, None, None)?;
            let plan = resolve_with_progress(&ctl, &paths, PlanLimits::default(), session.progress)?;
            print_probe(&ctl, &paths, &plan);
        }

        Commands::Plan {
            inputs,
            limits,
            output,
            common,
        } => {
            let session = load_session(&common)?;
            let paths = util::collect_inputs(&inputs).context("collect inputs")?;
            if paths.is_empty() {
                bail!("no video files found in the given inputs");
            }
            let tools = discover_tools(&session.cfg);
            let ctl = build_controller(&session, &tools, None, None)?;
            let limits = plan_limits(&limits, &session.cfg);
            let plan = resolve_with_progress(&ctl, &paths, limits, session.progress)?;
            let naming = output_naming(&output, &session.cfg);
            print_plan(&ctl, &plan, output.mode, &naming);
        }

        Commands::Merge {
            inputs,
            limits,
            output,
            hwaccel,
            common,
        } => {
            let session = load_session(&common)?;
            let paths = util::collect_inputs(&inputs).context("collect inputs")?;
            if paths.is_empty() {
                bail!("no video files found in the given inputs");
            }
            let tools = discover_tools(&session.cfg);
            let ffmpeg_path = tools
                .ffmpeg
                .clone()
                .context("ffmpeg not found (set [tools].ffmpeg or add it to PATH)")?;
            let hardware = match hwaccel {
                HwAccel::Off => None,
                HwAccel::Auto => ffmpeg::detect_hardware_encoder(&ffmpeg_path),
                HwAccel::On => Some(
                    ffmpeg::detect_hardware_encoder(&ffmpeg_path)
                        .unwrap_or_else(|| "h264_nvenc".to_string()),
                ),
            };
            if let Some(hw) = &hardware {
                tracing::info!(encoder = %hw, "hardware encoder enabled");
            }
            let crash_log = session.decision.tuning.crash_logging_enabled.then(|| {
                let path = session
                    .cfg
                    .output
                    .crash_log
                    .clone()
                    .unwrap_or_else(|| output.output_dir.join(DEFAULT_CRASH_LOG));
                Arc::new(CrashLog::new(path))
            });

            let ctl = build_controller(&session, &tools, hardware, crash_log)?;
            let limits = plan_limits(&limits, &session.cfg);
            let plan = resolve_with_progress(&ctl, &paths, limits, session.progress)?;
            if plan.batches.is_empty() {
                bail!("no clip could be probed; nothing to merge");
            }
            for clip in &plan.excluded {
                eprintln!("[WARN] skipping {}: probe failed", clip.path.display());
            }

            let naming = output_naming(&output, &session.cfg);
            let summary = merge_with_progress(&ctl, plan, output.mode, naming, session.progress)?;
            print_merge_summary(&summary);
            if summary.failed() > 0 {
                bail!(
                    "{} of {} batches failed",
                    summary.failed(),
                    summary.results.len()
                );
            }
        }
    }

    Ok(())
}

fn load_session(common: &CommonArgs) -> Result<Session> {
    let cfg = match &common.config {
        Some(path) => FileConfig::load(path).with_context(|| format!("load config {}", path.display()))?,
        None => FileConfig::default(),
    };
    let decision = tier::select_tier(common.tier, &cfg.tier);
    Ok(Session {
        cfg,
        decision,
        progress: ProgressConfig::new(common.progress),
    })
}

fn discover_tools(cfg: &FileConfig) -> Tools {
    Tools::discover(cfg.tools.ffmpeg.as_deref(), cfg.tools.ffprobe.as_deref())
}

fn build_controller(
    session: &Session,
    tools: &Tools,
    hardware: Option<String>,
    crash_log: Option<Arc<CrashLog>>,
) -> Result<Controller> {
    if tools.ffprobe.is_none() && tools.ffmpeg.is_none() {
        bail!("neither ffprobe nor ffmpeg was found (set [tools] in the config or add them to PATH)");
    }
    let tuning = session.decision.tuning.clone();
    let single_thread = tuning.tier == PerformanceTier::UltimateStability;
    let resolver = MetadataResolver::from_tools(tools, single_thread, Arc::new(MetadataCache::new()));
    let backend = FfmpegBackend::new(
        tools
            .ffmpeg
            .clone()
            .unwrap_or_else(|| PathBuf::from("ffmpeg")),
    );
    Ok(Controller::new(tuning, resolver, Arc::new(backend))
        .with_canvases(session.cfg.canvas)
        .with_hardware_encoder(hardware)
        .with_crash_log(crash_log))
}

fn plan_limits(args: &LimitArgs, cfg: &FileConfig) -> PlanLimits {
    PlanLimits {
        max_duration_seconds: args.max_duration.or(cfg.plan.max_duration_seconds),
        max_clips: args.max_clips.or(cfg.plan.max_clips),
        standalone_threshold_seconds: args
            .standalone_threshold
            .or(cfg.plan.standalone_threshold_seconds)
            .or(Some(DEFAULT_STANDALONE_THRESHOLD_SECONDS)),
    }
    .normalized()
}

fn output_naming(args: &OutputArgs, cfg: &FileConfig) -> OutputNaming {
    let mut naming = OutputNaming::new(&args.output_dir, args.title.clone().unwrap_or_default());
    naming.mode = args.naming;
    naming.base_name = args.output_name.clone();
    if let Some(ext) = &cfg.output.extension {
        naming.extension = ext.trim().trim_start_matches('.').to_string();
    }
    naming
}

fn resolve_with_progress(
    ctl: &Controller,
    paths: &[PathBuf],
    limits: PlanLimits,
    progress: ProgressConfig,
) -> Result<MergePlan> {
    let reporter = ProgressReporter::new(Phase::Probe, paths.len() as u64, progress);
    let handle = reporter.handle();
    handle.set_stage("probing");

    let mut planned = 0;
    let probe = ctl.resolve(paths.to_vec(), limits);
    for ev in probe.events().iter() {
        match ev {
            ProgressEvent::ClipResolved { .. } => handle.advance(),
            ProgressEvent::ClipFailed { path, error, .. } => {
                handle.advance();
                handle.warn(format!("{}: {}", path.display(), error));
            }
            ProgressEvent::PlanUpdated(plan) if plan.batches.len() != planned => {
                planned = plan.batches.len();
                handle.set_stage(format!("probing ({} batches so far)", planned))
            }
            ProgressEvent::ProbeFinished { resolved, failed, .. } => {
                handle.log(format!("resolved={} failed={}", resolved, failed))
            }
            _ => {}
        }
    }
    let plan = probe.wait().context("probe workers")?;
    reporter.finish(format!("{} batches planned", plan.batches.len()));
    Ok(plan)
}

fn merge_with_progress(
    ctl: &Controller,
    plan: MergePlan,
    mode: ResolutionMode,
    naming: OutputNaming,
    progress: ProgressConfig,
) -> Result<RunSummary> {
    let mut progress = progress;
    // Batches report nothing until their transcode exits.
    progress.idle_threshold = Duration::from_secs(300);
    let reporter = ProgressReporter::new(Phase::Merge, plan.batches.len() as u64, progress);
    let handle = reporter.handle();
    handle.set_stage(format!("merging (tier={})", ctl.tuning().tier.label()));

    let run = ctl.start(plan, mode, naming);
    for ev in run.events().iter() {
        match ev {
            ProgressEvent::BatchStarted {
                batch_index, clips, ..
            } => handle.begin(batch_index, format!("{} clips", clips)),
            ProgressEvent::BatchFinished(result) => {
                let status = format!("{:?}", result.status).to_lowercase();
                handle.end(result.batch_index, &status);
                if result.status == MergeStatus::Failed {
                    handle.warn(format!(
                        "batch {} failed: {}",
                        result.batch_index + 1,
                        result.error_detail.as_deref().unwrap_or("unknown error")
                    ));
                }
            }
            _ => {}
        }
    }
    let summary = run.wait().context("merge workers")?;
    reporter.finish(format!(
        "{} ok, {} failed, {} cancelled",
        summary.succeeded(),
        summary.failed(),
        summary.cancelled_batches()
    ));
    Ok(summary)
}

fn print_tier(decision: &TierDecision) {
    let t = &decision.tuning;
    println!(
        "Tier: {} (forced={}) avail={:.1}GiB total={:.1}GiB cores={}",
        t.tier.label(),
        decision.forced,
        gib(decision.available_bytes),
        gib(decision.total_bytes),
        decision.cores
    );
    println!(
        "  max_batch_clips={} preset={:?} threads={} io_queue_depth={} internal_fallback={} crash_logging={} probe_workers={} merge_workers={}",
        t.max_batch_clips
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unbounded".to_string()),
        t.encode_preset,
        t.thread_count,
        t.io_queue_depth
            .map(|v| v.to_string())
            .unwrap_or_else(|| "default".to_string()),
        t.internal_fallback_enabled,
        t.crash_logging_enabled,
        t.probe_workers,
        t.merge_workers
    );
}

fn print_probe(ctl: &Controller, paths: &[PathBuf], plan: &MergePlan) {
    let cache = ctl.resolver().cache();
    for (i, path) in paths.iter().enumerate() {
        match cache.get(path) {
            Some(Ok(meta)) => println!(
                "{:>4}  {:>8}  {:>9}  audio={:<3}  {}",
                i + 1,
                fmt_secs(meta.duration_seconds),
                meta.resolution().to_string(),
                if meta.has_audio { "yes" } else { "no" },
                path.display()
            ),
            Some(Err(e)) => println!("{:>4}  FAILED    {}: {}", i + 1, path.display(), e),
            None => println!("{:>4}  pending   {}", i + 1, path.display()),
        }
    }
    println!(
        "Probe summary: clips={} resolved={} failed={} total_duration={} strategies={}",
        paths.len(),
        plan.clip_count(),
        plan.excluded.len(),
        fmt_secs(plan.total_duration()),
        ctl.resolver().strategy_names().join(",")
    );
}

fn print_plan(ctl: &Controller, plan: &MergePlan, mode: ResolutionMode, naming: &OutputNaming) {
    let limits = &plan.limits;
    println!(
        "Plan: batches={} clips={} excluded={} total_duration={} tier={} max_duration={} max_clips={} standalone_threshold={}",
        plan.batches.len(),
        plan.clip_count(),
        plan.excluded.len(),
        fmt_secs(plan.total_duration()),
        ctl.tuning().tier.label(),
        limits
            .max_duration_seconds
            .map(fmt_secs)
            .unwrap_or_else(|| "-".to_string()),
        limits
            .max_clips
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string()),
        limits
            .standalone_threshold_seconds
            .map(fmt_secs)
            .unwrap_or_else(|| "-".to_string()),
    );
    let previews = ctl.preview(plan, mode, naming);
    for (batch, preview) in plan.batches.iter().zip(&previews) {
        println!(
            "  [{}] clips {}-{} ({} clips, {}) canvas={} {}{} -> {}",
            batch.part_number(),
            batch.start_marker(),
            batch.end_marker(),
            batch.clips.len(),
            fmt_secs(batch.aggregate_duration),
            preview.canvas,
            preview.strategy.label(),
            if batch.is_standalone_solo { " (standalone)" } else { "" },
            preview.output_path.display()
        );
    }
    for clip in &plan.excluded {
        println!("  excluded: {} (probe failed)", clip.path.display());
    }
}

fn print_merge_summary(summary: &RunSummary) {
    println!(
        "Merge summary: tier={} duration={} batches={} ok={} failed={} cancelled={}",
        summary.tier.label(),
        format_clock(summary.elapsed),
        summary.results.len(),
        summary.succeeded(),
        summary.failed(),
        summary.cancelled_batches()
    );
    for r in &summary.results {
        let attempts = r
            .attempts
            .iter()
            .map(|a| format!("{:?}", a.kind).to_lowercase())
            .collect::<Vec<_>>()
            .join(">");
        println!(
            "  [{}] {:?} {} attempts={} -> {}",
            r.batch_index + 1,
            r.status,
            r.strategy.label(),
            if attempts.is_empty() { "-".to_string() } else { attempts },
            r.output_path.display()
        );
        if let Some(err) = &r.error_detail {
            println!("      error: {}", err);
        }
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

fn fmt_secs(secs: f64) -> String {
    format_clock(Duration::from_secs_f64(secs.max(0.0)))
}

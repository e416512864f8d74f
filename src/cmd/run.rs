//! `runwright run --mode full|rework-only`.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use runwright::config::{DEFAULT_PROFILE, Overrides, RunwrightToml, runs_root};
use runwright::errors::{LockError, RunError, StateError, UsageError};
use runwright::exclusion::ExclusionPolicy;
use runwright::layout::{RunLayout, validate_run_id};
use runwright::lock::{LockHandle, RunLock};
use runwright::logging;
use runwright::manifest::{Manifest, ManifestRequest, reconcile};
use runwright::phase::{
    AbortSignal, CyclePlan, Heartbeat, HeartbeatSettings, HeartbeatSupervisor, PhaseName,
    ProgressTracker, Sequencer, marker,
};
use runwright::pipeline::{self, RunContext, RunHeartbeat};
use runwright::tools::ToolRunner;

use crate::{Cli, Mode, RunArgs};

pub async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<(), RunError> {
    validate_run_id(&args.run_id)?;

    let (mut config, config_path) = RunwrightToml::load_or_default(args.config.as_deref())
        .map_err(|e| UsageError::Config(format!("{e:#}")))?;
    config.apply_overrides(&Overrides {
        max_paragraph_attempts: args.max_paragraph_attempts,
        phase_timeout_seconds: args.phase_timeout_seconds,
    })?;
    config.ensure_valid()?;

    let layout = RunLayout::new(&runs_root(args.runs_dir.as_deref()), &args.run_id);

    if args.mode == Mode::Status {
        let _guard = logging::init(cli.verbose, None);
        return super::cmd_status(&layout, &args.run_id, config.timing.lock_settings(), args.json);
    }

    // Usage problems are reported before the run directory is touched.
    let profile = args
        .pipeline_profile
        .as_ref()
        .map(|name| config.profile(name).map(|p| (name.clone(), p)))
        .transpose()?;
    let default_profile = (DEFAULT_PROFILE.to_string(), config.profile(DEFAULT_PROFILE)?);
    let cli_policy = args
        .exclusion_policy
        .as_deref()
        .map(ExclusionPolicy::load)
        .transpose()?;
    let existing = Manifest::load(&layout.manifest())?;
    match args.mode {
        Mode::Full if existing.is_none() => {
            if args.source.is_none() {
                return Err(UsageError::MissingArgument("source").into());
            }
            if args.model.is_none() {
                return Err(UsageError::MissingArgument("model").into());
            }
        }
        Mode::ReworkOnly => {
            let initialized =
                existing.is_some() && marker::is_done(&layout, 0, PhaseName::Bookkeeping)?;
            if !initialized {
                return Err(UsageError::RunNotInitialized(args.run_id.clone()).into());
            }
        }
        _ => {}
    }

    let _guard = logging::init(cli.verbose, Some(&layout.logs_dir()));
    if let Some(path) = &config_path {
        info!(config = %path.display(), "Loaded configuration");
    }

    let lock = RunLock::new(layout.root(), config.timing.lock_settings());
    let handle = lock.acquire(&args.run_id).await?;

    let manifest = reconcile(
        &layout.manifest(),
        ManifestRequest {
            run_id: args.run_id.clone(),
            source: args.source.clone(),
            model: args.model.clone(),
            profile,
            exclusion_policy: cli_policy.as_ref().and_then(|p| p.fingerprint().cloned()),
        },
        default_profile,
        Utc::now(),
    );
    let manifest = match manifest {
        Ok(m) => m,
        Err(e) => {
            release(&lock, &handle, &args.run_id);
            return Err(e);
        }
    };

    let exclusion = match resolve_exclusion(&manifest, cli_policy) {
        Ok(policy) => policy,
        Err(e) => {
            release(&lock, &handle, &args.run_id);
            return Err(e);
        }
    };

    let plan = match args.mode {
        Mode::ReworkOnly => match next_rework_cycle(&layout) {
            Ok(cycle) => CyclePlan::rework(cycle),
            Err(e) => {
                release(&lock, &handle, &args.run_id);
                return Err(e.into());
            }
        },
        _ => CyclePlan::full(manifest.pass2_lang.is_some()),
    };
    info!(run_id = %args.run_id, cycle = plan.cycle, phases = plan.phases.len(), "Starting cycle");

    let ctx = RunContext {
        layout: layout.clone(),
        manifest,
        policy: config.review.to_policy(),
        exclusion,
        runner: ToolRunner::new(config.tools.clone(), &config.timing),
    };

    let progress = Arc::new(ProgressTracker::new(layout.progress(), &args.run_id, plan.cycle));
    let abort = AbortSignal::new();
    let heartbeat = Arc::new(RunHeartbeat::new(lock.clone(), handle, progress.clone()));
    let supervisor = HeartbeatSupervisor::start(
        heartbeat.clone() as Arc<dyn Heartbeat>,
        HeartbeatSettings {
            interval: config.timing.heartbeat_interval(),
            max_failures: config.timing.max_heartbeat_failures,
            stale_ttl: config.timing.stale_ttl(),
        },
        abort.clone(),
    );

    let interrupt = {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current tool");
                abort.trigger("interrupted");
            }
        })
    };

    let handlers = pipeline::handlers();
    let outcome = Sequencer::new(&layout, progress, abort)
        .run_cycle(&plan, &handlers, &ctx)
        .await;
    interrupt.abort();
    supervisor.stop().await;

    if let Some(reason) = heartbeat.lost_reason() {
        return Err(LockError::Lost { reason }.into());
    }
    let released = lock.release(&heartbeat.handle(), &args.run_id);
    let report = outcome?;
    released?;

    println!(
        "{} run {} cycle {}: {} phase(s) done, {} skipped",
        console::style("✓").green(),
        args.run_id,
        report.cycle,
        report.completed.len(),
        report.skipped.len()
    );
    if layout.merged().exists() {
        println!("  merged output: {}", layout.merged().display());
    }
    Ok(())
}

/// Load the exclusion policy to apply: the CLI file if given, else the one
/// recorded in the manifest, checked against its recorded hash.
fn resolve_exclusion(
    manifest: &Manifest,
    cli_policy: Option<ExclusionPolicy>,
) -> Result<ExclusionPolicy, RunError> {
    if let Some(policy) = cli_policy {
        return Ok(policy);
    }
    let Some(recorded) = &manifest.exclusion_policy else {
        return Ok(ExclusionPolicy::none());
    };
    let policy = ExclusionPolicy::load(&recorded.path)?;
    let current = policy
        .fingerprint()
        .map(|f| f.sha256.clone())
        .unwrap_or_default();
    if current != recorded.sha256 {
        return Err(StateError::ManifestDrift {
            field: "exclusion_policy".to_string(),
            recorded: recorded.sha256.clone(),
            requested: current,
        }
        .into());
    }
    Ok(policy)
}

/// Resume the latest rework cycle if its bookkeeping never finished, else open a new one.
fn next_rework_cycle(layout: &RunLayout) -> Result<u32, StateError> {
    let latest = layout.cycles().last().copied().unwrap_or(0);
    if latest >= 1 && !marker::is_done(layout, latest, PhaseName::Bookkeeping)? {
        return Ok(latest);
    }
    Ok(latest + 1)
}

fn release(lock: &RunLock, handle: &LockHandle, run_id: &str) {
    if let Err(e) = lock.release(handle, run_id) {
        warn!(error = %e, "Failed to release run lock");
    }
}

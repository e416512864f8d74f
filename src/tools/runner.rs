//! Subprocess execution for external tools.
//!
//! A tool is spawned with its placeholders expanded, stdout/stderr captured
//! to log files in its working directory, and then supervised until it
//! exits. Timeout or a fired [`AbortSignal`] stops it with SIGTERM, followed
//! by SIGKILL after the grace period.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{TimingSection, ToolCommand, ToolKind};
use crate::errors::PhaseError;
use crate::phase::{AbortSignal, PhaseName};
use crate::storage;

/// Values substituted into a tool's program and arguments.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    pub input: PathBuf,
    pub output: PathBuf,
    pub run_dir: PathBuf,
    pub workdir: PathBuf,
    pub source: PathBuf,
    pub model: String,
    pub lang: String,
    pub source_lang: String,
}

impl Placeholders {
    fn table(&self) -> [(&'static str, String); 8] {
        [
            ("{input}", self.input.display().to_string()),
            ("{output}", self.output.display().to_string()),
            ("{run_dir}", self.run_dir.display().to_string()),
            ("{workdir}", self.workdir.display().to_string()),
            ("{source}", self.source.display().to_string()),
            ("{model}", self.model.clone()),
            ("{lang}", self.lang.clone()),
            ("{source_lang}", self.source_lang.clone()),
        ]
    }

    /// Replace every known placeholder in `template`.
    pub fn expand(&self, template: &str) -> String {
        self.table()
            .iter()
            .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
    }
}

/// Launches configured tools with timeout and abort supervision.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    tools: BTreeMap<String, ToolCommand>,
    timeout: Duration,
    poll_interval: Duration,
    terminate_grace: Duration,
}

impl ToolRunner {
    pub fn new(tools: BTreeMap<String, ToolCommand>, timing: &TimingSection) -> Self {
        Self {
            tools,
            timeout: timing.phase_timeout(),
            poll_interval: timing.abort_poll_interval(),
            terminate_grace: timing.terminate_grace(),
        }
    }

    pub fn is_configured(&self, kind: ToolKind) -> bool {
        self.tools.contains_key(kind.as_str())
    }

    /// Run `kind` to completion.
    ///
    /// Non-zero exit, timeout and abort are all phase errors.
    pub async fn run(
        &self,
        phase: PhaseName,
        kind: ToolKind,
        vars: &Placeholders,
        abort: &AbortSignal,
    ) -> Result<(), PhaseError> {
        let tool = self
            .tools
            .get(kind.as_str())
            .ok_or_else(|| PhaseError::ToolNotConfigured {
                phase: phase.to_string(),
                tool: kind.to_string(),
            })?;

        storage::ensure_dir(&vars.workdir)?;
        let program = vars.expand(&tool.program);
        let args: Vec<String> = tool.args.iter().map(|a| vars.expand(a)).collect();

        let stdout = log_file(&vars.workdir, kind, "stdout")?;
        let stderr = log_file(&vars.workdir, kind, "stderr")?;

        info!(%phase, tool = %kind, %program, ?args, "Spawning tool");
        let mut child = Command::new(&program)
            .args(&args)
            .envs(&tool.env)
            .env("RUNWRIGHT_PHASE", phase.as_str())
            .env("RUNWRIGHT_RUN_DIR", &vars.run_dir)
            .current_dir(&vars.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PhaseError::ToolSpawn {
                phase: phase.to_string(),
                tool: kind.to_string(),
                source,
            })?;

        let deadline = deadline_after(self.timeout);
        let mut poll = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|source| PhaseError::ToolSpawn {
                        phase: phase.to_string(),
                        tool: kind.to_string(),
                        source,
                    })?;
                    let exit_code = status.code().unwrap_or(-1);
                    info!(%phase, tool = %kind, exit_code, "Tool exited");
                    if status.success() {
                        return Ok(());
                    }
                    return Err(PhaseError::ToolFailed {
                        phase: phase.to_string(),
                        tool: kind.to_string(),
                        exit_code,
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(%phase, tool = %kind, timeout_secs = self.timeout.as_secs(), "Tool timed out");
                    self.terminate(&mut child).await;
                    return Err(PhaseError::ToolTimeout {
                        phase: phase.to_string(),
                        tool: kind.to_string(),
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
                _ = poll.tick() => {
                    if abort.is_aborted() {
                        warn!(%phase, tool = %kind, "Abort requested, stopping tool");
                        self.terminate(&mut child).await;
                        return abort.check(phase);
                    }
                }
            }
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Ok(raw) = i32::try_from(pid) {
                match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    Ok(()) => {
                        if let Ok(Ok(status)) =
                            tokio::time::timeout(self.terminate_grace, child.wait()).await
                        {
                            debug!(?status, "Tool stopped after SIGTERM");
                            return;
                        }
                    }
                    Err(e) => debug!(error = %e, "SIGTERM failed"),
                }
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill tool process");
        }
    }
}

/// Tokio's own cap for "never" when a timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn log_file(workdir: &Path, kind: ToolKind, stream: &str) -> Result<std::fs::File, PhaseError> {
    let path = workdir.join(format!("{kind}.{stream}.log"));
    std::fs::File::create(&path).map_err(|source| {
        PhaseError::State(crate::errors::StateError::Io { path, source })
    })
}

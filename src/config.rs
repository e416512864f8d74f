//! Configuration loaded from `runwright.toml`.
//!
//! Layering is file → environment → CLI. Every section is optional and
//! falls back to built-in defaults, so a run works without any file as long
//! as the external tools it needs are configured.
//!
//! ```toml
//! [timing]
//! heartbeat_interval_secs = 5
//! stale_ttl_secs = 120
//! phase_timeout_secs = 3600
//!
//! [review]
//! max_attempts = 4
//! immediate_manual_review = ["mistranslation_critical", "content_omission"]
//!
//! [review.score_thresholds]
//! accuracy = 0.8
//! fluency = 0.75
//!
//! [tools.translate]
//! program = "./bin/translate"
//! args = ["--model", "{model}", "--lang", "{lang}", "{input}", "{output}"]
//!
//! [profiles.pivot-en-es]
//! pass1_lang = "en"
//! pass2_lang = "es"
//! rework_reentry = "retranslate"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::UsageError;
use crate::lock::LockSettings;
use crate::paragraph::{ReviewPolicy, ReworkReentry};
use crate::paragraph::review::{DEFAULT_IMMEDIATE_MANUAL_REVIEW, DEFAULT_MAX_ATTEMPTS, DEFAULT_SCORE_THRESHOLDS};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "runwright.toml";
/// Profile used when neither the CLI nor the manifest names one.
pub const DEFAULT_PROFILE: &str = "single-en";

/// External collaborators the orchestrator can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ToolKind {
    Ingest,
    Translate,
    Assemble,
    Review,
    Rework,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Ingest => "ingest",
            ToolKind::Translate => "translate",
            ToolKind::Assemble => "assemble",
            ToolKind::Review => "review",
            ToolKind::Rework => "rework",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat, lock and timeout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Must be strictly greater than twice the heartbeat interval.
    #[serde(default = "default_stale_ttl_secs")]
    pub stale_ttl_secs: u64,
    #[serde(default = "default_abort_poll_interval_ms")]
    pub abort_poll_interval_ms: u64,
    /// Consecutive heartbeat failures tolerated before the phase is aborted.
    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,
    /// Time between SIGTERM and SIGKILL when stopping a tool.
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    #[serde(default = "default_lock_retry_base_ms")]
    pub lock_retry_base_ms: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_stale_ttl_secs() -> u64 {
    120
}

fn default_abort_poll_interval_ms() -> u64 {
    500
}

fn default_max_heartbeat_failures() -> u32 {
    3
}

fn default_terminate_grace_secs() -> u64 {
    10
}

fn default_phase_timeout_secs() -> u64 {
    3600
}

fn default_lock_retry_attempts() -> u32 {
    5
}

fn default_lock_retry_base_ms() -> u64 {
    200
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_ttl_secs: default_stale_ttl_secs(),
            abort_poll_interval_ms: default_abort_poll_interval_ms(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
            terminate_grace_secs: default_terminate_grace_secs(),
            phase_timeout_secs: default_phase_timeout_secs(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_base_ms: default_lock_retry_base_ms(),
        }
    }
}

impl TimingSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_secs)
    }

    pub fn abort_poll_interval(&self) -> Duration {
        Duration::from_millis(self.abort_poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            stale_ttl: self.stale_ttl(),
            retry_attempts: self.lock_retry_attempts,
            retry_base: Duration::from_millis(self.lock_retry_base_ms),
        }
    }
}

/// Review policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_score_thresholds")]
    pub score_thresholds: BTreeMap<String, f64>,
    #[serde(default = "default_immediate_manual_review")]
    pub immediate_manual_review: Vec<String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_score_thresholds() -> BTreeMap<String, f64> {
    DEFAULT_SCORE_THRESHOLDS
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

fn default_immediate_manual_review() -> Vec<String> {
    DEFAULT_IMMEDIATE_MANUAL_REVIEW
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            score_thresholds: default_score_thresholds(),
            immediate_manual_review: default_immediate_manual_review(),
        }
    }
}

impl ReviewSection {
    pub fn to_policy(&self) -> ReviewPolicy {
        ReviewPolicy {
            max_attempts: self.max_attempts,
            score_thresholds: self.score_thresholds.clone(),
            immediate_manual_review: self
                .immediate_manual_review
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>(),
        }
    }
}

/// Command line for one external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    /// Arguments; `{input}`, `{output}`, `{run_dir}`, `{model}`, `{lang}`,
    /// `{source_lang}` and `{workdir}` are substituted per invocation.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A pipeline profile: pass languages and the rework re-entry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub pass1_lang: String,
    #[serde(default)]
    pub pass2_lang: Option<String>,
    #[serde(default = "default_source_lang")]
    pub source_lang: String,
    #[serde(default)]
    pub rework_reentry: ReworkReentry,
}

fn default_source_lang() -> String {
    "auto".to_string()
}

impl Profile {
    fn preset(pass1: &str, pass2: Option<&str>, reentry: ReworkReentry) -> Self {
        Self {
            pass1_lang: pass1.to_string(),
            pass2_lang: pass2.map(str::to_string),
            source_lang: default_source_lang(),
            rework_reentry: reentry,
        }
    }

    /// Language of the final text.
    pub fn target_lang(&self) -> &str {
        self.pass2_lang.as_deref().unwrap_or(&self.pass1_lang)
    }
}

/// Built-in pipeline profiles. File profiles with the same name replace these.
pub fn builtin_profiles() -> BTreeMap<String, Profile> {
    use ReworkReentry::{Retranslate, Review};
    [
        ("single-en", Profile::preset("en", None, Retranslate)),
        ("pivot-en-de", Profile::preset("en", Some("de"), Retranslate)),
        ("pivot-en-fr", Profile::preset("en", Some("fr"), Retranslate)),
        ("polish-en", Profile::preset("en", None, Review)),
    ]
    .into_iter()
    .map(|(name, profile)| (name.to_string(), profile))
    .collect()
}

/// The complete `runwright.toml` structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunwrightToml {
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolCommand>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl RunwrightToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid runwright.toml")
    }

    /// Load `explicit` if given, else `./runwright.toml` if present, else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok((Self::load(&local)?, Some(local)));
        }
        Ok((Self::default(), None))
    }

    /// Built-in profiles overlaid with the file's profiles.
    pub fn profiles(&self) -> BTreeMap<String, Profile> {
        let mut all = builtin_profiles();
        all.extend(self.profiles.clone());
        all
    }

    pub fn profile(&self, name: &str) -> Result<Profile, UsageError> {
        self.profiles()
            .remove(name)
            .ok_or_else(|| UsageError::UnknownProfile(name.to_string()))
    }

    /// Apply CLI overrides.
    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Result<(), UsageError> {
        if let Some(attempts) = overrides.max_paragraph_attempts {
            self.review.max_attempts = u32::try_from(attempts)
                .ok()
                .filter(|a| *a > 0)
                .ok_or_else(|| {
                    UsageError::InvalidPolicy(format!(
                        "--max-paragraph-attempts must be a positive integer, got {attempts}"
                    ))
                })?;
        }
        if let Some(timeout) = overrides.phase_timeout_seconds {
            self.timing.phase_timeout_secs = u64::try_from(timeout)
                .ok()
                .filter(|t| *t > 0)
                .ok_or_else(|| {
                    UsageError::InvalidPolicy(format!(
                        "--phase-timeout-seconds must be a positive integer, got {timeout}"
                    ))
                })?;
        }
        Ok(())
    }

    /// Validate the configuration. Returns a list of problems, empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let t = &self.timing;

        if t.heartbeat_interval_secs == 0 {
            problems.push("timing.heartbeat_interval_secs must be positive".to_string());
        }
        if t.stale_ttl_secs <= t.heartbeat_interval_secs.saturating_mul(2) {
            problems.push(format!(
                "timing.stale_ttl_secs ({}) must be greater than twice heartbeat_interval_secs ({})",
                t.stale_ttl_secs, t.heartbeat_interval_secs
            ));
        }
        if t.abort_poll_interval_ms == 0 {
            problems.push("timing.abort_poll_interval_ms must be positive".to_string());
        }
        if t.max_heartbeat_failures == 0 {
            problems.push("timing.max_heartbeat_failures must be at least 1".to_string());
        }
        if t.phase_timeout_secs == 0 {
            problems.push("timing.phase_timeout_secs must be positive".to_string());
        }
        if self.review.max_attempts == 0 {
            problems.push("review.max_attempts must be at least 1".to_string());
        }
        for (metric, threshold) in &self.review.score_thresholds {
            if !threshold.is_finite() {
                problems.push(format!("review.score_thresholds.{metric} must be a finite number"));
            }
        }
        for (name, tool) in &self.tools {
            if !matches!(
                name.as_str(),
                "ingest" | "translate" | "assemble" | "review" | "rework"
            ) {
                problems.push(format!("tools.{name} is not a known tool"));
            }
            if tool.program.trim().is_empty() {
                problems.push(format!("tools.{name}.program must not be empty"));
            }
        }
        for (name, profile) in &self.profiles {
            if profile.pass1_lang.trim().is_empty() {
                problems.push(format!("profiles.{name}.pass1_lang must not be empty"));
            }
        }
        problems
    }

    /// Validate, converting any problem into a usage error.
    pub fn ensure_valid(&self) -> Result<(), UsageError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(UsageError::Config(problems.join("; ")))
        }
    }
}

/// CLI values layered over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_paragraph_attempts: Option<i64>,
    pub phase_timeout_seconds: Option<i64>,
}

/// Runs root from `--runs-dir`, then `RUNWRIGHT_RUNS_DIR`, then `./runs`.
pub fn runs_root(cli: Option<&Path>) -> PathBuf {
    if let Some(dir) = cli {
        return dir.to_path_buf();
    }
    std::env::var_os("RUNWRIGHT_RUNS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("runs"))
}

//! Typed error hierarchy for the run orchestrator.
//!
//! Four families cover the failure classes a caller has to branch on:
//! - `LockError`: run lock conflicts, corruption and lost ownership
//! - `StateError`: persisted state that is inconsistent or corrupt
//! - `PhaseError`: failures while executing a phase
//! - `UsageError`: invalid invocation or policy, rejected before any work
//!
//! `RunError` is the closed sum of the four and owns the exit-code mapping.
//! Plain filesystem failures (`LockError::Io`, `StateError::Io`) are not
//! evidence of a bad lock or corrupt state; they exit like a failed phase and
//! the run resumes on the next invocation.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a failed phase (including a blocked merge gate) and for I/O failures.
pub const EXIT_PHASE_FAILURE: i32 = 1;
/// Exit code for usage and policy validation errors.
pub const EXIT_USAGE: i32 = 2;
/// Exit code when another live process holds the run lock.
pub const EXIT_ACTIVE_LOCK: i32 = 3;
/// Exit code for an unreadable, foreign or lost run lock.
pub const EXIT_INVALID_LOCK: i32 = 4;
/// Exit code when lock acquisition kept losing races against other waiters.
pub const EXIT_LOCK_RACE: i32 = 5;
/// Exit code for corrupt or inconsistent persisted state.
pub const EXIT_CORRUPT_STATE: i32 = 6;

/// Errors from the run lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("run lock is held by {holder} (last heartbeat {heartbeat_age_secs}s ago)")]
    Active {
        holder: String,
        heartbeat_age_secs: i64,
    },

    #[error("invalid run lock at {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("gave up acquiring run lock after {attempts} contended attempts")]
    Race { attempts: u32 },

    #[error("run lock ownership lost: {reason}")]
    Lost { reason: String },

    #[error("run lock I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised when persisted state fails a consistency check.
///
/// None of these are ever auto-corrected.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("manifest drift on '{field}': run recorded {recorded:?}, invocation requested {requested:?}")]
    ManifestDrift {
        field: String,
        recorded: String,
        requested: String,
    },

    #[error("content hash lineage mismatch for {paragraph_id} at {stage}: expected {expected}, found {actual}")]
    LineageMismatch {
        paragraph_id: String,
        stage: String,
        expected: String,
        actual: String,
    },

    #[error("illegal transition for {paragraph_id}: {from} -> {to}")]
    IllegalTransition {
        paragraph_id: String,
        from: String,
        to: String,
    },

    #[error("excluded paragraph {paragraph_id} cannot enter active state {to}")]
    ExcludedParagraphActivation { paragraph_id: String, to: String },

    #[error("duplicate paragraph id {paragraph_id} in {file}")]
    DuplicateParagraph { paragraph_id: String, file: PathBuf },

    #[error("unknown paragraph id {paragraph_id} in {context}")]
    UnknownParagraph {
        paragraph_id: String,
        context: String,
    },

    #[error("paragraph {paragraph_id} missing from {context}")]
    MissingParagraph {
        paragraph_id: String,
        context: String,
    },

    #[error("corrupt state file {path} (line {line}): {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("required artifact missing: {path}")]
    MissingArtifact { path: PathBuf },

    #[error("state I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{phase}: tool '{tool}' exited with code {exit_code}")]
    ToolFailed {
        phase: String,
        tool: String,
        exit_code: i32,
    },

    #[error("{phase}: tool '{tool}' failed to start: {source}")]
    ToolSpawn {
        phase: String,
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{phase}: tool '{tool}' timed out after {timeout_secs}s")]
    ToolTimeout {
        phase: String,
        tool: String,
        timeout_secs: u64,
    },

    #[error("{phase}: no command configured for tool '{tool}'")]
    ToolNotConfigured { phase: String, tool: String },

    #[error("{phase}: aborted: {reason}")]
    Aborted { phase: String, reason: String },

    #[error("merge gate blocked by {} issue(s): {}", .blockers.len(), .blockers.join(", "))]
    MergeBlocked { blockers: Vec<String> },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Invocation or policy errors, rejected before any work begins.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("invalid run id '{0}': must match [A-Za-z0-9][A-Za-z0-9._-]{{0,63}}")]
    InvalidRunId(String),

    #[error("--{0} is required for a new full run")]
    MissingArgument(&'static str),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("unknown pipeline profile '{0}'")]
    UnknownProfile(String),

    #[error("run '{0}' has not completed its initial cycle; run --mode full first")]
    RunNotInitialized(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Top-level error returned by a run invocation.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Phase(PhaseError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl From<PhaseError> for RunError {
    /// Lift lock and state failures out of a phase so they keep their own exit codes.
    fn from(err: PhaseError) -> Self {
        match err {
            PhaseError::State(e) => RunError::State(e),
            PhaseError::Lock(e) => RunError::Lock(e),
            other => RunError::Phase(other),
        }
    }
}

impl RunError {
    /// Exit code for this error's failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Lock(LockError::Io { .. }) | RunError::State(StateError::Io { .. }) => {
                EXIT_PHASE_FAILURE
            }
            RunError::Lock(LockError::Active { .. }) => EXIT_ACTIVE_LOCK,
            RunError::Lock(LockError::Race { .. }) => EXIT_LOCK_RACE,
            RunError::Lock(_) => EXIT_INVALID_LOCK,
            RunError::State(_) => EXIT_CORRUPT_STATE,
            RunError::Phase(_) => EXIT_PHASE_FAILURE,
            RunError::Usage(_) => EXIT_USAGE,
        }
    }

    /// Short label used in the one-line CLI summary.
    pub fn class(&self) -> &'static str {
        match self {
            RunError::Lock(LockError::Io { .. }) | RunError::State(StateError::Io { .. }) => {
                "io error"
            }
            RunError::Lock(LockError::Active { .. }) => "active lock",
            RunError::Lock(LockError::Race { .. }) => "lock race",
            RunError::Lock(_) => "invalid lock",
            RunError::State(_) => "corrupt state",
            RunError::Phase(_) => "phase failed",
            RunError::Usage(_) => "usage",
        }
    }
}

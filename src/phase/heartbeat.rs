//! Background heartbeat and cooperative abort.
//!
//! [`HeartbeatSupervisor`] runs alongside the active phase. Every tick it
//! calls [`Heartbeat::beat`], which refreshes the run lock and the progress
//! record. The supervisor trips the shared [`AbortSignal`] when:
//! - a beat reports lost lock ownership,
//! - `max_failures` consecutive beats fail, or
//! - no beat has succeeded within the stall margin (stale TTL minus one interval).
//!
//! Phases poll the signal and stop any external process they launched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::PhaseName;
use crate::errors::PhaseError;

/// Failure of a single heartbeat.
#[derive(Debug, thiserror::Error)]
pub enum BeatError {
    /// Ownership can no longer be proven; stop immediately.
    #[error("{0}")]
    Fatal(String),
    /// May succeed on the next tick.
    #[error("{0}")]
    Transient(String),
}

/// One heartbeat: refresh whatever proves the run is alive.
pub trait Heartbeat: Send + Sync + 'static {
    fn beat(&self) -> Result<(), BeatError>;
}

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Shared cancellation flag with the reason of the first trigger.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortState>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Only the first reason is kept.
    pub fn trigger(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.inner.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// `Err(PhaseError::Aborted)` once the signal has fired.
    pub fn check(&self, phase: PhaseName) -> Result<(), PhaseError> {
        if self.is_aborted() {
            return Err(PhaseError::Aborted {
                phase: phase.to_string(),
                reason: self.reason().unwrap_or_else(|| "abort requested".to_string()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub max_failures: u32,
    pub stale_ttl: Duration,
}

impl HeartbeatSettings {
    /// Longest tolerated gap between successful beats.
    pub fn stall_margin(&self) -> Duration {
        self.stale_ttl
            .saturating_sub(self.interval)
            .max(self.interval)
    }
}

/// Handle to the running heartbeat task.
pub struct HeartbeatSupervisor {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatSupervisor {
    pub fn start(target: Arc<dyn Heartbeat>, settings: HeartbeatSettings, abort: AbortSignal) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(target, settings, abort, stop_rx));
        Self { stop_tx, task }
    }

    /// Stop the heartbeat loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}

async fn supervise(
    target: Arc<dyn Heartbeat>,
    settings: HeartbeatSettings,
    abort: AbortSignal,
    mut stop_rx: watch::Receiver<bool>,
) {
    let margin = settings.stall_margin();
    let mut failures = 0u32;
    let mut last_ok = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(settings.interval) => {}
            _ = stop_rx.changed() => break,
        }

        let beat_target = Arc::clone(&target);
        let outcome = tokio::time::timeout(
            margin,
            tokio::task::spawn_blocking(move || beat_target.beat()),
        )
        .await;

        match outcome {
            Ok(Ok(Ok(()))) => {
                failures = 0;
                last_ok = Instant::now();
                debug!("Heartbeat ok");
            }
            Ok(Ok(Err(BeatError::Fatal(reason)))) => {
                error!(%reason, "Heartbeat lost lock ownership");
                abort.trigger(format!("lock ownership lost: {reason}"));
                break;
            }
            Ok(Ok(Err(BeatError::Transient(reason)))) => {
                failures += 1;
                warn!(%reason, failures, "Heartbeat failed");
            }
            Ok(Err(join_err)) => {
                failures += 1;
                warn!(error = %join_err, failures, "Heartbeat task failed");
            }
            Err(_) => {
                error!(margin_secs = margin.as_secs(), "Heartbeat write stalled");
                abort.trigger(format!(
                    "heartbeat write stalled for more than {}s",
                    margin.as_secs()
                ));
                break;
            }
        }

        if failures >= settings.max_failures.max(1) {
            abort.trigger(format!("{failures} consecutive heartbeat failures"));
            break;
        }
        if last_ok.elapsed() > margin {
            abort.trigger(format!(
                "no successful heartbeat for {}s",
                last_ok.elapsed().as_secs()
            ));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Scripted {
        calls: AtomicU32,
        fail_from: u32,
        fatal: bool,
    }

    impl Heartbeat for Scripted {
        fn beat(&self) -> Result<(), BeatError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_from {
                Ok(())
            } else if self.fatal {
                Err(BeatError::Fatal("lock inode changed".into()))
            } else {
                Err(BeatError::Transient("disk full".into()))
            }
        }
    }

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(10),
            max_failures: 3,
            stale_ttl: Duration::from_secs(30),
        }
    }

    async fn wait_for_abort(abort: &AbortSignal) {
        for _ in 0..500 {
            if abort.is_aborted() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("abort signal never fired");
    }

    #[test]
    fn test_abort_signal_keeps_first_reason() {
        let abort = AbortSignal::new();
        assert!(abort.check(PhaseName::Review).is_ok());
        abort.trigger("first");
        abort.trigger("second");
        assert_eq!(abort.reason().as_deref(), Some("first"));
        match abort.check(PhaseName::Review) {
            Err(PhaseError::Aborted { phase, reason }) => {
                assert_eq!(phase, "review");
                assert_eq!(reason, "first");
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
    }

    #[test]
    fn test_stall_margin_stays_under_ttl() {
        let s = HeartbeatSettings {
            interval: Duration::from_secs(5),
            max_failures: 3,
            stale_ttl: Duration::from_secs(120),
        };
        assert_eq!(s.stall_margin(), Duration::from_secs(115));
    }

    #[tokio::test]
    async fn test_healthy_heartbeat_never_aborts() {
        let target = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            fail_from: u32::MAX,
            fatal: false,
        });
        let abort = AbortSignal::new();
        let supervisor = HeartbeatSupervisor::start(target.clone(), settings(), abort.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop().await;
        assert!(!abort.is_aborted());
        assert!(target.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_consecutive_failures_trip_abort() {
        let target = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            fail_from: 1,
            fatal: false,
        });
        let abort = AbortSignal::new();
        let supervisor = HeartbeatSupervisor::start(target.clone(), settings(), abort.clone());

        wait_for_abort(&abort).await;
        supervisor.stop().await;
        assert!(abort.reason().unwrap().contains("3 consecutive heartbeat failures"));
        assert_eq!(target.calls.load(Ordering::SeqCst), 4);
    }

    struct Blocking(Duration);

    impl Heartbeat for Blocking {
        fn beat(&self) -> Result<(), BeatError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    fn tight_settings(max_failures: u32) -> HeartbeatSettings {
        // Stall margin is 40ms.
        HeartbeatSettings {
            interval: Duration::from_millis(10),
            max_failures,
            stale_ttl: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_stalled_beat_trips_abort() {
        let abort = AbortSignal::new();
        let supervisor = HeartbeatSupervisor::start(
            Arc::new(Blocking(Duration::from_millis(400))),
            tight_settings(3),
            abort.clone(),
        );

        wait_for_abort(&abort).await;
        supervisor.stop().await;
        assert!(abort.reason().unwrap().contains("heartbeat write stalled"));
    }

    #[tokio::test]
    async fn test_no_success_within_margin_trips_abort() {
        let target = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            fail_from: 0,
            fatal: false,
        });
        let abort = AbortSignal::new();
        let supervisor =
            HeartbeatSupervisor::start(target.clone(), tight_settings(1000), abort.clone());

        wait_for_abort(&abort).await;
        supervisor.stop().await;
        assert!(abort.reason().unwrap().contains("no successful heartbeat"));
        assert!(target.calls.load(Ordering::SeqCst) < 1000);
    }

    #[tokio::test]
    async fn test_fatal_beat_aborts_immediately() {
        let target = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            fail_from: 0,
            fatal: true,
        });
        let abort = AbortSignal::new();
        let supervisor = HeartbeatSupervisor::start(target.clone(), settings(), abort.clone());

        wait_for_abort(&abort).await;
        supervisor.stop().await;
        assert!(abort.reason().unwrap().contains("lock ownership lost"));
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }
}

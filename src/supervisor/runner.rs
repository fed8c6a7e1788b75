//! Process-level supervisor
//!
//! Runs the application as a spawned task so an escaping error or panic ends only
//! that run. The crash handler decides whether to restart; the supervisor sleeps the
//! backoff and builds a fresh instance through the factory.
//!
//! ```text
//! Running -> Crashed -> Restarting -> Running
//!                    \-> Stopped
//! ```

use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{info, warn};

use super::crash_handler::{CrashCause, CrashHandler, RestartDecision, StopReason};
use crate::error::{panic_message, Result};

/// Exit status when restart attempts are exhausted
pub const EXIT_GAVE_UP: i32 = 70;
/// Exit status for errors a restart cannot fix
pub const EXIT_NON_RETRYABLE: i32 = 78;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Running,
    Crashed,
    Restarting,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Crashed => write!(f, "crashed"),
            SupervisorState::Restarting => write!(f, "restarting"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The application returned `Ok(())`
    Completed,
    /// A stop was requested
    Stopped,
    GaveUp { attempts: u32 },
    NonRetryable { kind: String },
}

impl SupervisorOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorOutcome::Completed | SupervisorOutcome::Stopped => 0,
            SupervisorOutcome::GaveUp { .. } => EXIT_GAVE_UP,
            SupervisorOutcome::NonRetryable { .. } => EXIT_NON_RETRYABLE,
        }
    }
}

impl From<StopReason> for SupervisorOutcome {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::GaveUp { attempts } => SupervisorOutcome::GaveUp { attempts },
            StopReason::NonRetryable { kind } => SupervisorOutcome::NonRetryable { kind },
        }
    }
}

/// Cheap clonable handle that asks the supervisor to stop
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Stop notification handed to each application run
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Signal driven by any `watch` channel; `true` means stop
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested
    pub async fn wait(&mut self) {
        // An error means the supervisor is gone, which is also a stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Passed to the factory for every run
pub struct RunContext {
    pub run_number: u32,
    pub shutdown: ShutdownSignal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub state: SupervisorState,
    pub runs_started: u32,
    pub stable_runs: u32,
    pub uptime_secs: u64,
    pub current_run_secs: Option<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    runs_started: u32,
    stable_runs: u32,
    run_started: Option<Instant>,
}

enum RunEnd {
    Completed,
    Stopped,
    Failed(CrashCause),
}

pub struct Supervisor {
    handler: Arc<CrashHandler>,
    state_tx: watch::Sender<SupervisorState>,
    stop_tx: Arc<watch::Sender<bool>>,
    counters: Mutex<Counters>,
    created: Instant,
}

impl Supervisor {
    pub fn new(handler: Arc<CrashHandler>) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        let (stop_tx, _) = watch::channel(false);
        Self {
            handler,
            state_tx,
            stop_tx: Arc::new(stop_tx),
            counters: Mutex::new(Counters::default()),
            created: Instant::now(),
        }
    }

    pub fn crash_handler(&self) -> &Arc<CrashHandler> {
        &self.handler
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    pub fn stats(&self) -> SupervisorStats {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        SupervisorStats {
            state: self.state(),
            runs_started: counters.runs_started,
            stable_runs: counters.stable_runs,
            uptime_secs: self.created.elapsed().as_secs(),
            current_run_secs: counters.run_started.map(|t| t.elapsed().as_secs()),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Supervise runs produced by `factory` until one completes, a stop is
    /// requested, or the crash handler gives up.
    pub async fn run<F, Fut>(&self, mut factory: F) -> SupervisorOutcome
    where
        F: FnMut(RunContext) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut run_number = 0u32;

        loop {
            if self.stop_requested() {
                return self.finish(SupervisorOutcome::Stopped);
            }

            run_number += 1;
            {
                let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
                counters.runs_started += 1;
                counters.run_started = Some(Instant::now());
            }
            self.handler.note_running();
            self.set_state(SupervisorState::Running);
            info!(run = run_number, "Starting application");

            let handle = tokio::spawn(factory(RunContext {
                run_number,
                shutdown: ShutdownSignal {
                    rx: self.stop_tx.subscribe(),
                },
            }));

            let cause = match self.watch_run(handle, &mut stop_rx).await {
                RunEnd::Completed => {
                    info!(run = run_number, "Application finished cleanly");
                    return self.finish(SupervisorOutcome::Completed);
                }
                RunEnd::Stopped => return self.finish(SupervisorOutcome::Stopped),
                RunEnd::Failed(cause) => cause,
            };

            self.set_state(SupervisorState::Crashed);
            match self.handler.handle_crash(&cause).await {
                RestartDecision::Restart { attempt, delay } => {
                    self.set_state(SupervisorState::Restarting);
                    info!(attempt, delay_secs = delay.as_secs(), "Waiting before restart");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_signalled(&mut stop_rx) => {
                            return self.finish(SupervisorOutcome::Stopped);
                        }
                    }
                }
                RestartDecision::Stop(reason) => return self.finish(reason.into()),
            }
        }
    }

    async fn watch_run(
        &self,
        mut handle: JoinHandle<Result<()>>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> RunEnd {
        let stable_after = self.handler.config().stable_after();
        let stable = async {
            match stable_after {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(stable);
        let mut stable_reached = false;

        loop {
            tokio::select! {
                joined = &mut handle => {
                    // Whatever a run does after a stop request is part of stopping.
                    if self.stop_requested() {
                        return RunEnd::Stopped;
                    }
                    return classify(joined);
                }
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    self.counters.lock().unwrap_or_else(PoisonError::into_inner).stable_runs += 1;
                    self.handler.reset_attempts();
                }
                _ = stop_signalled(stop_rx) => {
                    return self.shutdown_run(handle).await;
                }
            }
        }
    }

    async fn shutdown_run(&self, mut handle: JoinHandle<Result<()>>) -> RunEnd {
        let grace = self.handler.config().shutdown_grace();
        info!(grace_secs = grace.as_secs(), "Stop requested, waiting for application");
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(Err(e))) => warn!(error = %e, "Application returned an error while stopping"),
            Ok(Err(e)) if e.is_panic() => warn!("Application panicked while stopping"),
            Ok(_) => {}
            Err(_) => {
                warn!("Application did not stop within the grace period, aborting");
                handle.abort();
            }
        }
        RunEnd::Stopped
    }

    fn finish(&self, outcome: SupervisorOutcome) -> SupervisorOutcome {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .run_started = None;
        self.set_state(SupervisorState::Stopped);
        info!(?outcome, exit_code = outcome.exit_code(), "Supervisor stopped");
        outcome
    }
}

/// Resolve once a stop is requested. The channel's read guard is released before
/// this returns, so a later `send_replace` never waits on it.
async fn stop_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn classify(joined: std::result::Result<Result<()>, JoinError>) -> RunEnd {
    match joined {
        Ok(Ok(())) => RunEnd::Completed,
        Ok(Err(e)) => RunEnd::Failed(CrashCause::Error(e)),
        Err(e) if e.is_panic() => {
            RunEnd::Failed(CrashCause::Panic(panic_message(e.into_panic().as_ref())))
        }
        Err(_) => RunEnd::Failed(CrashCause::Panic("application task was cancelled".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotError;
    use crate::supervisor::crash_handler::SupervisorConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn handler(config: SupervisorConfig) -> Arc<CrashHandler> {
        Arc::new(CrashHandler::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_return_completes() {
        let supervisor = Supervisor::new(handler(SupervisorConfig::default()));
        let outcome = supervisor.run(|_| async { Ok(()) }).await;
        assert_eq!(outcome, SupervisorOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_caught_and_restarted() {
        let supervisor = Supervisor::new(handler(SupervisorConfig::default()));
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let outcome = supervisor
            .run(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("unexpected gateway payload");
                    }
                    Ok(())
                }
            })
            .await;

        assert_eq!(outcome, SupervisorOutcome::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let crashes = supervisor.crash_handler().recent_crashes(5);
        assert_eq!(crashes[0].error_kind, "panic");
        assert!(crashes[0].summary.contains("unexpected gateway payload"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_without_restart() {
        let supervisor = Supervisor::new(handler(SupervisorConfig::default()));
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let outcome = supervisor
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(BotError::InvalidConfig("platform.token is empty".into())) }
            })
            .await;

        assert_eq!(
            outcome,
            SupervisorOutcome::NonRetryable {
                kind: "config".into()
            }
        );
        assert_eq!(outcome.exit_code(), EXIT_NON_RETRYABLE);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_run_resets_attempts() {
        let supervisor = Supervisor::new(handler(SupervisorConfig {
            max_restart_attempts: 1,
            stable_after_secs: Some(60),
            ..Default::default()
        }));
        let runs = Arc::new(AtomicU32::new(0));

        // crash fast, then run past stable_after and crash, then crash fast again
        let counter = runs.clone();
        let outcome = supervisor
            .run(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 1 {
                        tokio::time::sleep(Duration::from_secs(120)).await;
                    }
                    Err(BotError::Internal(format!("run {n} failed")))
                }
            })
            .await;

        // Without the reset the second crash would already exceed the limit.
        assert_eq!(outcome, SupervisorOutcome::GaveUp { attempts: 1 });
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.stats().stable_runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_run_is_not_a_crash() {
        let supervisor = Supervisor::new(handler(SupervisorConfig::default()));
        let stop = supervisor.stop_handle();

        let outcome = tokio::join!(
            supervisor.run(|mut ctx| async move {
                ctx.shutdown.wait().await;
                Ok(())
            }),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                stop.stop();
            }
        )
        .0;

        assert_eq!(outcome, SupervisorOutcome::Stopped);
        assert_eq!(supervisor.crash_handler().restart_stats().total_crashes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_unresponsive_run_after_grace() {
        let supervisor = Supervisor::new(handler(SupervisorConfig {
            shutdown_grace_secs: 3,
            ..Default::default()
        }));
        let stop = supervisor.stop_handle();
        let started = Instant::now();

        let outcome = tokio::join!(
            supervisor.run(|_| async {
                std::future::pending::<()>().await;
                Ok(())
            }),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                stop.stop();
            }
        )
        .0;

        assert_eq!(outcome, SupervisorOutcome::Stopped);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_stop_during_grace_period() {
        let supervisor = Arc::new(Supervisor::new(handler(SupervisorConfig {
            shutdown_grace_secs: 3,
            ..Default::default()
        })));
        let stop = supervisor.stop_handle();
        let started = Instant::now();

        let running = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move {
                supervisor
                    .run(|_| async {
                        std::future::pending::<()>().await;
                        Ok(())
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.stop();
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.stop();

        let outcome = running.await.unwrap();
        assert_eq!(outcome, SupervisorOutcome::Stopped);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3_200));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_published() {
        let supervisor = Supervisor::new(handler(SupervisorConfig::default()));
        let rx = supervisor.subscribe();
        assert_eq!(*rx.borrow(), SupervisorState::Idle);

        supervisor.run(|_| async { Ok(()) }).await;

        assert_eq!(*rx.borrow(), SupervisorState::Stopped);
        assert_eq!(supervisor.stats().runs_started, 1);
    }
}

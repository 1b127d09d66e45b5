//! Keeps a long-running operation alive across transient failures.
//!
//! ```text
//!          ┌───────────────┐  Ok(Continue)  (streak reset)
//!   ┌─────▶│  operation()  │───────────────────────┐
//!   │      └───────┬───────┘                       │
//!   │              │ Err(retryable)                │
//!   │              ▼                               │
//!   │      failures += 1 ── failures == attempts ──┼──▶ RetryExhausted
//!   │              │                               │
//!   │              ▼                               │
//!   └──── pause(backoff.delay(failures)) ◀─────────┘
//! ```
//!
//! `Ok(Break)` ends the run. Non-retryable errors propagate untouched.
//! An operation that never returns `Ok`, such as a streaming session, marks
//! its [`Progress`] once it has done useful work; its eventual failure then
//! starts a fresh streak.
//! Cancellation interrupts both the operation and the pause.

use std::future::Future;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use crate::config::TransportConfig;
use crate::error::{Error, Result};

pub const KEY_ATTEMPTS: &str = "retryAttempts";
pub const KEY_BASE_MS: &str = "retryBaseMs";
pub const KEY_JITTER: &str = "retryJitter";
pub const KEY_MAX_DELAY_MS: &str = "retryMaxDelayMs";
pub const KEY_STABLE_AFTER_MS: &str = "stableAfterMs";
pub const KEY_ON_EXHAUSTED: &str = "onExhausted";

const KNOWN_KEYS: &[&str] = &[
    KEY_ATTEMPTS,
    KEY_BASE_MS,
    KEY_JITTER,
    KEY_MAX_DELAY_MS,
    KEY_STABLE_AFTER_MS,
    KEY_ON_EXHAUSTED,
];

/// What to do once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Unattended streamer: nothing useful is left to do.
    ExitProcess { code: i32 },
    /// Server-embedded task: log and let the rest of the process run.
    AbandonTask,
}

impl FromStr for Escalation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exit" => Ok(Escalation::ExitProcess { code: 1 }),
            "abandon" => Ok(Escalation::AbandonTask),
            other => Err(Error::Configuration(format!(
                "unknown escalation '{}' (expected exit or abandon)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Invocations allowed in one failure streak.
    pub attempts: u32,
    pub backoff: Backoff,
    /// A failure after running this long starts a fresh streak.
    pub stable_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Backoff::default(),
            stable_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorConfig {
    pub policy: RetryPolicy,
    pub escalation: Escalation,
}

impl SupervisorConfig {
    pub fn new(escalation: Escalation) -> Self {
        Self {
            policy: RetryPolicy::default(),
            escalation,
        }
    }

    /// Reads the supervisor keys; absent keys keep their defaults and
    /// `default_escalation` applies unless `onExhausted` is set.
    pub fn from_config(config: &TransportConfig, default_escalation: Escalation) -> Result<Self> {
        config.ensure_known(KNOWN_KEYS)?;
        let defaults = RetryPolicy::default();
        let defaults_backoff = defaults.backoff;

        let attempts = config
            .bounded(KEY_ATTEMPTS, 1, 1000)?
            .map_or(defaults.attempts, |n| n as u32);
        let base = config.millis(KEY_BASE_MS)?.unwrap_or(defaults_backoff.base());
        let jitter = match config.float(KEY_JITTER)? {
            Some(j) if !(0.0..=10.0).contains(&j) => {
                return Err(Error::Configuration(format!(
                    "{} must be within 0..=10, got {}",
                    KEY_JITTER, j
                )));
            }
            Some(j) => j,
            None => defaults_backoff.jitter(),
        };
        let max = config
            .millis(KEY_MAX_DELAY_MS)?
            .unwrap_or(Duration::from_secs(60));
        let stable_after = config
            .millis(KEY_STABLE_AFTER_MS)?
            .unwrap_or(defaults.stable_after);
        let escalation = match config.text(KEY_ON_EXHAUSTED)? {
            Some(text) => text.parse()?,
            None => default_escalation,
        };

        Ok(Self {
            policy: RetryPolicy {
                attempts,
                backoff: Backoff::new(base, jitter, max),
                stable_after,
            },
            escalation,
        })
    }
}

/// Failure streak bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryState {
    failures: u32,
    total_failures: u64,
    recoveries: u64,
}

impl RetryState {
    /// Counts one failure, returning the streak length.
    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.total_failures += 1;
        self.failures
    }

    pub fn reset(&mut self) {
        if self.failures > 0 {
            self.recoveries += 1;
        }
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }
}

/// The suspend side of backoff, kept apart from the delay math.
pub trait Pause: Send + Sync {
    fn pause(&self, delay: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPause;

impl Pause for TokioPause {
    fn pause(&self, delay: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(delay)
    }
}

/// Shared flag an operation sets after it has done useful work.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicBool>);

impl Progress {
    pub fn mark(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the current attempt has marked progress yet.
    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

pub struct Supervisor<P = TokioPause> {
    name: String,
    progress: Progress,
    policy: RetryPolicy,
    escalation: Escalation,
    cancel: CancellationToken,
    pause: P,
    rng: StdRng,
    state: RetryState,
}

impl Supervisor<TokioPause> {
    pub fn new(name: impl Into<String>, config: SupervisorConfig) -> Self {
        Self {
            name: name.into(),
            progress: Progress::default(),
            policy: config.policy,
            escalation: config.escalation,
            cancel: CancellationToken::new(),
            pause: TokioPause,
            rng: StdRng::from_entropy(),
            state: RetryState::default(),
        }
    }
}

impl<P: Pause> Supervisor<P> {
    pub fn with_pause<Q: Pause>(self, pause: Q) -> Supervisor<Q> {
        Supervisor {
            name: self.name,
            progress: self.progress,
            policy: self.policy,
            escalation: self.escalation,
            cancel: self.cancel,
            pause,
            rng: self.rng,
            state: self.state,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Shares an external stop signal, e.g. the process shutdown token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle for the operation to report progress through.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Drives `operation` until it breaks, fails terminally or is cancelled.
    pub async fn run<F, Fut>(&mut self, mut operation: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ControlFlow<()>>>,
    {
        loop {
            if self.cancel.is_cancelled() {
                info!("{}: cancelled", self.name);
                return Ok(());
            }

            self.progress.take();
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("{}: cancelled", self.name);
                    return Ok(());
                }
                outcome = operation() => outcome,
            };

            let err = match outcome {
                Ok(ControlFlow::Break(())) => return Ok(()),
                Ok(ControlFlow::Continue(())) => {
                    self.state.reset();
                    continue;
                }
                Err(e) if !e.is_retryable() => {
                    error!("{}: failed with a non-retryable error: {}", self.name, e);
                    return Err(e);
                }
                Err(e) => e,
            };

            let progressed = self.progress.take();
            if progressed || started.elapsed() >= self.policy.stable_after {
                self.state.reset();
            }
            let failures = self.state.record_failure();

            if failures >= self.policy.attempts {
                error!(
                    "{}: giving up after {} attempts, last error: {}",
                    self.name, failures, err
                );
                return Err(Error::RetryExhausted {
                    operation: self.name.clone(),
                    attempts: failures,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.backoff.delay(failures, &mut self.rng);
            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {:.2}s",
                self.name,
                failures,
                self.policy.attempts,
                err,
                delay.as_secs_f64()
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("{}: cancelled during backoff", self.name);
                    return Ok(());
                }
                _ = self.pause.pause(delay) => {}
            }
        }
    }

    /// Applies the escalation policy to a terminal error.
    pub fn escalate(&self, err: &Error) {
        match self.escalation {
            Escalation::ExitProcess { code } => {
                error!("{}: {}; exiting with status {}", self.name, err, code);
                std::process::exit(code);
            }
            Escalation::AbandonTask => {
                error!("{}: {}; task abandoned, process continues", self.name, err);
            }
        }
    }
}

impl<P: Pause + 'static> Supervisor<P> {
    /// Runs on a background task and escalates a terminal failure.
    pub fn spawn<F, Fut>(mut self, operation: F) -> JoinHandle<Result<()>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ControlFlow<()>>> + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.run(operation).await;
            if let Err(e) = &result {
                self.escalate(e);
            }
            result
        })
    }
}

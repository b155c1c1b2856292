//! Reconnect supervision.
//!
//! [`ReconnectMachine`] holds the pure transition rules. [`ReconnectSupervisor`]
//! runs one driver task that owns the machine, the retry countdown, and at most
//! one connect attempt at a time.

use std::sync::Arc;
use std::time::Duration;

use openagents_gateway_proto::Credentials;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{ConnectionState, GatewayConnection, LifecycleSignal, ProtocolSession};
use crate::error::{ConnectError, ConnectionFailure};

/// Fixed delay table indexed by consecutive failures; the last step repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffLadder {
    steps: Vec<Duration>,
}

impl Default for BackoffLadder {
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(60),
            ],
        }
    }
}

impl BackoffLadder {
    /// Steps are made non-decreasing; an empty table falls back to the default.
    #[must_use]
    pub fn new(steps: impl IntoIterator<Item = Duration>) -> Self {
        let mut ceiling = Duration::ZERO;
        let steps: Vec<Duration> = steps
            .into_iter()
            .map(|step| {
                ceiling = ceiling.max(step);
                ceiling
            })
            .collect();
        if steps.is_empty() {
            return Self::default();
        }
        Self { steps }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let index = usize::try_from(failures.saturating_sub(1)).unwrap_or(usize::MAX);
        self.steps
            .get(index)
            .or_else(|| self.steps.last())
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Attempting,
    Backoff,
    Ready,
    /// Automatic attempts stopped until `resume` or `retry_now`.
    Halted,
}

impl SupervisorPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Attempting => "attempting",
            Self::Backoff => "backoff",
            Self::Ready => "ready",
            Self::Halted => "halted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectState {
    pub attempt_count: u32,
    pub next_delay: Option<Duration>,
    pub cancelled: bool,
    pub last_error: Option<ConnectionFailure>,
}

#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    ladder: BackoffLadder,
    phase: SupervisorPhase,
    attempt_count: u32,
    next_delay: Option<Duration>,
    cancelled: bool,
    last_error: Option<ConnectionFailure>,
}

impl ReconnectMachine {
    #[must_use]
    pub fn new(ladder: BackoffLadder) -> Self {
        Self {
            ladder,
            phase: SupervisorPhase::Idle,
            attempt_count: 0,
            next_delay: None,
            cancelled: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> SupervisorPhase {
        self.phase
    }

    #[must_use]
    pub fn state(&self) -> ReconnectState {
        ReconnectState {
            attempt_count: self.attempt_count,
            next_delay: self.next_delay,
            cancelled: self.cancelled,
            last_error: self.last_error.clone(),
        }
    }

    /// New target: forget earlier failures and attempt.
    pub fn start(&mut self) {
        self.attempt_count = 0;
        self.last_error = None;
        self.cancelled = false;
        self.next_delay = None;
        self.phase = SupervisorPhase::Attempting;
    }

    /// Countdown elapsed. `false` when no attempt should be made.
    pub fn attempt_started(&mut self) -> bool {
        if self.phase != SupervisorPhase::Backoff || self.cancelled {
            return false;
        }
        self.phase = SupervisorPhase::Attempting;
        self.next_delay = None;
        true
    }

    pub fn succeeded(&mut self) {
        self.phase = SupervisorPhase::Ready;
        self.attempt_count = 0;
        self.next_delay = None;
        self.last_error = None;
    }

    /// Record a failed attempt. Returns the countdown to run, if any.
    pub fn failed(&mut self, failure: ConnectionFailure) -> Option<Duration> {
        self.last_error = Some(failure);
        self.attempt_count = self.attempt_count.saturating_add(1);
        if self.cancelled {
            self.phase = SupervisorPhase::Halted;
            self.next_delay = None;
            return None;
        }
        let delay = self.ladder.delay_for(self.attempt_count);
        self.phase = SupervisorPhase::Backoff;
        self.next_delay = Some(delay);
        Some(delay)
    }

    /// A live connection dropped. `true` means attempt right away.
    pub fn connection_lost(&mut self, failure: ConnectionFailure) -> bool {
        if self.phase != SupervisorPhase::Ready {
            return false;
        }
        self.last_error = Some(failure);
        if self.cancelled {
            self.phase = SupervisorPhase::Halted;
            return false;
        }
        self.phase = SupervisorPhase::Attempting;
        true
    }

    pub fn manual_close(&mut self) {
        self.phase = SupervisorPhase::Idle;
        self.attempt_count = 0;
        self.next_delay = None;
        self.cancelled = false;
    }

    /// Stop automatic attempts. A live connection stays up.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.next_delay = None;
        if matches!(
            self.phase,
            SupervisorPhase::Attempting | SupervisorPhase::Backoff
        ) {
            self.phase = SupervisorPhase::Halted;
        }
    }

    /// Lift a cancel. `true` means attempt right away.
    pub fn resume(&mut self) -> bool {
        self.cancelled = false;
        if self.phase != SupervisorPhase::Halted {
            return false;
        }
        self.phase = SupervisorPhase::Attempting;
        true
    }

    /// Skip the countdown. Ignored while an attempt is running or the link is up.
    pub fn retry_now(&mut self) -> bool {
        match self.phase {
            SupervisorPhase::Attempting | SupervisorPhase::Ready => false,
            SupervisorPhase::Idle | SupervisorPhase::Backoff | SupervisorPhase::Halted => {
                self.cancelled = false;
                self.next_delay = None;
                self.phase = SupervisorPhase::Attempting;
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorStatus {
    pub phase: SupervisorPhase,
    pub attempt_count: u32,
    pub next_delay: Option<Duration>,
    pub retry_at: Option<Instant>,
    pub cancelled: bool,
    pub last_error: Option<ConnectionFailure>,
    pub transport_url: Option<Url>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            phase: SupervisorPhase::Idle,
            attempt_count: 0,
            next_delay: None,
            retry_at: None,
            cancelled: false,
            last_error: None,
            transport_url: None,
        }
    }
}

enum Command {
    Start { url: String, credentials: Credentials },
    RetryNow,
    Cancel,
    Resume,
    Close,
}

type AttemptResult = (u64, Result<Arc<ProtocolSession>, ConnectError>);

/// Owns reconnection for one [`GatewayConnection`].
///
/// Dropping the supervisor stops its task but leaves the connection as is.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SupervisorStatus>,
    task: JoinHandle<()>,
}

impl ReconnectSupervisor {
    pub fn spawn(connection: GatewayConnection, ladder: BackoffLadder) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SupervisorStatus::default());
        let lifecycle = connection.lifecycle();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            connection,
            machine: ReconnectMachine::new(ladder),
            target: None,
            attempt_seq: 0,
            in_flight: None,
            retry_at: None,
            transport_url: None,
            results: results_tx,
            status: status_tx,
        };
        let task = tokio::spawn(driver.run(command_rx, results_rx, lifecycle));
        Self {
            commands,
            status,
            task,
        }
    }

    pub fn start(&self, url: impl Into<String>, credentials: Credentials) {
        self.send(Command::Start {
            url: url.into(),
            credentials,
        });
    }

    pub fn retry_now(&self) {
        self.send(Command::RetryNow);
    }

    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Manual disconnect; no automatic reconnect follows.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(target: "openagents.gateway", "reconnect supervisor is no longer running");
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver {
    connection: GatewayConnection,
    machine: ReconnectMachine,
    target: Option<(String, Credentials)>,
    attempt_seq: u64,
    in_flight: Option<u64>,
    retry_at: Option<Instant>,
    transport_url: Option<Url>,
    results: mpsc::UnboundedSender<AttemptResult>,
    status: watch::Sender<SupervisorStatus>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<AttemptResult>,
        mut lifecycle: broadcast::Receiver<LifecycleSignal>,
    ) {
        loop {
            let countdown = self.retry_at;
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle(command);
                }
                Some((seq, result)) = results.recv() => self.finish(seq, result),
                signal = lifecycle.recv() => match signal {
                    Ok(LifecycleSignal::Lost { failure }) => {
                        if self.machine.connection_lost(failure) {
                            info!(target: "openagents.gateway", "gateway connection lost; reconnecting");
                            self.launch();
                        }
                    }
                    Ok(LifecycleSignal::Ready(_) | LifecycleSignal::Closed) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "supervisor lagged behind lifecycle signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = sleep_until(countdown.unwrap_or_else(Instant::now)), if countdown.is_some() => {
                    self.retry_at = None;
                    if self.machine.attempt_started() {
                        self.launch();
                    }
                }
            }
            self.publish();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { url, credentials } => {
                if self.connection.state() != ConnectionState::Disconnected {
                    self.connection.close();
                }
                self.target = Some((url, credentials));
                self.retry_at = None;
                self.machine.start();
                self.launch();
            }
            Command::RetryNow => {
                if self.target.is_some() && self.machine.retry_now() {
                    info!(target: "openagents.gateway", "retrying gateway connection now");
                    self.retry_at = None;
                    self.launch();
                } else {
                    debug!(phase = self.machine.phase().as_str(), "retry-now ignored");
                }
            }
            Command::Cancel => {
                let attempting = self.in_flight.is_some();
                self.machine.cancel();
                self.retry_at = None;
                if attempting {
                    self.in_flight = None;
                    self.connection.close();
                }
                info!(target: "openagents.gateway", "automatic reconnect cancelled");
            }
            Command::Resume => {
                if self.target.is_some() && self.machine.resume() {
                    self.launch();
                }
            }
            Command::Close => {
                self.target = None;
                self.in_flight = None;
                self.retry_at = None;
                self.transport_url = None;
                self.machine.manual_close();
                self.connection.close();
            }
        }
    }

    fn launch(&mut self) {
        let Some((url, credentials)) = self.target.clone() else {
            self.machine.manual_close();
            return;
        };
        self.attempt_seq += 1;
        let seq = self.attempt_seq;
        self.in_flight = Some(seq);
        self.retry_at = None;
        let connection = self.connection.clone();
        let results = self.results.clone();
        debug!(seq, %url, "starting connect attempt");
        tokio::spawn(async move {
            let result = connection.connect(&url, credentials).await;
            let _ = results.send((seq, result));
        });
    }

    fn finish(&mut self, seq: u64, result: Result<Arc<ProtocolSession>, ConnectError>) {
        if self.in_flight != Some(seq) {
            debug!(seq, "discarding result of superseded connect attempt");
            if result.is_ok() && self.machine.phase() == SupervisorPhase::Halted {
                self.connection.close();
            }
            return;
        }
        self.in_flight = None;

        let failure = match result {
            Ok(session) if self.connection.state().is_ready() => {
                self.transport_url = Some(session.transport_url.clone());
                self.machine.succeeded();
                return;
            }
            Ok(_) => ConnectionFailure::Transport {
                message: "connection dropped right after handshake".to_string(),
            },
            Err(error) => ConnectionFailure::from(&error),
        };
        let code = failure.code().to_string();
        if let Some(delay) = self.machine.failed(failure) {
            self.retry_at = Some(Instant::now() + delay);
            warn!(
                target: "openagents.gateway",
                %code,
                attempt = self.machine.state().attempt_count,
                delay_ms = delay.as_millis(),
                "gateway connect failed; backing off"
            );
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        self.status.send_replace(SupervisorStatus {
            phase: self.machine.phase(),
            attempt_count: state.attempt_count,
            next_delay: state.next_delay,
            retry_at: self.retry_at,
            cancelled: state.cancelled,
            last_error: state.last_error,
            transport_url: self.transport_url.clone(),
        });
    }
}

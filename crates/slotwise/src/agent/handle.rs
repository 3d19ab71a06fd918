//! Actor wrapper around [`Agent`].
//!
//! The actor task owns the agent and runs one command at a time, so there
//! is never more than one session in flight. A check requested while the
//! agent is busy is coalesced into a no-op.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Agent, AgentStatus, CancelGate, CycleOutcome};
use crate::error::{Error, Result};
use crate::model::UpdateState;

const COMMAND_QUEUE: usize = 8;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Check(Reply<CycleOutcome>),
    Apply(Reply<CycleOutcome>),
    Cancel(Reply<bool>),
    Recover(Reply<Option<CycleOutcome>>),
}

/// Result of asking for a check or apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Another session was already running; nothing was started.
    Busy,
    /// The cycle ran to completion.
    Completed {
        /// How it ended.
        result: CycleOutcome,
    },
}

/// Cloneable handle to a running agent.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<Command>,
    health: mpsc::Sender<bool>,
    status: watch::Receiver<AgentStatus>,
    cancel: Arc<CancelGate>,
    busy: Arc<AtomicBool>,
}

impl Agent {
    /// Move the agent into an actor task.
    #[must_use]
    pub fn spawn(self) -> (AgentHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let busy = Arc::new(AtomicBool::new(false));
        let handle = AgentHandle {
            commands: tx,
            health: self.health_sender(),
            status: self.subscribe(),
            cancel: self.cancel_gate(),
            busy: Arc::clone(&busy),
        };
        let task = tokio::spawn(run_actor(self, rx, busy));
        (handle, task)
    }
}

async fn run_actor(mut agent: Agent, mut commands: mpsc::Receiver<Command>, busy: Arc<AtomicBool>) {
    debug!("Agent actor started");
    while let Some(command) = commands.recv().await {
        match command {
            Command::Check(reply) => {
                let result = agent.check_now().await;
                log_failure("check", &result);
                busy.store(false, Ordering::SeqCst);
                let _ = reply.send(result);
            }
            Command::Apply(reply) => {
                let result = agent.apply_staged().await;
                log_failure("apply", &result);
                busy.store(false, Ordering::SeqCst);
                let _ = reply.send(result);
            }
            Command::Recover(reply) => {
                let result = agent.recover().await;
                log_failure("recover", &result);
                busy.store(false, Ordering::SeqCst);
                let _ = reply.send(result);
            }
            Command::Cancel(reply) => {
                let _ = reply.send(agent.cancel().await);
            }
        }
    }
    debug!("Agent actor stopped");
}

fn log_failure<T>(what: &str, result: &Result<T>) {
    if let Err(err) = result {
        error!(operation = what, "Agent operation failed: {err}");
    }
}

fn actor_gone() -> Error {
    Error::internal("agent task has stopped")
}

impl AgentHandle {
    /// Claim the busy flag; false if a session is already running.
    fn try_begin(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| {
            self.busy.store(false, Ordering::SeqCst);
            actor_gone()
        })
    }

    /// Start a check without waiting for it. Returns `None` if the agent is
    /// busy, otherwise a receiver for the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor has stopped.
    pub async fn start_check(&self) -> Result<Option<oneshot::Receiver<Result<CycleOutcome>>>> {
        if !self.try_begin() {
            debug!("Check requested while busy; ignoring");
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Check(tx)).await?;
        Ok(Some(rx))
    }

    /// Run a check to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if local storage failed or the actor stopped.
    pub async fn check_now(&self) -> Result<CheckOutcome> {
        match self.start_check().await? {
            Some(rx) => completed(rx).await,
            None => Ok(CheckOutcome::Busy),
        }
    }

    /// Apply a staged update and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless an update is staged.
    pub async fn apply(&self) -> Result<CheckOutcome> {
        if !self.try_begin() {
            return Ok(CheckOutcome::Busy);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Apply(tx)).await?;
        completed(rx).await
    }

    /// Resume an interrupted session. Run once at startup, while the
    /// control API is already accepting health signals.
    ///
    /// # Errors
    ///
    /// Returns an error if local storage failed or the actor stopped.
    pub async fn recover(&self) -> Result<Option<CycleOutcome>> {
        if !self.try_begin() {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::Recover(tx)).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Ask for the current session to stop. Returns true only if the
    /// session will stop before `applying`, or a resting staged update was
    /// discarded; a session already past `staged` cannot be cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor stopped.
    pub async fn cancel(&self) -> Result<bool> {
        if self.busy.load(Ordering::SeqCst) {
            if self.cancel.request() {
                return Ok(true);
            }
            if self.busy.load(Ordering::SeqCst) {
                info!("Cancel ignored: no session can stop right now");
                return Ok(false);
            }
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel(tx))
            .await
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Deliver a health signal from the device's application.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor stopped.
    pub fn report_health(&self, healthy: bool) -> Result<()> {
        match self.health.try_send(healthy) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Health signal queue full; dropping signal");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(actor_gone()),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        self.status.borrow().clone()
    }

    /// Whether a session is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Wait until the agent reaches `state`.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or if the actor stopped.
    pub async fn wait_for_state(&self, state: UpdateState, timeout: Duration) -> Result<AgentStatus> {
        let mut rx = self.status.clone();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| s.state == state)
                .await
                .map(|s| s.clone())
        })
        .await;
        match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(actor_gone()),
            Err(_) => Err(Error::internal(format!("timed out waiting for state {state}"))),
        }
    }

    /// Check every `interval` until `shutdown` resolves. An interval of zero
    /// disables polling; the loop then only waits for shutdown.
    pub async fn poll(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        if interval.is_zero() {
            shutdown.await;
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    match self.check_now().await {
                        Ok(CheckOutcome::Completed { result }) => {
                            debug!(outcome = ?result, "Scheduled check finished");
                        }
                        Ok(CheckOutcome::Busy) => debug!("Scheduled check skipped; agent busy"),
                        Err(err) => error!("Scheduled check failed: {err}"),
                    }
                }
            }
        }
        info!("Polling stopped");
    }
}

async fn completed(rx: oneshot::Receiver<Result<CycleOutcome>>) -> Result<CheckOutcome> {
    let result = rx.await.map_err(|_| actor_gone())??;
    Ok(CheckOutcome::Completed { result })
}

//! The attach loop.
//!
//! The bridge keeps one agent session alive for as long as it runs. Failures
//! never escape: each one becomes an instrumentation event and another
//! attempt after a backoff delay.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tapwire_storage::{Backoff, Database, NewInstrumentationEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentConnector, AgentEvent, AgentSession, TcpAgentConnector};
use crate::error::{BridgeError, Result};
use crate::selector::TargetSelector;

/// Where the bridge is in its attach cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Attaching,
    Attached,
    AttachFailed,
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Agent address and target process.
    pub selector: TargetSelector,
    /// First retry delay.
    pub initial_backoff: Duration,
    /// Longest retry delay.
    pub max_backoff: Duration,
    /// Fraction each delay is randomly spread by.
    pub jitter: f64,
}

impl BridgeConfig {
    pub fn new(selector: TargetSelector) -> Self {
        Self {
            selector,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.2,
        }
    }

    /// Sets the retry schedule.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff).with_jitter(self.jitter)
    }
}

/// Turns agent callbacks into stored instrumentation events.
#[derive(Clone)]
pub struct InstrumentationBridge {
    config: BridgeConfig,
    connector: Arc<dyn AgentConnector>,
    db: Database,
}

impl InstrumentationBridge {
    /// Creates a bridge that reaches the agent over TCP.
    pub fn new(config: BridgeConfig, db: Database) -> Self {
        Self::with_connector(config, db, Arc::new(TcpAgentConnector::default()))
    }

    /// Creates a bridge with a custom agent transport.
    pub fn with_connector(
        config: BridgeConfig,
        db: Database,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        Self {
            config,
            connector,
            db,
        }
    }

    /// Records a hook callback as a successful event.
    pub async fn on_agent_event(
        &self,
        source_process_id: Option<i64>,
        hook_name: &str,
        payload: Value,
    ) -> Result<i64> {
        self.append(NewInstrumentationEvent::hook(
            source_process_id,
            hook_name,
            payload,
        ))
        .await
    }

    /// Starts the attach loop in the background.
    ///
    /// Attach failures are recorded and retried, never returned.
    pub fn start(self) -> BridgeHandle {
        let shutdown = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(BridgeState::Disconnected);

        info!(target = %self.config.selector, "Starting instrumentation bridge");
        let task = tokio::spawn(self.run(state_tx, shutdown.clone()));

        BridgeHandle {
            shutdown,
            state: state_rx,
            task,
        }
    }

    async fn run(self, state: watch::Sender<BridgeState>, shutdown: CancellationToken) {
        let mut backoff = self.config.backoff();

        while !shutdown.is_cancelled() {
            state.send_replace(BridgeState::Attaching);

            let attached = tokio::select! {
                attached = self.connector.attach(&self.config.selector) => attached,
                _ = shutdown.cancelled() => break,
            };

            match attached {
                Ok(session) => {
                    state.send_replace(BridgeState::Attached);
                    backoff.reset();
                    self.drive(session, &shutdown).await;
                }
                Err(e) => {
                    state.send_replace(BridgeState::AttachFailed);
                    self.record_attach_failure(&e).await;
                }
            }
            state.send_replace(BridgeState::Disconnected);

            let delay = backoff.next_delay();
            debug!("Next attach attempt in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        state.send_replace(BridgeState::Disconnected);
        info!("Instrumentation bridge stopped");
    }

    /// Records everything a session reports until it ends or the bridge stops.
    async fn drive(&self, mut session: Box<dyn AgentSession>, shutdown: &CancellationToken) {
        let pid = session.pid();
        let spawned = session.spawned();
        info!(process = session.process(), ?pid, spawned, "Agent attached");
        self.record(NewInstrumentationEvent::hook(
            pid,
            "attach",
            json!({
                "target": self.config.selector.to_string(),
                "process": session.process(),
                "spawned": spawned,
            }),
        ))
        .await;

        loop {
            let event = tokio::select! {
                event = session.next_event() => event,
                _ = shutdown.cancelled() => Some(AgentEvent::Detached {
                    reason: "bridge stopped".into(),
                }),
            };

            let Some(event) = event else { break };
            let done = matches!(event, AgentEvent::Detached { .. });

            match event {
                AgentEvent::Hook { hook_name, payload } => {
                    if let Err(e) = self.on_agent_event(pid, &hook_name, payload).await {
                        debug!(hook = %hook_name, "Hook event dropped: {}", e);
                    }
                }
                AgentEvent::ScriptError { description, stack } => {
                    warn!(?pid, "Agent script error: {}", description);
                    self.record(NewInstrumentationEvent::failure(
                        pid,
                        "script_error",
                        json!({ "description": description, "stack": stack }),
                    ))
                    .await;
                }
                AgentEvent::Malformed { line, error } => {
                    debug!(?pid, "Malformed agent output: {}", error);
                    self.record(NewInstrumentationEvent::failure(
                        pid,
                        "malformed",
                        json!({ "line": line, "error": error }),
                    ))
                    .await;
                }
                AgentEvent::Detached { reason } => {
                    info!(?pid, "Agent detached: {}", reason);
                    self.record(NewInstrumentationEvent::hook(
                        pid,
                        "detach",
                        json!({ "reason": reason }),
                    ))
                    .await;
                }
            }

            if done {
                break;
            }
        }
    }

    async fn record_attach_failure(&self, err: &BridgeError) {
        info!(target = %self.config.selector, "Agent attach failed: {}", err);
        self.record(NewInstrumentationEvent::failure(
            None,
            "attach",
            json!({
                "target": self.config.selector.to_string(),
                "error": err.to_string(),
                "unavailable": err.is_unavailable(),
            }),
        ))
        .await;
    }

    /// Appends an event, leaving failures to the store's own logging.
    async fn record(&self, event: NewInstrumentationEvent) {
        let _ = self.append(event).await;
    }

    async fn append(&self, event: NewInstrumentationEvent) -> Result<i64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.append_instrumentation(&event))
            .await
            .map_err(|e| BridgeError::Protocol(format!("store task failed: {e}")))?
            .map_err(BridgeError::from)
    }
}

/// Handle for a running bridge.
pub struct BridgeHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<BridgeState>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// The current state.
    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Signals the bridge to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stops the bridge and waits for the loop to exit.
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.task.await;
    }
}

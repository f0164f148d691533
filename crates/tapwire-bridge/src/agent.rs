//! Agent transport.
//!
//! The bridge only needs two things from an agent: attach to a process, then
//! hand over whatever the injected script reports. [`AgentConnector`] and
//! [`AgentSession`] capture that, and [`TcpAgentConnector`] implements it
//! over newline-delimited JSON.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::selector::TargetSelector;

/// Longest accepted agent line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Characters of an offending line kept in a malformed event.
const MALFORMED_SNIPPET: usize = 256;

/// Something the agent reported after attaching.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A hook fired inside the target process.
    Hook { hook_name: String, payload: Value },
    /// The injected script threw.
    ScriptError {
        description: String,
        stack: Option<String>,
    },
    /// Output that could not be understood.
    Malformed { line: String, error: String },
    /// The session ended.
    Detached { reason: String },
}

/// Opens sessions with an agent.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Attaches to the first available candidate process of `selector`.
    async fn attach(&self, selector: &TargetSelector) -> Result<Box<dyn AgentSession>>;
}

/// An attached agent session.
#[async_trait]
pub trait AgentSession: Send {
    /// The attached process.
    fn pid(&self) -> Option<i64>;

    /// The attached process name.
    fn process(&self) -> &str;

    /// Whether the agent launched the process for this session.
    fn spawned(&self) -> bool {
        false
    }

    /// Waits for the next event. Returns `None` once the session is over;
    /// the last event before that is always [`AgentEvent::Detached`].
    async fn next_event(&mut self) -> Option<AgentEvent>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage<'a> {
    Attach { process: &'a str },
    /// Launch, attach, then resume.
    Spawn { process: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentMessage {
    Attached {
        #[serde(default)]
        pid: Option<i64>,
    },
    Spawned {
        #[serde(default)]
        pid: Option<i64>,
    },
    Unavailable {
        #[serde(default)]
        description: Option<String>,
    },
    Error {
        #[serde(default)]
        description: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Send {
        payload: Value,
    },
    Detached {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Connects to an agent listening on TCP.
#[derive(Debug, Clone)]
pub struct TcpAgentConnector {
    connect_timeout: Duration,
    max_line_length: usize,
}

impl Default for TcpAgentConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), DEFAULT_MAX_LINE_LENGTH)
    }
}

impl TcpAgentConnector {
    /// `connect_timeout` also bounds each attach answer.
    pub fn new(connect_timeout: Duration, max_line_length: usize) -> Self {
        Self {
            connect_timeout,
            max_line_length,
        }
    }

    async fn request(
        &self,
        framed: &mut Framed<TcpStream, LinesCodec>,
        message: &ClientMessage<'_>,
    ) -> Result<AgentMessage> {
        let line =
            serde_json::to_string(message).map_err(|e| BridgeError::Protocol(e.to_string()))?;
        framed.send(line).await.map_err(codec_error)?;
        self.read_answer(framed).await
    }

    async fn read_answer(
        &self,
        framed: &mut Framed<TcpStream, LinesCodec>,
    ) -> Result<AgentMessage> {
        let line = tokio::time::timeout(self.connect_timeout, framed.next())
            .await
            .map_err(|_| BridgeError::Timeout(self.connect_timeout))?
            .ok_or_else(|| BridgeError::Protocol("agent closed the connection".into()))?
            .map_err(codec_error)?;

        serde_json::from_str(&line).map_err(|e| BridgeError::Protocol(format!("bad answer: {e}")))
    }
}

#[async_trait]
impl AgentConnector for TcpAgentConnector {
    async fn attach(&self, selector: &TargetSelector) -> Result<Box<dyn AgentSession>> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((selector.host.as_str(), selector.port)),
        )
        .await
        .map_err(|_| BridgeError::Timeout(self.connect_timeout))??;

        let codec = LinesCodec::new_with_max_length(self.max_line_length);
        let mut framed = Framed::new(stream, codec);

        let candidates = selector.candidates();
        for process in &candidates {
            match self
                .request(&mut framed, &ClientMessage::Attach { process })
                .await?
            {
                AgentMessage::Attached { pid } => {
                    return Ok(Box::new(TcpAgentSession::new(framed, pid, process, false)));
                }
                AgentMessage::Unavailable { description } => {
                    debug!(
                        process = %process,
                        "Process not available: {}",
                        description.as_deref().unwrap_or("not running")
                    );
                }
                AgentMessage::Error { description, .. } => {
                    return Err(BridgeError::Attach(format!("{process}: {description}")));
                }
                other => {
                    return Err(BridgeError::Protocol(format!(
                        "unexpected answer to attach: {other:?}"
                    )));
                }
            }
        }

        let Some(process) = selector.spawn_fallback() else {
            return Err(BridgeError::Unavailable(candidates.join(", ")));
        };

        debug!(process, "No candidate running, asking the agent to spawn one");
        match self
            .request(&mut framed, &ClientMessage::Spawn { process })
            .await?
        {
            AgentMessage::Spawned { pid } | AgentMessage::Attached { pid } => {
                Ok(Box::new(TcpAgentSession::new(framed, pid, process, true)))
            }
            AgentMessage::Unavailable { description } => Err(BridgeError::Unavailable(format!(
                "{}; spawning {process}: {}",
                candidates.join(", "),
                description.as_deref().unwrap_or("not installed")
            ))),
            AgentMessage::Error { description, .. } => Err(BridgeError::Attach(format!(
                "spawning {process}: {description}"
            ))),
            other => Err(BridgeError::Protocol(format!(
                "unexpected answer to spawn: {other:?}"
            ))),
        }
    }
}

/// A session over a line-framed TCP stream.
pub struct TcpAgentSession {
    framed: Framed<TcpStream, LinesCodec>,
    pid: Option<i64>,
    process: String,
    spawned: bool,
    finished: bool,
}

impl TcpAgentSession {
    fn new(
        framed: Framed<TcpStream, LinesCodec>,
        pid: Option<i64>,
        process: &str,
        spawned: bool,
    ) -> Self {
        Self {
            framed,
            pid,
            process: process.to_string(),
            spawned,
            finished: false,
        }
    }

    fn detached(&mut self, reason: impl Into<String>) -> AgentEvent {
        self.finished = true;
        AgentEvent::Detached {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AgentSession for TcpAgentSession {
    fn pid(&self) -> Option<i64> {
        self.pid
    }

    fn process(&self) -> &str {
        &self.process
    }

    fn spawned(&self) -> bool {
        self.spawned
    }

    async fn next_event(&mut self) -> Option<AgentEvent> {
        if self.finished {
            return None;
        }

        loop {
            let line = match self.framed.next().await {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    // The codec stops after an error, so this ends the session.
                    return Some(AgentEvent::Malformed {
                        line: String::new(),
                        error: "line exceeds maximum length".into(),
                    });
                }
                Some(Err(LinesCodecError::Io(e))) => return Some(self.detached(e.to_string())),
                None => return Some(self.detached("connection closed")),
            };

            if line.trim().is_empty() {
                continue;
            }

            return Some(match serde_json::from_str::<AgentMessage>(&line) {
                Ok(AgentMessage::Send { payload }) => {
                    match payload.get("type").and_then(Value::as_str) {
                        Some(hook_name) => AgentEvent::Hook {
                            hook_name: hook_name.to_string(),
                            payload,
                        },
                        None => malformed(&line, "send payload has no type"),
                    }
                }
                Ok(AgentMessage::Error { description, stack }) => {
                    AgentEvent::ScriptError { description, stack }
                }
                Ok(AgentMessage::Detached { reason }) => {
                    self.detached(reason.unwrap_or_else(|| "detached".into()))
                }
                Ok(other) => malformed(&line, &format!("unexpected message {other:?}")),
                Err(e) => malformed(&line, &e.to_string()),
            });
        }
    }
}

fn malformed(line: &str, error: &str) -> AgentEvent {
    AgentEvent::Malformed {
        line: line.chars().take(MALFORMED_SNIPPET).collect(),
        error: error.to_string(),
    }
}

fn codec_error(err: LinesCodecError) -> BridgeError {
    match err {
        LinesCodecError::Io(e) => BridgeError::Connect(e),
        LinesCodecError::MaxLineLengthExceeded => {
            BridgeError::Protocol("line exceeds maximum length".into())
        }
    }
}

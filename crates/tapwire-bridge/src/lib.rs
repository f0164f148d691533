//! Tapwire Bridge - instrumentation agent connection.
//!
//! Keeps a best-effort session with a dynamic-instrumentation agent running
//! next to the target browser, and stores every callback it reports as an
//! instrumentation event.
//!
//! The bridge never fails its caller. An agent that is missing, refuses to
//! attach, or talks nonsense shows up in the store as `success = false`
//! events while the bridge keeps retrying with capped exponential backoff.
//!
//! ```no_run
//! use tapwire_bridge::{BridgeConfig, InstrumentationBridge, TargetSelector};
//! use tapwire_storage::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new()?;
//! let selector: TargetSelector = "tcp://127.0.0.1:27042".parse()?;
//! let handle = InstrumentationBridge::new(BridgeConfig::new(selector), db).start();
//! // ...
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

mod agent;
mod bridge;
mod error;
mod selector;

pub use agent::{
    AgentConnector, AgentEvent, AgentSession, TcpAgentConnector, TcpAgentSession,
    DEFAULT_MAX_LINE_LENGTH,
};
pub use bridge::{BridgeConfig, BridgeHandle, BridgeState, InstrumentationBridge};
pub use error::{BridgeError, Result};
pub use selector::{TargetSelector, DEFAULT_CANDIDATES, DEFAULT_SPAWN_PROCESS};

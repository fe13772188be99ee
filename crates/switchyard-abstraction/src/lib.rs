//! Engine abstraction layer for Switchyard.
//!
//! This crate defines the contract every pluggable execution backend implements,
//! the input/state types passed across it, and the cancellation token engines
//! consult while they work.

pub mod cancellation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub use cancellation::{
    CancellationError, CancellationToken, LoopExit, Step, TokenState, with_cancellation,
};

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Represents an error reported by an engine.
///
/// These are domain errors: the orchestrator passes them through to the caller
/// untouched and counts them against the engine's error counter.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    /// The engine rejected the input it was given.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The engine failed to initialize its state.
    #[error("Engine initialization failed: {0}")]
    Init(String),

    /// The engine failed while executing a request.
    #[error("Engine execution failed: {0}")]
    Failed(String),

    /// The engine observed a cancelled token and stopped early.
    #[error("Engine execution cancelled")]
    Cancelled,

    /// An opaque, structured reason supplied by the engine.
    #[error("Engine error: {0}")]
    Other(Value),
}

impl From<CancellationError> for EngineError {
    fn from(_: CancellationError) -> Self {
        Self::Cancelled
    }
}

/// Input handed to an engine for a single request.
#[derive(Debug, Clone, Default)]
pub struct EngineInput {
    /// The request payload. Its shape is defined by the engine.
    pub payload: Value,
    /// Optional correlation key tying the request to a conversation.
    pub conversation_id: Option<String>,
    /// Optional cancellation token shared with the caller.
    pub cancellation: Option<CancellationToken>,
    /// Arbitrary caller metadata, recorded with the task.
    pub metadata: HashMap<String, Value>,
}

impl EngineInput {
    /// Creates a new input with the given payload.
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self { payload, ..Self::default() }
    }

    /// Sets the conversation id.
    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns `true` if the attached token has been cancelled.
    ///
    /// Inputs without a token are never cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Private state produced by [`Engine::init`] and owned by a single worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// The opaque configuration the engine was initialized with.
    pub config: Value,
    /// Engine-defined data derived during initialization.
    #[serde(default)]
    pub data: Value,
}

impl EngineState {
    /// Creates state holding the given configuration.
    #[must_use]
    pub fn new(config: Value) -> Self {
        Self { config, data: Value::Null }
    }

    /// Sets the engine-defined data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// The contract every pluggable execution backend implements.
///
/// Engines must be `Send + Sync`: a single handle is shared by every worker in
/// the engine's pool, while each worker owns the [`EngineState`] it got from
/// [`Engine::init`].
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns the capability tags this engine advertises.
    ///
    /// Engines that do not advertise anything are registered under no capability.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Initializes worker state from the engine's opaque configuration.
    ///
    /// # Errors
    /// Returns an `EngineError` if the engine cannot start. Pool startup is
    /// aborted and the error is reported to the caller.
    async fn init(&self, config: &Value) -> EngineResult<EngineState> {
        Ok(EngineState::new(config.clone()))
    }

    /// Executes a single request.
    ///
    /// # Arguments
    /// * `input` - The request input
    /// * `state` - The worker's private state
    ///
    /// # Errors
    /// Returns an `EngineError` describing the domain failure.
    async fn execute(&self, input: EngineInput, state: &EngineState) -> EngineResult<Value>;
}

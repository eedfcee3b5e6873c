//! Per-payment state machine.
//!
//! Every outgoing payment owns a [`PaymentState`] that walks an ordered queue
//! of plugin names: `INITIAL -> IN_PROGRESS -> {COMPLETED | FAILED}`, with
//! `CANCELLED` reachable from any non-terminal state. Terminal states are
//! absorbing. The machine itself is pure; persistence happens in the owning
//! payment object after each transition.

use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// State-machine transition errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid transition from state {0}")]
    InvalidState(InternalState),

    #[error("plugin {0} is still in progress")]
    PluginInProgress(String),

    #[error("no plugin is currently engaged")]
    NoCurrentPlugin,
}

/// Lifecycle state of a single payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalState {
    Initial,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl InternalState {
    /// Terminal states are absorbing.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            InternalState::Completed | InternalState::Failed | InternalState::Cancelled
        )
    }
}

impl fmt::Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InternalState::Initial => "INITIAL",
            InternalState::InProgress => "IN_PROGRESS",
            InternalState::Completed => "COMPLETED",
            InternalState::Failed => "FAILED",
            InternalState::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single plugin attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginRunState {
    Submitted,
    Failed,
    Success,
}

/// Record of one plugin attempt against a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRun {
    pub name: String,
    /// Epoch ms the attempt was engaged.
    pub start_at: u64,
    /// Epoch ms the attempt settled, `None` while submitted.
    pub end_at: Option<u64>,
    pub state: PluginRunState,
}

impl PluginRun {
    fn submitted(name: String) -> Self {
        Self {
            name,
            start_at: now_ms(),
            end_at: None,
            state: PluginRunState::Submitted,
        }
    }

    fn settle(mut self, state: PluginRunState) -> Self {
        self.end_at = Some(now_ms());
        self.state = state;
        self
    }
}

/// Retry state machine for one payment.
///
/// Invariant: `pending_plugins ∪ current_plugin ∪ tried_plugins` (by name) is
/// always a permutation of the sending priority the machine was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentState {
    pub internal_state: InternalState,
    /// Plugins not yet attempted, in priority order.
    pub pending_plugins: VecDeque<String>,
    /// Plugins that were attempted and failed.
    pub tried_plugins: Vec<PluginRun>,
    /// The attempt currently in flight, if any.
    pub current_plugin: Option<PluginRun>,
    /// The attempt that completed the payment, if any.
    pub completed_by_plugin: Option<PluginRun>,
}

impl PaymentState {
    /// Fresh machine over a sending priority.
    pub fn new(sending_priority: Vec<String>) -> Self {
        Self {
            internal_state: InternalState::Initial,
            pending_plugins: sending_priority.into(),
            tried_plugins: Vec::new(),
            current_plugin: None,
            completed_by_plugin: None,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.internal_state == InternalState::Initial
    }

    pub fn is_in_progress(&self) -> bool {
        self.internal_state == InternalState::InProgress
    }

    pub fn is_failed(&self) -> bool {
        self.internal_state == InternalState::Failed
    }

    pub fn is_final(&self) -> bool {
        self.internal_state.is_final()
    }

    /// Combined driver: engage the next pending plugin, or fail the payment
    /// when the queue is exhausted.
    ///
    /// Returns `true` if a plugin was engaged, `false` if the payment moved
    /// to `FAILED`. Errors with [`StateError::PluginInProgress`] while an
    /// attempt is still in flight.
    pub fn process(&mut self) -> Result<bool, StateError> {
        match self.internal_state {
            InternalState::Initial | InternalState::InProgress => {}
            s => return Err(StateError::InvalidState(s)),
        }
        if let Some(current) = &self.current_plugin {
            return Err(StateError::PluginInProgress(current.name.clone()));
        }

        match self.pending_plugins.pop_front() {
            Some(name) => {
                self.internal_state = InternalState::InProgress;
                self.current_plugin = Some(PluginRun::submitted(name));
                Ok(true)
            }
            None => {
                self.internal_state = InternalState::Failed;
                Ok(false)
            }
        }
    }

    /// Engage the next pending plugin; requires the machine to already be
    /// `IN_PROGRESS` with no attempt in flight.
    pub fn try_next(&mut self) -> Result<bool, StateError> {
        if self.internal_state != InternalState::InProgress {
            return Err(StateError::InvalidState(self.internal_state));
        }
        self.process()
    }

    /// Record the in-flight attempt as failed and clear it. The machine
    /// stays `IN_PROGRESS`; the caller drives the next attempt.
    pub fn fail_current_plugin(&mut self) -> Result<(), StateError> {
        if self.internal_state != InternalState::InProgress {
            return Err(StateError::InvalidState(self.internal_state));
        }
        let current = self.current_plugin.take().ok_or(StateError::NoCurrentPlugin)?;
        self.tried_plugins.push(current.settle(PluginRunState::Failed));
        Ok(())
    }

    /// Complete the payment with the in-flight attempt.
    pub fn complete(&mut self) -> Result<(), StateError> {
        if self.internal_state != InternalState::InProgress {
            return Err(StateError::InvalidState(self.internal_state));
        }
        let current = self.current_plugin.take().ok_or(StateError::NoCurrentPlugin)?;
        self.completed_by_plugin = Some(current.settle(PluginRunState::Success));
        self.internal_state = InternalState::Completed;
        Ok(())
    }

    /// Cancel from any non-terminal state.
    pub fn cancel(&mut self) -> Result<(), StateError> {
        match self.internal_state {
            InternalState::Initial | InternalState::InProgress => {
                self.internal_state = InternalState::Cancelled;
                Ok(())
            }
            s => Err(StateError::InvalidState(s)),
        }
    }
}

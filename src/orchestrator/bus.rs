//! Event bus
//!
//! Broadcasts agent communication and pipeline progress events to any
//! number of subscribers and keeps a bounded history for late readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::orchestrator::pipeline::PipelineStage;
use crate::registry::Capability;

const CHANNEL_CAPACITY: usize = 256;

/// Event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A tool invocation was dispatched
    AgentCall {
        tool: String,
        agent_id: String,
        capability: Capability,
        /// Agent that asked for the call, if any
        requester: Option<String>,
    },
    /// A tool invocation returned
    AgentResponse {
        tool: String,
        agent_id: String,
        capability: Capability,
        requester: Option<String>,
        duration_ms: u64,
    },
    /// A tool invocation failed or could not be dispatched
    AgentError {
        target: String,
        agent_id: Option<String>,
        error: String,
    },
    PoolSpawned {
        pool_id: String,
        pool_type: String,
        size: usize,
    },
    PoolTerminated {
        pool_id: String,
        pool_type: String,
    },
    StageChanged {
        pipeline_id: String,
        from: PipelineStage,
        to: PipelineStage,
    },
    EscalationRaised {
        pipeline_id: String,
        ticket_id: String,
        conflicts: usize,
    },
    /// The pipeline reached a terminal stage or paused for approval
    PipelineSettled {
        pipeline_id: String,
        stage: PipelineStage,
    },
}

/// A timestamped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Communication bus for orchestration events
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: Mutex<VecDeque<Event>>,
    history_limit: usize,
}

impl EventBus {
    /// Create a new event bus keeping at most `history_limit` past events
    pub fn new(history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    /// Record and broadcast an event. Never fails: with no subscribers the
    /// event only lands in the history.
    pub fn emit(&self, kind: EventKind) {
        let event = Event {
            timestamp: Utc::now(),
            kind,
        };

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(event.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        let _ = self.tx.send(event);
    }

    /// Receive all events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Most recent events, oldest first
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

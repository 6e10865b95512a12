//! Events flowing out of the supervisor.
//!
//! Two kinds live here. The internal messages (`ProcessEvent`, `HealthSignal`,
//! `RestartDue`) travel over dedicated mpsc channels from a component to the
//! orchestrator, so every dependency between components is a typed channel.
//! `DomainEvent` is the outward-facing notification published on the
//! [`EventBus`] for whatever push layer sits on top.

use crate::types::{LogRecord, ResourceSample, ServerId, ServerStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

/// Lifecycle notifications emitted by the process supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// The process exited. `expected` is true when a stop was requested first.
    Exited {
        server_id: ServerId,
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
        expected: bool,
        /// Spawned by an automatic restart rather than a start request
        restarted: bool,
        uptime: Duration,
    },
    /// Waiting on the process failed; its state is unknown
    Failed {
        server_id: ServerId,
        pid: u32,
        error: String,
    },
}

/// Signals emitted by the health checker
#[derive(Debug, Clone, PartialEq)]
pub enum HealthSignal {
    /// Health flipped between healthy and unhealthy (or was first established)
    Changed { server_id: ServerId, healthy: bool },
    /// The failure threshold was reached within the sliding window
    Unhealthy {
        server_id: ServerId,
        consecutive_failures: u32,
    },
}

/// A scheduled restart timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDue {
    pub server_id: ServerId,
    pub attempt: u32,
}

/// Named events published for external subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DomainEvent {
    StatusChanged {
        server_id: ServerId,
        from: ServerStatus,
        to: ServerStatus,
    },
    ProcessStarted {
        server_id: ServerId,
        pid: u32,
    },
    ProcessStopped {
        server_id: ServerId,
        pid: Option<u32>,
    },
    ProcessError {
        server_id: ServerId,
        error: String,
    },
    ProcessRestarted {
        server_id: ServerId,
        pid: u32,
        attempt: u32,
    },
    RestartScheduled {
        server_id: ServerId,
        attempt: u32,
        delay_ms: u64,
    },
    RestartExhausted {
        server_id: ServerId,
        attempts: u32,
    },
    HealthChanged {
        server_id: ServerId,
        healthy: bool,
    },
    HealthEscalated {
        server_id: ServerId,
        consecutive_failures: u32,
    },
    ResourceSample(ResourceSample),
    LogEntry(LogRecord),
}

/// Broadcasts domain events to any number of subscribers.
///
/// Publishing never waits for a subscriber; with nobody listening the event is
/// simply dropped, and slow subscribers lose the oldest events once `capacity`
/// is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: DomainEvent) {
        // Err only means there are no receivers right now
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

//! Event definitions for the supervisor's consumer loop.
//!
//! This module defines the `Event` enum carrying both frontend requests and
//! worker messages onto the single ordered channel the supervisor drains, and
//! the `Notification` enum the supervisor emits back to the frontend. Worker
//! messages are tagged with the start cycle that produced them so the
//! supervisor can discard events from a cancelled cycle.

use crate::service::{CycleId, ServiceState};

/// Three-way classification of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// Connection refused or any other network-level failure: the service
    /// has not started listening yet.
    NotListening,
    /// The service answered with a 5xx status.
    ServerError { status: u16 },
    /// The service answered with anything below 500.
    Healthy,
}

/// An event on the supervisor's single ordered delivery channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// Frontend asked for the service to start (also restart from error).
    StartRequested { name: String },
    /// Frontend asked for the service to stop.
    StopRequested { name: String },
    /// Frontend asked for the service to be removed entirely.
    RemoveRequested { name: String },
    /// Start worker: the process survived the probation window.
    Survived { name: String, cycle: CycleId },
    /// Start worker: sync, launch, or probation failed; `advisory` carries
    /// the diagnosis shown to the user.
    StartFailed {
        name: String,
        cycle: CycleId,
        advisory: String,
    },
    /// Crash monitor: the process exited after it had been running.
    Exited {
        name: String,
        cycle: CycleId,
        log_tail: String,
    },
    /// Health loop: result of one HTTP probe.
    Health {
        name: String,
        cycle: CycleId,
        signal: HealthSignal,
    },
    /// Stop every service and end the supervisor loop.
    Shutdown,
}

/// A state or health change the frontend should render.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The service's canonical state changed; `advisory` is empty unless
    /// there is a diagnosis to show.
    State {
        name: String,
        state: ServiceState,
        advisory: String,
    },
    /// A health probe result for a running service. `advisory` is a
    /// presentation overlay (port mismatch hint, error diagnosis) and does
    /// not reflect a state change.
    Health {
        name: String,
        signal: HealthSignal,
        advisory: String,
    },
    /// The service was removed and its runtime destroyed.
    Removed { name: String },
}

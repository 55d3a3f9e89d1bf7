//! HTTP health probing.
//!
//! A health loop runs per service while it is RUNNING and a URL is
//! configured: one GET per interval, classified into a three-way signal and
//! emitted onto the supervisor's event channel. The loop never transitions
//! state itself and exits at the first cancellation check after its cycle is
//! cancelled.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::{Event, HealthSignal};
use crate::service::Cycle;

/// Classifies one probe outcome. Any network-level failure (refused, DNS,
/// timeout) means the service is not listening yet; 5xx means it is up but
/// erroring; anything below 500 counts as healthy — a 404 still proves the
/// service is alive and answering.
pub fn classify(status: Option<u16>) -> HealthSignal {
    match status {
        None => HealthSignal::NotListening,
        Some(code) if code >= 500 => HealthSignal::ServerError { status: code },
        Some(_) => HealthSignal::Healthy,
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> HealthSignal {
    match client.get(url).send().await {
        Ok(response) => classify(Some(response.status().as_u16())),
        Err(err) => {
            debug!(url, error = %err, "health probe failed");
            classify(None)
        }
    }
}

/// Spawns the health loop for one start cycle. Probes immediately, then once
/// per `interval`; stops as soon as the cycle is cancelled.
pub fn spawn_health_loop(
    name: String,
    url: String,
    cycle: Cycle,
    tx: mpsc::Sender<Event>,
    interval: Duration,
    request_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(request_timeout).build() {
            Ok(client) => client,
            Err(err) => {
                debug!(service = %name, error = %err, "failed to build health client");
                return;
            }
        };
        loop {
            if cycle.is_cancelled() {
                return;
            }
            let signal = probe(&client, &url).await;
            let event = Event::Health {
                name: name.clone(),
                cycle: cycle.id,
                signal,
            };
            if tx.send(event).await.is_err() {
                return;
            }
            tokio::select! {
                _ = cycle.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

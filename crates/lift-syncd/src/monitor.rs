//! Connectivity and backend-availability tracking.
//!
//! Having a network link does not mean the backend answers: a suspended
//! backend can take several seconds to wake up. The monitor therefore only
//! reports [`Availability::OnlineReady`] after a health probe succeeded, and
//! keeps probing at a fixed interval until it does.

use crate::error::SyncResult;
use crate::gateway::Gateway;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Availability {
    Offline,
    OnlineUnknown,
    OnlineReady,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Availability::Offline => "offline",
            Availability::OnlineUnknown => "online (backend not ready)",
            Availability::OnlineReady => "online",
        })
    }
}

/// What the platform reports about the network link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    StateChanged(Availability),
    /// A health probe succeeded; the backend takes requests now
    BackendReady,
}

/// Lightweight liveness check against the backend
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// HTTP status of the health endpoint
    async fn probe(&self, timeout: Duration) -> SyncResult<u16>;
}

#[async_trait]
impl HealthCheck for Gateway {
    async fn probe(&self, timeout: Duration) -> SyncResult<u16> {
        self.health(timeout).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

struct Running {
    connectivity: mpsc::UnboundedSender<ConnectivityEvent>,
    task: JoinHandle<()>,
}

pub struct AvailabilityMonitor {
    health: Arc<dyn HealthCheck>,
    settings: ProbeSettings,
    state: Arc<watch::Sender<Availability>>,
    events: broadcast::Sender<MonitorEvent>,
    link_up: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl AvailabilityMonitor {
    pub fn new(health: Arc<dyn HealthCheck>, settings: ProbeSettings) -> Self {
        let (state, _) = watch::channel(Availability::Offline);
        let (events, _) = broadcast::channel(32);
        Self {
            health,
            settings,
            state: Arc::new(state),
            events,
            link_up: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Spawn the monitor task. Calling it while running does nothing.
    /// If the link was last reported up, probing starts right away.
    pub fn start(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.link_up.load(Ordering::SeqCst) {
            let _ = tx.send(ConnectivityEvent::Up);
        }
        let task = tokio::spawn(run(
            rx,
            self.health.clone(),
            self.settings,
            self.state.clone(),
            self.events.clone(),
        ));
        *running = Some(Running {
            connectivity: tx,
            task,
        });
    }

    /// Stop probing and report offline. Returns once the task is aborted.
    pub fn stop(&self) {
        let taken = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(running) = taken {
            running.task.abort();
            tracing::debug!("availability monitor stopped");
        }
        self.publish(Availability::Offline);
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.task.is_finished()))
            .unwrap_or(false)
    }

    pub fn connectivity_changed(&self, event: ConnectivityEvent) {
        self.link_up
            .store(event == ConnectivityEvent::Up, Ordering::SeqCst);
        if let Ok(running) = self.running.lock() {
            if let Some(running) = running.as_ref() {
                let _ = running.connectivity.send(event);
            }
        }
    }

    pub fn state(&self) -> Availability {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Availability> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn publish(&self, next: Availability) {
        set_state(&self.state, &self.events, next);
    }
}

impl Drop for AvailabilityMonitor {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.task.abort();
            }
        }
    }
}

fn set_state(
    state: &watch::Sender<Availability>,
    events: &broadcast::Sender<MonitorEvent>,
    next: Availability,
) {
    let previous = state.send_replace(next);
    if previous != next {
        tracing::info!("availability: {previous} -> {next}");
        let _ = events.send(MonitorEvent::StateChanged(next));
    }
}

async fn run(
    mut connectivity: mpsc::UnboundedReceiver<ConnectivityEvent>,
    health: Arc<dyn HealthCheck>,
    settings: ProbeSettings,
    state: Arc<watch::Sender<Availability>>,
    events: broadcast::Sender<MonitorEvent>,
) {
    // Deadline of the next probe; None while offline or ready.
    let mut next_probe: Option<Instant> = None;

    loop {
        let deadline = next_probe.unwrap_or_else(Instant::now);
        tokio::select! {
            event = connectivity.recv() => match event {
                None => break,
                Some(ConnectivityEvent::Down) => {
                    next_probe = None;
                    set_state(&state, &events, Availability::Offline);
                }
                Some(ConnectivityEvent::Up) => {
                    if *state.borrow() == Availability::Offline {
                        set_state(&state, &events, Availability::OnlineUnknown);
                        next_probe = Some(Instant::now());
                    }
                }
            },
            healthy = probe_at(deadline, health.as_ref(), settings.timeout), if next_probe.is_some() => {
                if healthy {
                    next_probe = None;
                    set_state(&state, &events, Availability::OnlineReady);
                    let _ = events.send(MonitorEvent::BackendReady);
                } else {
                    tracing::debug!("backend not ready, probing again in {:?}", settings.interval);
                    set_state(&state, &events, Availability::OnlineUnknown);
                    next_probe = Some(Instant::now() + settings.interval);
                }
            }
        }
    }
}

async fn probe_at(deadline: Instant, health: &dyn HealthCheck, timeout: Duration) -> bool {
    sleep_until(deadline).await;
    match tokio::time::timeout(timeout, health.probe(timeout)).await {
        Ok(Ok(status)) if status < 500 => true,
        Ok(Ok(status)) => {
            tracing::debug!("health probe answered {status}");
            false
        }
        Ok(Err(e)) => {
            tracing::debug!("health probe failed: {e}");
            false
        }
        Err(_) => {
            tracing::debug!("health probe timed out after {timeout:?}");
            false
        }
    }
}

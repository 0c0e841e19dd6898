use crate::monitor::{AvailabilityMonitor, ConnectivityEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Stands in for a platform connectivity service: checks that the backend
/// host accepts TCP connections and reports link changes to the monitor.
pub struct LinkWatcher {
    task: JoinHandle<()>,
}

impl LinkWatcher {
    /// Returns `None` when the base URL names no host to watch.
    pub fn spawn(base_url: &str, interval: Duration, monitor: Arc<AvailabilityMonitor>) -> Option<Self> {
        let address = host_and_port(base_url)?;
        tracing::debug!("watching link to {address} every {interval:?}");
        let task = tokio::spawn(watch_link(address, interval, monitor));
        Some(Self { task })
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for LinkWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn host_and_port(base_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

async fn watch_link(address: String, interval: Duration, monitor: Arc<AvailabilityMonitor>) {
    let mut last: Option<ConnectivityEvent> = None;
    loop {
        let reachable = matches!(
            tokio::time::timeout(interval, TcpStream::connect(&address)).await,
            Ok(Ok(_))
        );
        let event = if reachable {
            ConnectivityEvent::Up
        } else {
            ConnectivityEvent::Down
        };
        if last != Some(event) {
            tracing::info!("link to {address}: {event:?}");
            monitor.connectivity_changed(event);
            last = Some(event);
        }
        tokio::time::sleep(interval).await;
    }
}
